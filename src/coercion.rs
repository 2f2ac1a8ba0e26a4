use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Whether an operator takes part in the adaptation of proposal sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoercionMode {
    /// Follow [`CoercionSettings::enabled_by_default`].
    #[default]
    Default,
    /// Always adapt, unless a chunk disables coercion.
    On,
    /// Never adapt.
    Off,
}

impl CoercionMode {
    pub fn is_active(self, enabled_by_default: bool) -> bool {
        match self {
            CoercionMode::Default => enabled_by_default,
            CoercionMode::On => true,
            CoercionMode::Off => false,
        }
    }
}

/// Bijection between the unconstrained coercible value and the raw tuning
/// value of an operator.
///
/// Both transforms are strictly monotonic. Increasing the coercible value
/// always makes the proposal bolder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoercionTransform {
    /// `raw = exp(v)`, for positive window widths and step sizes.
    Log,
    /// `raw = 1 / (1 + exp(v))`, for scale factors in `(0, 1)`.
    ///
    /// Smaller scale factors give larger moves, so the raw value decreases in `v`.
    InverseLogit,
}

impl CoercionTransform {
    pub fn name(self) -> &'static str {
        match self {
            CoercionTransform::Log => "log",
            CoercionTransform::InverseLogit => "inverse-logit",
        }
    }

    pub fn to_raw(self, value: f64) -> f64 {
        match self {
            CoercionTransform::Log => value.exp(),
            CoercionTransform::InverseLogit => 1. / (1. + value.exp()),
        }
    }

    pub fn from_raw(self, raw: f64) -> Result<f64, ConfigError> {
        let invalid = ConfigError::InvalidCoercibleDomain {
            raw,
            transform: self.name(),
        };
        let value = match self {
            CoercionTransform::Log if raw > 0. && raw.is_finite() => raw.ln(),
            CoercionTransform::InverseLogit if raw > 0. && raw < 1. => (1. / raw - 1.).ln(),
            _ => return Err(invalid),
        };
        if !value.is_finite() {
            return Err(invalid);
        }
        Ok(value)
    }

    fn is_valid_raw(self, raw: f64) -> bool {
        match self {
            CoercionTransform::Log => raw > 0. && raw.is_finite(),
            CoercionTransform::InverseLogit => raw > 0. && raw < 1.,
        }
    }
}

/// A continuously tunable operator parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct CoercibleParameter {
    value: f64,
    transform: CoercionTransform,
    mode: CoercionMode,
    target_acceptance: Option<f64>,
}

impl CoercibleParameter {
    /// Create a parameter from its natural-scale value.
    pub fn from_raw(transform: CoercionTransform, raw: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            value: transform.from_raw(raw)?,
            transform,
            mode: CoercionMode::Default,
            target_acceptance: None,
        })
    }

    pub fn with_mode(mut self, mode: CoercionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use a target acceptance rate different from the global one.
    pub fn with_target_acceptance(mut self, target: f64) -> Result<Self, ConfigError> {
        if !(target > 0. && target < 1.) {
            return Err(ConfigError::InvalidTargetAcceptance(target));
        }
        self.target_acceptance = Some(target);
        Ok(self)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    pub fn raw(&self) -> f64 {
        self.transform.to_raw(self.value)
    }

    pub fn transform(&self) -> CoercionTransform {
        self.transform
    }

    pub fn mode(&self) -> CoercionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CoercionMode) {
        self.mode = mode;
    }

    pub fn target_acceptance(&self) -> Option<f64> {
        self.target_acceptance
    }
}

/// Settings for the adaptation of coercible operators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoercionSettings {
    /// Adapt operators in [`CoercionMode::Default`].
    pub enabled_by_default: bool,
    /// Acceptance rate the adaptation aims for, unless an operator sets its own.
    pub target_acceptance: f64,
    /// Number of steps between two adaptation updates.
    pub interval: u64,
    /// Number of steps before the first adaptation update.
    pub delay: u64,
    /// The step size of update `k` is `scale / k^exponent`.
    pub exponent: f64,
    pub scale: f64,
}

impl Default for CoercionSettings {
    fn default() -> Self {
        Self {
            enabled_by_default: true,
            target_acceptance: 0.234,
            interval: 100,
            delay: 0,
            exponent: 0.5,
            scale: 1.,
        }
    }
}

impl CoercionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.target_acceptance > 0. && self.target_acceptance < 1.) {
            return Err(ConfigError::InvalidTargetAcceptance(self.target_acceptance));
        }
        if self.interval == 0 {
            return Err(ConfigError::NonPositive {
                name: "coercion.interval",
            });
        }
        if !(self.exponent > 0.) {
            return Err(ConfigError::NonPositive {
                name: "coercion.exponent",
            });
        }
        if !(self.scale > 0.) {
            return Err(ConfigError::NonPositive {
                name: "coercion.scale",
            });
        }
        Ok(())
    }

    /// Step size of the `epoch`-th update, starting at one.
    ///
    /// The step sizes decrease to zero, so the adaptation vanishes in the
    /// long run.
    pub fn step_size(&self, epoch: u64) -> f64 {
        self.scale / (epoch.max(1) as f64).powf(self.exponent)
    }

    /// Whether `step` (the number of completed steps) closes an adaptation batch.
    pub fn is_boundary(&self, step: u64) -> bool {
        step > self.delay && (step - self.delay) % self.interval == 0
    }

    /// Whether the batch acceptance counts start over after `step`.
    ///
    /// This happens at every boundary and once at the end of the delay.
    pub fn starts_batch(&self, step: u64) -> bool {
        (self.delay > 0 && step == self.delay) || self.is_boundary(step)
    }
}

/// Move `parameter` towards the target acceptance rate.
///
/// Returns the new coercible value, or `None` if the update was skipped
/// because it would leave the domain of the raw parameter.
pub(crate) fn coerce(
    parameter: &mut CoercibleParameter,
    acceptance_rate: f64,
    global_target: f64,
    step_size: f64,
) -> Option<f64> {
    let target = parameter.target_acceptance.unwrap_or(global_target);
    let proposed = parameter.value + step_size * (acceptance_rate - target);
    let raw = parameter.transform.to_raw(proposed);
    if !proposed.is_finite() || !parameter.transform.is_valid_raw(raw) {
        return None;
    }
    parameter.value = proposed;
    Some(proposed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn coercible_round_trip(v in -30f64..30f64) {
            for transform in [CoercionTransform::Log, CoercionTransform::InverseLogit] {
                let mut param = CoercibleParameter::from_raw(transform, 0.5).unwrap();
                param.set_value(v);
                prop_assert_eq!(param.value(), v);
                let raw = param.raw();
                prop_assert_eq!(raw, transform.to_raw(v));
                if v.abs() < 10. {
                    let back = transform.from_raw(raw).unwrap();
                    prop_assert!((back - v).abs() < 1e-6);
                }
            }
        }

        #[test]
        fn raw_is_monotonic(a in -30f64..30f64, b in -30f64..30f64) {
            prop_assume!(a < b);
            prop_assert!(CoercionTransform::Log.to_raw(a) <= CoercionTransform::Log.to_raw(b));
            prop_assert!(
                CoercionTransform::InverseLogit.to_raw(a)
                    >= CoercionTransform::InverseLogit.to_raw(b)
            );
        }
    }

    #[test]
    fn invalid_domain() {
        assert!(CoercibleParameter::from_raw(CoercionTransform::Log, 0.).is_err());
        assert!(CoercibleParameter::from_raw(CoercionTransform::Log, -1.).is_err());
        assert!(CoercibleParameter::from_raw(CoercionTransform::Log, f64::INFINITY).is_err());
        assert!(CoercibleParameter::from_raw(CoercionTransform::InverseLogit, 1.).is_err());
        assert!(CoercibleParameter::from_raw(CoercionTransform::InverseLogit, 0.).is_err());
        assert!(CoercibleParameter::from_raw(CoercionTransform::InverseLogit, 0.75).is_ok());
    }

    #[test]
    fn modes() {
        assert!(CoercionMode::Default.is_active(true));
        assert!(!CoercionMode::Default.is_active(false));
        assert!(CoercionMode::On.is_active(false));
        assert!(!CoercionMode::Off.is_active(true));
    }

    #[test]
    fn step_sizes_diminish() {
        let settings = CoercionSettings::default();
        let steps = (1..100).map(|k| settings.step_size(k)).collect::<Vec<_>>();
        assert!(steps.windows(2).all(|w| w[1] < w[0]));
        assert_relative_eq!(settings.step_size(4), 0.5);
    }

    #[test]
    fn boundaries_respect_delay() {
        let settings = CoercionSettings {
            interval: 10,
            delay: 25,
            ..Default::default()
        };
        let boundaries = (0..60).filter(|&s| settings.is_boundary(s)).collect::<Vec<_>>();
        assert_eq!(boundaries, vec![35, 45, 55]);
        let batches = (0..60).filter(|&s| settings.starts_batch(s)).collect::<Vec<_>>();
        assert_eq!(batches, vec![25, 35, 45, 55]);

        let no_delay = CoercionSettings {
            interval: 10,
            ..Default::default()
        };
        let batches = (0..30).filter(|&s| no_delay.starts_batch(s)).collect::<Vec<_>>();
        assert_eq!(batches, vec![10, 20]);
    }

    #[test]
    fn coerce_moves_towards_target() {
        let mut param = CoercibleParameter::from_raw(CoercionTransform::Log, 1.).unwrap();
        coerce(&mut param, 0.9, 0.44, 1.);
        assert!(param.raw() > 1.);

        let mut param = CoercibleParameter::from_raw(CoercionTransform::Log, 1.)
            .unwrap()
            .with_target_acceptance(0.95)
            .unwrap();
        coerce(&mut param, 0.9, 0.44, 1.);
        assert!(param.raw() < 1.);
    }
}
