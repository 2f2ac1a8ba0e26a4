use rand::{Rng, RngCore};
use rand_distr::{Distribution, StandardNormal};

use crate::{
    coercion::{CoercibleParameter, CoercionMode, CoercionTransform},
    error::ConfigError,
    operators::{Operator, Target},
};

/// Distribution of the random walk step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkKernel {
    /// Uniform on `(-w, w)`.
    Uniform,
    /// Normal with standard deviation `w`.
    Normal,
}

/// Symmetric random walk on one randomly chosen dimension.
///
/// The coercible parameter is `log(w)` for the window size `w`.
#[derive(Debug, Clone)]
pub struct RandomWalkOperator {
    name: String,
    target: Target,
    kernel: WalkKernel,
    window: CoercibleParameter,
}

impl RandomWalkOperator {
    pub fn new(target: Target, window_size: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            name: "randomWalk".to_string(),
            target,
            kernel: WalkKernel::Uniform,
            window: CoercibleParameter::from_raw(CoercionTransform::Log, window_size)?,
        })
    }

    pub fn gaussian(target: Target, sd: f64) -> Result<Self, ConfigError> {
        let mut op = Self::new(target, sd)?;
        op.kernel = WalkKernel::Normal;
        op.name = "gaussianWalk".to_string();
        Ok(op)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: CoercionMode) -> Self {
        self.window.set_mode(mode);
        self
    }

    pub fn with_target_acceptance(mut self, target: f64) -> Result<Self, ConfigError> {
        self.window = self.window.with_target_acceptance(target)?;
        Ok(self)
    }

    pub fn window_size(&self) -> f64 {
        self.window.raw()
    }
}

impl Operator for RandomWalkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        self.target.validate(&self.name, dim, 1)
    }

    fn propose(&mut self, rng: &mut dyn RngCore, position: &mut [f64]) -> f64 {
        let idx = self.target.choose(rng, position.len());
        let w = self.window.raw();
        let step = match self.kernel {
            WalkKernel::Uniform => (2. * rng.random::<f64>() - 1.) * w,
            WalkKernel::Normal => {
                let z: f64 = StandardNormal.sample(rng);
                z * w
            }
        };
        position[idx] += step;
        0.
    }

    fn coercible(&self) -> Option<&CoercibleParameter> {
        Some(&self.window)
    }

    fn coercible_mut(&mut self) -> Option<&mut CoercibleParameter> {
        Some(&mut self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn moves_one_dimension_within_window() {
        let mut op = RandomWalkOperator::new(Target::All, 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut position = vec![1., 2., 3.];
            let hastings = op.propose(&mut rng, &mut position);
            assert_eq!(hastings, 0.);
            let changed = position
                .iter()
                .zip([1., 2., 3.])
                .filter(|(a, b)| *a != b)
                .collect::<Vec<_>>();
            assert!(changed.len() <= 1);
            for (new, old) in changed {
                assert!((new - old).abs() < 0.5);
            }
        }
    }

    #[test]
    fn coercible_parameter_is_log_window() {
        let mut op = RandomWalkOperator::gaussian(Target::All, 2.).unwrap();
        let param = op.coercible().unwrap();
        assert!((param.value() - 2f64.ln()).abs() < 1e-12);
        op.coercible_mut().unwrap().set_value(0.);
        assert!((op.window_size() - 1.).abs() < 1e-12);
    }
}
