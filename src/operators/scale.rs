use rand::{Rng, RngCore};

use crate::{
    coercion::{CoercibleParameter, CoercionMode, CoercionTransform},
    error::ConfigError,
    operators::{Operator, Target},
};

/// Multiplicative move with scale factor `s` in `(0, 1)`.
///
/// The multiplier `m` is drawn uniformly from `(s, 1/s)`. Scaling a single
/// dimension has log Hastings ratio `-ln m`, scaling `d` dimensions jointly has
/// `(d - 2) ln m`.
#[derive(Debug, Clone)]
pub struct ScaleOperator {
    name: String,
    target: Target,
    scale_all: bool,
    factor: CoercibleParameter,
}

impl ScaleOperator {
    pub fn new(target: Target, scale_factor: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            name: "scale".to_string(),
            target,
            scale_all: false,
            factor: CoercibleParameter::from_raw(CoercionTransform::InverseLogit, scale_factor)?,
        })
    }

    /// Scale all targeted dimensions with the same multiplier.
    pub fn scale_all(mut self) -> Self {
        self.scale_all = true;
        self.name = "scaleAll".to_string();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: CoercionMode) -> Self {
        self.factor.set_mode(mode);
        self
    }

    pub fn with_target_acceptance(mut self, target: f64) -> Result<Self, ConfigError> {
        self.factor = self.factor.with_target_acceptance(target)?;
        Ok(self)
    }

    pub fn scale_factor(&self) -> f64 {
        self.factor.raw()
    }
}

impl Operator for ScaleOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        self.target.validate(&self.name, dim, 1)
    }

    fn propose(&mut self, rng: &mut dyn RngCore, position: &mut [f64]) -> f64 {
        let s = self.factor.raw();
        let m = s + rng.random::<f64>() * (1. / s - s);
        if self.scale_all {
            let d = self.target.len(position.len());
            for k in 0..d {
                position[self.target.index(k)] *= m;
            }
            (d as f64 - 2.) * m.ln()
        } else {
            let idx = self.target.choose(rng, position.len());
            position[idx] *= m;
            -m.ln()
        }
    }

    fn coercible(&self) -> Option<&CoercibleParameter> {
        Some(&self.factor)
    }

    fn coercible_mut(&mut self) -> Option<&mut CoercibleParameter> {
        Some(&mut self.factor)
    }
}
