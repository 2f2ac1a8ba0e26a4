use rand::{Rng, RngCore};

use crate::{
    coercion::{CoercibleParameter, CoercionMode, CoercionTransform},
    error::ConfigError,
    operators::{Operator, Target},
};

/// Moves a uniform amount in `(0, delta)` from one dimension to another,
/// keeping the sum of the targeted dimensions fixed. The move is symmetric.
#[derive(Debug, Clone)]
pub struct DeltaExchangeOperator {
    name: String,
    target: Target,
    delta: CoercibleParameter,
}

impl DeltaExchangeOperator {
    pub fn new(target: Target, delta: f64) -> Result<Self, ConfigError> {
        Ok(Self {
            name: "deltaExchange".to_string(),
            target,
            delta: CoercibleParameter::from_raw(CoercionTransform::Log, delta)?,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: CoercionMode) -> Self {
        self.delta.set_mode(mode);
        self
    }

    pub fn with_target_acceptance(mut self, target: f64) -> Result<Self, ConfigError> {
        self.delta = self.delta.with_target_acceptance(target)?;
        Ok(self)
    }

    pub fn delta(&self) -> f64 {
        self.delta.raw()
    }
}

impl Operator for DeltaExchangeOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, dim: usize) -> Result<(), ConfigError> {
        self.target.validate(&self.name, dim, 2)
    }

    fn propose(&mut self, rng: &mut dyn RngCore, position: &mut [f64]) -> f64 {
        let n = self.target.len(position.len());
        let first = rng.random_range(0..n);
        let mut second = rng.random_range(0..n - 1);
        if second >= first {
            second += 1;
        }
        let amount = rng.random::<f64>() * self.delta.raw();
        position[self.target.index(first)] -= amount;
        position[self.target.index(second)] += amount;
        0.
    }

    fn coercible(&self) -> Option<&CoercibleParameter> {
        Some(&self.delta)
    }

    fn coercible_mut(&mut self) -> Option<&mut CoercibleParameter> {
        Some(&mut self.delta)
    }
}
