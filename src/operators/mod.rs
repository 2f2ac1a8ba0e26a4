//! Proposal operators.
//!
//! An operator changes a copy of the current position and reports the log
//! Hastings ratio of the move. Accepting or rejecting the move is left to the
//! chain.

mod delta_exchange;
mod random_walk;
mod scale;

use std::fmt::Debug;

use rand::{Rng, RngCore};

use crate::{coercion::CoercibleParameter, error::ConfigError, scheduler::OperatorSchedule};

pub use delta_exchange::DeltaExchangeOperator;
pub use random_walk::{RandomWalkOperator, WalkKernel};
pub use scale::ScaleOperator;

/// A move generator over the parameter state.
pub trait Operator: Send + Debug {
    fn name(&self) -> &str;

    /// Check that the operator can act on a parameter state with `dim` dimensions.
    fn validate(&self, dim: usize) -> Result<(), ConfigError>;

    /// Modify `position` in place and return the log Hastings ratio
    /// `log q(new -> old) - log q(old -> new)`.
    ///
    /// `position` is a copy of the current state, never the state itself.
    fn propose(&mut self, rng: &mut dyn RngCore, position: &mut [f64]) -> f64;

    /// The tunable parameter of a coercible operator.
    fn coercible(&self) -> Option<&CoercibleParameter> {
        None
    }

    fn coercible_mut(&mut self) -> Option<&mut CoercibleParameter> {
        None
    }
}

/// The dimensions an operator acts on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    All,
    Indices(Vec<usize>),
}

impl Target {
    pub(crate) fn validate(
        &self,
        operator: &str,
        dim: usize,
        required: usize,
    ) -> Result<(), ConfigError> {
        if let Target::Indices(indices) = self {
            if let Some(&index) = indices.iter().find(|&&index| index >= dim) {
                return Err(ConfigError::DimensionMismatch {
                    operator: operator.to_string(),
                    index,
                    dim,
                });
            }
            let mut seen = vec![false; dim];
            for &index in indices.iter() {
                if std::mem::replace(&mut seen[index], true) {
                    return Err(ConfigError::DuplicateTarget {
                        operator: operator.to_string(),
                        index,
                    });
                }
            }
        }
        let found = self.len(dim);
        if found < required {
            return Err(ConfigError::TooFewDimensions {
                operator: operator.to_string(),
                required,
                found,
            });
        }
        Ok(())
    }

    pub(crate) fn len(&self, dim: usize) -> usize {
        match self {
            Target::All => dim,
            Target::Indices(indices) => indices.len(),
        }
    }

    /// The `k`-th targeted dimension.
    pub(crate) fn index(&self, k: usize) -> usize {
        match self {
            Target::All => k,
            Target::Indices(indices) => indices[k],
        }
    }

    pub(crate) fn choose(&self, rng: &mut dyn RngCore, dim: usize) -> usize {
        self.index(rng.random_range(0..self.len(dim)))
    }
}

/// An ordered list of operators with their selection weights.
#[derive(Debug, Default)]
pub struct OperatorSet {
    operators: Vec<Box<dyn Operator>>,
    weights: Vec<f64>,
}

impl OperatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operator: impl Operator + 'static, weight: f64) -> Self {
        self.push(Box::new(operator), weight);
        self
    }

    pub fn push(&mut self, operator: Box<dyn Operator>, weight: f64) {
        self.operators.push(operator);
        self.weights.push(weight);
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Check the operators against the model dimension and build the schedule.
    pub fn validate(&self, dim: usize) -> Result<OperatorSchedule, ConfigError> {
        if dim == 0 {
            return Err(ConfigError::EmptyModel);
        }
        if self.is_empty() {
            return Err(ConfigError::NoOperators);
        }
        for operator in self.operators.iter() {
            operator.validate(dim)?;
        }
        let names = self
            .operators
            .iter()
            .map(|op| op.name())
            .collect::<Vec<_>>();
        OperatorSchedule::new(&names, self.weights.clone())
    }

    pub(crate) fn into_operators(self) -> Vec<Box<dyn Operator>> {
        self.operators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn target_validation() {
        let target = Target::Indices(vec![0, 3]);
        assert!(target.validate("op", 4, 2).is_ok());
        assert_eq!(
            target.validate("op", 3, 1),
            Err(ConfigError::DimensionMismatch {
                operator: "op".into(),
                index: 3,
                dim: 3
            })
        );
        assert!(Target::All.validate("op", 1, 2).is_err());
    }

    #[test]
    fn repeated_target_indices_are_rejected() {
        let expected = |operator: &str| ConfigError::DuplicateTarget {
            operator: operator.into(),
            index: 0,
        };
        assert_eq!(
            Target::Indices(vec![0, 2, 0]).validate("op", 3, 1),
            Err(expected("op"))
        );

        let scale = ScaleOperator::new(Target::Indices(vec![0, 0]), 0.5)
            .unwrap()
            .scale_all();
        assert_eq!(scale.validate(1), Err(expected("scale")));

        let exchange = DeltaExchangeOperator::new(Target::Indices(vec![0, 0]), 1.).unwrap();
        assert_eq!(exchange.validate(2), Err(expected("deltaExchange")));

        let set = OperatorSet::new().with(scale, 1.);
        assert_eq!(set.validate(1).unwrap_err(), expected("scale"));
    }

    #[test]
    fn target_choose_stays_in_subset() {
        let target = Target::Indices(vec![1, 4]);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let idx = target.choose(&mut rng, 5);
            assert!(idx == 1 || idx == 4);
        }
    }

    #[test]
    fn operator_set_validation() {
        let set = OperatorSet::new()
            .with(RandomWalkOperator::new(Target::All, 1.).unwrap(), 0.)
            .with(ScaleOperator::new(Target::All, 0.5).unwrap(), 0.);
        assert_eq!(
            set.validate(2).unwrap_err(),
            ConfigError::ZeroTotalWeight { total: 0. }
        );

        let set = OperatorSet::new().with(
            RandomWalkOperator::new(Target::Indices(vec![5]), 1.).unwrap(),
            1.,
        );
        assert!(matches!(
            set.validate(2),
            Err(ConfigError::DimensionMismatch { .. })
        ));
        assert_eq!(OperatorSet::new().validate(2).unwrap_err(), ConfigError::NoOperators);
    }
}
