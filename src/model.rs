//! Core abstractions for the target distribution.
//!
//! Provides the `LogDensity` trait, the oracle each chain evaluates candidate
//! positions with, and the `Model` trait which the coordinator uses to build
//! one oracle, one operator set and one initial position per chain.

use std::fmt::Debug;

use anyhow::Result;
use rand::Rng;

use crate::operators::OperatorSet;

/// Errors that happen when we evaluate the log density.
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during sampling stop the run.
    ///
    /// Recoverable errors reject the proposed state and sampling continues.
    fn is_recoverable(&self) -> bool;
}

/// An unnormalized log probability density.
///
/// The returned value may be `-inf` for positions outside the support of the
/// distribution. Any non-finite value is treated as a rejection by the chain.
pub trait LogDensity {
    type LogpError: LogpError;

    /// The dimensionality of the parameter space.
    fn dim(&self) -> usize;

    /// Compute the log density at `position`.
    fn logp(&mut self, position: &[f64]) -> Result<f64, Self::LogpError>;
}

impl<F: LogDensity + ?Sized> LogDensity for &mut F {
    type LogpError = F::LogpError;

    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn logp(&mut self, position: &[f64]) -> Result<f64, Self::LogpError> {
        (**self).logp(position)
    }
}

/// Trait for models that can be sampled with several coupled chains.
///
/// The trait is thread-safe so that a single model instance can hand out
/// densities to all chain threads.
pub trait Model: Send + Sync + 'static {
    /// The log density evaluated by a single chain.
    ///
    /// The lifetime parameter allows the density to borrow from the model.
    type Density<'model>: LogDensity
    where
        Self: 'model;

    /// The number of dimensions of the parameter state.
    fn dim(&self) -> usize;

    /// Returns the log density for chain `chain`.
    fn density(&self, chain: usize) -> Result<Self::Density<'_>>;

    /// Fresh operator instances for chain `chain`.
    ///
    /// Operators carry tuning state, so each chain needs its own set.
    fn operators(&self, chain: usize) -> Result<OperatorSet>;

    /// Initializes the starting position of a chain.
    ///
    /// The starting position should be in a region where the log density is
    /// finite. Positions with non-finite density are retried.
    fn init_position<R: Rng + ?Sized>(&self, rng: &mut R, position: &mut [f64]) -> Result<()>;
}

/// A `LogpError` for densities that never fail.
#[derive(Debug, thiserror::Error)]
pub enum Infallible {}

impl LogpError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// Log density given by a closure.
pub struct FnDensity<F> {
    dim: usize,
    func: F,
}

impl<F> FnDensity<F>
where
    F: FnMut(&[f64]) -> f64,
{
    pub fn new(dim: usize, func: F) -> Self {
        Self { dim, func }
    }
}

impl<F> Debug for FnDensity<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnDensity").field("dim", &self.dim).finish()
    }
}

impl<F> LogDensity for FnDensity<F>
where
    F: FnMut(&[f64]) -> f64,
{
    type LogpError = Infallible;

    fn dim(&self) -> usize {
        self.dim
    }

    fn logp(&mut self, position: &[f64]) -> Result<f64, Infallible> {
        Ok((self.func)(position))
    }
}
