use std::fmt::Debug;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    coercion::{coerce, CoercionMode, CoercionSettings},
    error::ConfigError,
    model::{LogDensity, LogpError},
    operators::{Operator, OperatorSet},
    scheduler::OperatorSchedule,
    state::ChainState,
    storage::{Sample, SampleSink},
};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),
    #[error("The chain has no parameter state")]
    NoState,
    #[error("Log density of the initial position is {0}")]
    InvalidInitialPosition(f64),
    #[error("Position has {found} dimensions, the model has {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Settings of a single chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// Emit the state to the sink every `sampling_interval` steps.
    pub sampling_interval: u64,
    pub coercion: CoercionSettings,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            sampling_interval: 1,
            coercion: CoercionSettings::default(),
        }
    }
}

impl ChainSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_interval == 0 {
            return Err(ConfigError::NonPositive {
                name: "sampling_interval",
            });
        }
        self.coercion.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Initialized,
    Running,
    /// Between two chunks.
    Paused,
    Finished,
}

/// Diagnostic information about a single step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInfo {
    /// Number of completed steps, including this one.
    pub step: u64,
    pub operator: usize,
    pub accepted: bool,
    /// Log density of the state after the step.
    pub logp: f64,
    pub candidate_logp: f64,
    pub log_hastings: f64,
}

/// Acceptance counters of one operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStats {
    pub accepted: u64,
    pub rejected: u64,
    batch_accepted: u64,
    batch_rejected: u64,
}

impl OperatorStats {
    fn record(&mut self, accepted: bool) {
        if accepted {
            self.accepted += 1;
            self.batch_accepted += 1;
        } else {
            self.rejected += 1;
            self.batch_rejected += 1;
        }
    }

    pub fn acceptance_rate(&self) -> Option<f64> {
        rate(self.accepted, self.rejected)
    }

    /// Acceptance rate since the last coercion boundary.
    pub fn batch_acceptance_rate(&self) -> Option<f64> {
        rate(self.batch_accepted, self.batch_rejected)
    }

    fn reset_batch(&mut self) {
        self.batch_accepted = 0;
        self.batch_rejected = 0;
    }
}

fn rate(accepted: u64, rejected: u64) -> Option<f64> {
    let total = accepted + rejected;
    if total == 0 {
        None
    } else {
        Some(accepted as f64 / total as f64)
    }
}

/// Summary of one operator at the end of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorReport {
    pub name: String,
    pub weight: f64,
    pub accepted: u64,
    pub rejected: u64,
    pub acceptance_rate: Option<f64>,
    pub raw_parameter: Option<f64>,
    pub coercible_parameter: Option<f64>,
    pub mode: Option<CoercionMode>,
}

/// Result of running a chunk of steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkSummary {
    pub steps: u64,
    pub accepted: u64,
}

/// A Metropolis-Hastings chain with adaptive operators.
///
/// The chain owns its density, operators, operator weights and random number
/// generator. Its parameter state can be taken out and installed again
/// between chunks, which is how coupled chains exchange states.
pub struct MetropolisChain<D, R> {
    chain: usize,
    density: D,
    operators: Vec<Box<dyn Operator>>,
    schedule: OperatorSchedule,
    stats: Vec<OperatorStats>,
    rng: R,
    state: Option<ChainState>,
    candidate: Box<[f64]>,
    temperature: f64,
    settings: ChainSettings,
    step: u64,
    accepted: u64,
    coercion_epochs: u64,
    last_emitted: Option<u64>,
    phase: ChainPhase,
}

impl<D, R> MetropolisChain<D, R>
where
    D: LogDensity,
    R: Rng,
{
    pub fn new(
        chain: usize,
        density: D,
        operators: OperatorSet,
        temperature: f64,
        settings: ChainSettings,
        rng: R,
    ) -> Result<Self, ConfigError> {
        let dim = density.dim();
        let schedule = operators.validate(dim)?;
        settings.validate()?;
        if !(temperature > 0. && temperature <= 1.) {
            return Err(ConfigError::InvalidTemperature { chain, temperature });
        }
        let operators = operators.into_operators();
        let stats = vec![OperatorStats::default(); operators.len()];
        Ok(Self {
            chain,
            density,
            operators,
            schedule,
            stats,
            rng,
            state: None,
            candidate: vec![0f64; dim].into(),
            temperature,
            settings,
            step: 0,
            accepted: 0,
            coercion_epochs: 0,
            last_emitted: None,
            phase: ChainPhase::Initialized,
        })
    }

    /// Initialize the chain at `position`.
    ///
    /// This fails if the log density at `position` is not finite.
    pub fn set_position(&mut self, position: &[f64]) -> Result<(), ChainError> {
        if position.len() != self.dim() {
            return Err(ChainError::DimensionMismatch {
                expected: self.dim(),
                found: position.len(),
            });
        }
        let logp = evaluate(&mut self.density, position, self.chain)?;
        if !logp.is_finite() {
            return Err(ChainError::InvalidInitialPosition(logp));
        }
        self.state = Some(ChainState::new(position.into(), logp));
        Ok(())
    }

    /// Replace the parameter state, returning the previous one.
    pub fn install_state(&mut self, state: ChainState) -> Result<Option<ChainState>, ChainError> {
        if state.dim() != self.dim() {
            return Err(ChainError::DimensionMismatch {
                expected: self.dim(),
                found: state.dim(),
            });
        }
        Ok(self.state.replace(state))
    }

    pub fn take_state(&mut self) -> Option<ChainState> {
        self.state.take()
    }

    pub fn state(&self) -> Option<&ChainState> {
        self.state.as_ref()
    }

    /// Perform a single Metropolis-Hastings step.
    ///
    /// `allow_coercion` set to false skips the adaptation at a coercion
    /// boundary. Non-finite log densities and recoverable logp errors reject
    /// the proposal.
    pub fn step(&mut self, allow_coercion: bool) -> Result<StepInfo, ChainError> {
        let state = self.state.as_mut().ok_or(ChainError::NoState)?;

        let operator = self.schedule.select(&mut self.rng);
        self.candidate.copy_from_slice(state.position());
        let log_hastings = self.operators[operator]
            .propose(&mut self.rng as &mut dyn RngCore, &mut self.candidate);

        let candidate_logp = evaluate(&mut self.density, &self.candidate, self.chain)?;
        let log_ratio = self.temperature * (candidate_logp - state.logp()) + log_hastings;

        let accepted = if !candidate_logp.is_finite() || log_ratio.is_nan() {
            false
        } else if log_ratio >= 0. {
            true
        } else {
            self.rng.random::<f64>().ln() < log_ratio
        };

        if accepted {
            state.accept(&self.candidate, candidate_logp);
            self.accepted += 1;
        }
        let logp = state.logp();
        self.stats[operator].record(accepted);
        self.step += 1;

        if allow_coercion && self.settings.coercion.is_boundary(self.step) {
            self.coerce();
        }
        if self.settings.coercion.starts_batch(self.step) {
            self.stats.iter_mut().for_each(|s| s.reset_batch());
        }

        Ok(StepInfo {
            step: self.step,
            operator,
            accepted,
            logp,
            candidate_logp,
            log_hastings,
        })
    }

    /// Run exactly `length` steps and emit samples to `sink`.
    ///
    /// The initial state is emitted before the first step of the chain, then
    /// the state is emitted whenever the step count is a multiple of the
    /// sampling interval.
    pub fn run<S: SampleSink + ?Sized>(
        &mut self,
        length: u64,
        disable_coercion: bool,
        sink: &mut S,
    ) -> anyhow::Result<ChunkSummary> {
        if self.state.is_none() {
            return Err(ChainError::NoState.into());
        }
        self.phase = ChainPhase::Running;
        if self.step == 0 && self.last_emitted.is_none() {
            self.emit(sink)?;
        }
        let mut accepted = 0;
        for _ in 0..length {
            let info = self.step(!disable_coercion)?;
            if info.accepted {
                accepted += 1;
            }
            if self.step % self.settings.sampling_interval == 0 {
                self.emit(sink)?;
            }
        }
        self.phase = ChainPhase::Paused;
        Ok(ChunkSummary {
            steps: length,
            accepted,
        })
    }

    fn emit<S: SampleSink + ?Sized>(&mut self, sink: &mut S) -> anyhow::Result<()> {
        let state = self.state.as_ref().ok_or(ChainError::NoState)?;
        sink.record(&Sample {
            chain: self.chain,
            step: self.step,
            temperature: self.temperature,
            position: state.position(),
            logp: state.logp(),
        })?;
        self.last_emitted = Some(self.step);
        Ok(())
    }

    /// Move every active coercible operator towards its target acceptance.
    fn coerce(&mut self) {
        self.coercion_epochs += 1;
        let settings = self.settings.coercion;
        let step_size = settings.step_size(self.coercion_epochs);
        for (operator, stats) in self.operators.iter_mut().zip(self.stats.iter()) {
            let Some(rate) = stats.batch_acceptance_rate() else {
                continue;
            };
            let Some(param) = operator.coercible_mut() else {
                continue;
            };
            if !param.mode().is_active(settings.enabled_by_default) {
                continue;
            }
            if let Some(value) = coerce(param, rate, settings.target_acceptance, step_size) {
                trace!(
                    chain = self.chain,
                    epoch = self.coercion_epochs,
                    rate,
                    value,
                    "coerced operator"
                );
            } else {
                debug!(
                    chain = self.chain,
                    operator = operator.name(),
                    "skipped coercion that leaves the parameter domain"
                );
            }
        }
    }

    pub fn finish(&mut self) {
        self.phase = ChainPhase::Finished;
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn chain(&self) -> usize {
        self.chain
    }

    pub fn dim(&self) -> usize {
        self.candidate.len()
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u64 {
        self.step
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn coercion_epochs(&self) -> u64 {
        self.coercion_epochs
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub fn operators_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut self.operators
    }

    pub fn operator_stats(&self) -> &[OperatorStats] {
        &self.stats
    }

    pub fn schedule_mut(&mut self) -> &mut OperatorSchedule {
        &mut self.schedule
    }

    pub fn operator_report(&self) -> Vec<OperatorReport> {
        self.operators
            .iter()
            .zip(self.stats.iter())
            .zip(self.schedule.weights())
            .map(|((op, stats), &weight)| OperatorReport {
                name: op.name().to_string(),
                weight,
                accepted: stats.accepted,
                rejected: stats.rejected,
                acceptance_rate: stats.acceptance_rate(),
                raw_parameter: op.coercible().map(|p| p.raw()),
                coercible_parameter: op.coercible().map(|p| p.value()),
                mode: op.coercible().map(|p| p.mode()),
            })
            .collect()
    }
}

impl<D, R> Debug for MetropolisChain<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetropolisChain")
            .field("chain", &self.chain)
            .field("temperature", &self.temperature)
            .field("step", &self.step)
            .field("phase", &self.phase)
            .field("state", &self.state)
            .finish()
    }
}

fn evaluate<D: LogDensity>(
    density: &mut D,
    position: &[f64],
    chain: usize,
) -> Result<f64, ChainError> {
    match density.logp(position) {
        Ok(logp) if logp.is_nan() || logp == f64::INFINITY => {
            debug!(chain, logp, "non-finite log density, rejecting proposal");
            Ok(f64::NEG_INFINITY)
        }
        Ok(logp) => Ok(logp),
        Err(err) if err.is_recoverable() => {
            debug!(chain, error = %err, "recoverable logp error, rejecting proposal");
            Ok(f64::NEG_INFINITY)
        }
        Err(err) => Err(ChainError::LogpFailure(Box::new(err))),
    }
}

/// Run a single untempered chain from `start` and return its states one step
/// at a time.
pub fn sample_sequentially<D, R>(
    density: D,
    operators: OperatorSet,
    settings: ChainSettings,
    start: &[f64],
    steps: u64,
    rng: R,
) -> anyhow::Result<impl Iterator<Item = anyhow::Result<(Box<[f64]>, StepInfo)>>>
where
    D: LogDensity,
    R: Rng,
{
    let mut chain = MetropolisChain::new(0, density, operators, 1., settings, rng)?;
    chain.set_position(start)?;
    Ok((0..steps).map(move |_| {
        let info = chain.step(true)?;
        let position = chain.state().ok_or(ChainError::NoState)?.position().into();
        Ok((position, info))
    }))
}
