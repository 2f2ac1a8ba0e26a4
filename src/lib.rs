//! Adaptive Metropolis-Hastings chains and Metropolis-coupled (MC³) runs.
//!
//! A single chain is driven with [`MetropolisChain`] or [`sample_sequentially`].
//! Several chains at different temperatures that exchange their states are
//! started with [`start_chains`].

pub(crate) mod chain;
pub(crate) mod coercion;
pub(crate) mod error;
pub(crate) mod model;
pub(crate) mod operators;
pub(crate) mod sampler;
pub(crate) mod scheduler;
pub(crate) mod state;
pub(crate) mod storage;
pub(crate) mod tempering;

pub use chain::{
    sample_sequentially, ChainError, ChainPhase, ChainSettings, ChunkSummary, MetropolisChain,
    OperatorReport, OperatorStats, StepInfo,
};
pub use coercion::{CoercibleParameter, CoercionMode, CoercionSettings, CoercionTransform};
pub use error::ConfigError;
pub use model::{FnDensity, Infallible, LogDensity, LogpError, Model};
pub use operators::{
    DeltaExchangeOperator, Operator, OperatorSet, RandomWalkOperator, ScaleOperator, Target,
    WalkKernel,
};
pub use sampler::{
    start_chains, ChainProgress, ChainReport, ProgressCallback, RunHandle, RunReport,
    TemperingSettings,
};
pub use scheduler::OperatorSchedule;
pub use state::{ChainState, OwnershipLedger, OwnershipStats, StateId};
pub use storage::{ArrowSink, OwnedSample, PerChainSinks, Sample, SampleSink, SinkFactory, VecSink};
pub use tempering::{
    accept_swap, geometric_ladder, incremental_ladder, swap_acceptance, validate_ladder,
    PairStats, SwapScheme, SwapStats,
};
