use thiserror::Error;

/// Errors in the sampler setup.
///
/// All of these are raised synchronously, before any chain thread is started.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("The operator set is empty")]
    NoOperators,
    #[error("Operator weights sum to {total}, no operator can be selected")]
    ZeroTotalWeight { total: f64 },
    #[error("Operator {operator} has invalid weight {weight}")]
    InvalidWeight { operator: String, weight: f64 },
    #[error("Operator {operator} targets dimension {index}, but the model has {dim} dimensions")]
    DimensionMismatch {
        operator: String,
        index: usize,
        dim: usize,
    },
    #[error("Operator {operator} targets dimension {index} more than once")]
    DuplicateTarget { operator: String, index: usize },
    #[error("Operator {operator} needs at least {required} target dimensions, got {found}")]
    TooFewDimensions {
        operator: String,
        required: usize,
        found: usize,
    },
    #[error("Raw tuning value {raw} is outside the domain of the {transform} transform")]
    InvalidCoercibleDomain { raw: f64, transform: &'static str },
    #[error("Target acceptance {0} is not in (0, 1)")]
    InvalidTargetAcceptance(f64),
    #[error("Temperature ladder is empty")]
    EmptyLadder,
    #[error("Temperature {temperature} of chain {chain} is not in (0, 1]")]
    InvalidTemperature { chain: usize, temperature: f64 },
    #[error("Temperature ladder is not non-increasing at chain {chain}: {previous} < {next}")]
    NonMonotonicLadder {
        chain: usize,
        previous: f64,
        next: f64,
    },
    #[error("Setting {name} must be positive")]
    NonPositive { name: &'static str },
    #[error("Model dimension must be positive")]
    EmptyModel,
    #[error("No operator with index {index}, the schedule has {len} operators")]
    UnknownOperator { index: usize, len: usize },
}
