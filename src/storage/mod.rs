mod arrow;
mod core;
mod memory;

pub use self::arrow::ArrowSink;
pub use self::core::{PerChainSinks, Sample, SampleSink, SinkFactory};
pub use self::memory::{OwnedSample, VecSink};
