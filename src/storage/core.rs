use std::sync::{Arc, Mutex};

use anyhow::Result;

/// A single emitted draw of a chain.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub chain: usize,
    /// Number of completed steps of the chain when the sample was taken.
    pub step: u64,
    pub temperature: f64,
    /// Snapshot of the parameter state.
    pub position: &'a [f64],
    /// Untempered log density of `position`.
    pub logp: f64,
}

/// Receiver of the samples of one chain.
///
/// Chains call `record` from their own thread every sampling interval.
pub trait SampleSink: Send {
    fn record(&mut self, sample: &Sample<'_>) -> Result<()>;

    /// Called once when the chain has finished.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SampleSink for () {
    fn record(&mut self, _sample: &Sample<'_>) -> Result<()> {
        Ok(())
    }
}

impl<S: SampleSink + ?Sized> SampleSink for Box<S> {
    fn record(&mut self, sample: &Sample<'_>) -> Result<()> {
        (**self).record(sample)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// A sink shared between chains. Writes are serialized by the lock.
impl<S: SampleSink> SampleSink for Arc<Mutex<S>> {
    fn record(&mut self, sample: &Sample<'_>) -> Result<()> {
        self.lock().expect("Poisoned lock").record(sample)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().expect("Poisoned lock").flush()
    }
}

/// Creates the sink of each chain of a coupled run.
pub trait SinkFactory: Send + Sync + 'static {
    type Sink: SampleSink;

    fn new_sink(&self, chain: usize) -> Result<Self::Sink>;
}

impl SinkFactory for () {
    type Sink = ();

    fn new_sink(&self, _chain: usize) -> Result<()> {
        Ok(())
    }
}

/// All chains write into the same sink.
impl<S: SampleSink + 'static> SinkFactory for Arc<Mutex<S>> {
    type Sink = Arc<Mutex<S>>;

    fn new_sink(&self, _chain: usize) -> Result<Self::Sink> {
        Ok(self.clone())
    }
}

/// Builds one independent sink per chain with a closure.
pub struct PerChainSinks<F>(pub F);

impl<F, S> SinkFactory for PerChainSinks<F>
where
    F: Fn(usize) -> Result<S> + Send + Sync + 'static,
    S: SampleSink,
{
    type Sink = S;

    fn new_sink(&self, chain: usize) -> Result<S> {
        (self.0)(chain)
    }
}
