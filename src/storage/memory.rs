use anyhow::Result;

use crate::storage::{Sample, SampleSink};

/// An owned copy of a [`Sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedSample {
    pub chain: usize,
    pub step: u64,
    pub temperature: f64,
    pub position: Box<[f64]>,
    pub logp: f64,
}

impl From<&Sample<'_>> for OwnedSample {
    fn from(sample: &Sample<'_>) -> Self {
        Self {
            chain: sample.chain,
            step: sample.step,
            temperature: sample.temperature,
            position: sample.position.into(),
            logp: sample.logp,
        }
    }
}

/// Keeps all samples in memory.
#[derive(Debug, Clone, Default)]
pub struct VecSink {
    samples: Vec<OwnedSample>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[OwnedSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<OwnedSample> {
        self.samples
    }

    /// The samples of one chain, in the order they were recorded.
    pub fn chain(&self, chain: usize) -> impl Iterator<Item = &OwnedSample> + '_ {
        self.samples.iter().filter(move |s| s.chain == chain)
    }
}

impl SampleSink for VecSink {
    fn record(&mut self, sample: &Sample<'_>) -> Result<()> {
        self.samples.push(sample.into());
        Ok(())
    }
}
