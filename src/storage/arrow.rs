use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    ArrayBuilder, ArrayRef, FixedSizeListBuilder, Float64Builder, RecordBatch, UInt64Builder,
};
use arrow::datatypes::{Field, Schema};

use crate::storage::{Sample, SampleSink};

/// Collects samples into arrow arrays.
///
/// The resulting record batch has the columns `chain`, `step`, `temperature`,
/// `logp` and `position`, the last one a fixed size list of the parameter
/// values. Share it between chains with `Arc<Mutex<ArrowSink>>`.
pub struct ArrowSink {
    dim: usize,
    chain: UInt64Builder,
    step: UInt64Builder,
    temperature: Float64Builder,
    logp: Float64Builder,
    position: FixedSizeListBuilder<Float64Builder>,
}

impl ArrowSink {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            chain: UInt64Builder::new(),
            step: UInt64Builder::new(),
            temperature: Float64Builder::new(),
            logp: Float64Builder::new(),
            position: FixedSizeListBuilder::new(Float64Builder::new(), dim as i32),
        }
    }

    pub fn len(&self) -> usize {
        self.step.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the collected samples and reset the sink.
    pub fn finish(&mut self) -> Result<RecordBatch> {
        let columns = vec![
            ArrayBuilder::finish(&mut self.chain),
            ArrayBuilder::finish(&mut self.step),
            ArrayBuilder::finish(&mut self.temperature),
            ArrayBuilder::finish(&mut self.logp),
            ArrayBuilder::finish(&mut self.position),
        ];
        to_batch(columns)
    }

    /// Return a copy of the samples collected so far.
    pub fn inspect(&self) -> Result<RecordBatch> {
        let columns = vec![
            ArrayBuilder::finish_cloned(&self.chain),
            ArrayBuilder::finish_cloned(&self.step),
            ArrayBuilder::finish_cloned(&self.temperature),
            ArrayBuilder::finish_cloned(&self.logp),
            ArrayBuilder::finish_cloned(&self.position),
        ];
        to_batch(columns)
    }
}

fn to_batch(columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    let names = ["chain", "step", "temperature", "logp", "position"];
    let fields = names
        .iter()
        .zip(columns.iter())
        .map(|(name, column)| Field::new(*name, column.data_type().clone(), false))
        .collect::<Vec<_>>();
    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, columns).context("Could not assemble sample record batch")
}

impl SampleSink for ArrowSink {
    fn record(&mut self, sample: &Sample<'_>) -> Result<()> {
        if sample.position.len() != self.dim {
            bail!(
                "Sample of chain {} has {} dimensions, sink expects {}",
                sample.chain,
                sample.position.len(),
                self.dim
            );
        }
        self.chain.append_value(sample.chain as u64);
        self.step.append_value(sample.step);
        self.temperature.append_value(sample.temperature);
        self.logp.append_value(sample.logp);
        self.position.values().append_slice(sample.position);
        self.position.append(true);
        Ok(())
    }
}
