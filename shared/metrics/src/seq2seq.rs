use crate::{Mean, MetricBag, MetricError, MetricValues, Sum};

use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};
use tandem_data_provider::Seq2SeqBatch;

/// Loss and throughput counters of a sequence-to-sequence unit.
#[derive(Debug)]
pub struct Seq2SeqMetricBag {
    bag: MetricBag,
}

impl Seq2SeqMetricBag {
    pub fn new() -> Result<Self, MetricError> {
        let mut bag = MetricBag::new();
        bag.register_metric("loss", Mean::default(), false)?;
        bag.register_metric("nll_loss", Mean::default(), false)?;
        bag.register_metric("batch_size", Mean::default(), false)?;
        bag.register_metric("elements_per_batch", Mean::default(), false)?;
        bag.register_metric("num_examples", Sum::default(), false)?;
        bag.register_metric("num_source_elements", Sum::default(), false)?;
        bag.register_metric("num_target_elements", Sum::default(), false)?;
        Ok(Self { bag })
    }

    /// Records per-token losses. `loss` and `nll_loss` are sums over the
    /// batch's target tokens.
    pub fn update_nll_loss(
        &mut self,
        batch: &Seq2SeqBatch,
        loss: f64,
        nll_loss: f64,
    ) -> Result<(), MetricError> {
        let num_target_elements = batch.num_target_elements() as f64;
        if num_target_elements == 0.0 {
            return Ok(());
        }
        self.bag
            .get_mut::<Mean>("loss")?
            .update(loss / num_target_elements, num_target_elements);
        self.bag
            .get_mut::<Mean>("nll_loss")?
            .update(nll_loss / num_target_elements, num_target_elements);
        Ok(())
    }

    pub fn update_batch_metrics(&mut self, batch: &Seq2SeqBatch) -> Result<(), MetricError> {
        let num_examples = batch.batch_size() as f64;
        let num_elements = (batch.num_source_elements() + batch.num_target_elements()) as f64;

        self.bag.get_mut::<Mean>("batch_size")?.update(num_examples, 1.0);
        self.bag
            .get_mut::<Mean>("elements_per_batch")?
            .update(num_elements, 1.0);
        self.bag.get_mut::<Sum>("num_examples")?.update(num_examples);
        self.bag
            .get_mut::<Sum>("num_source_elements")?
            .update(batch.num_source_elements() as f64);
        self.bag
            .get_mut::<Sum>("num_target_elements")?
            .update(batch.num_target_elements() as f64);
        Ok(())
    }
}

impl Deref for Seq2SeqMetricBag {
    type Target = MetricBag;

    fn deref(&self) -> &MetricBag {
        &self.bag
    }
}

impl DerefMut for Seq2SeqMetricBag {
    fn deref_mut(&mut self) -> &mut MetricBag {
        &mut self.bag
    }
}

fn elements_per_second(values: &MetricValues) -> Option<f64> {
    let elapsed = values.get("generator_elapsed_time")?;
    let num_elements = values.get("generator_num_elements")?;
    (elapsed > 0.0).then(|| num_elements / elapsed)
}

/// Counters of a unit that runs a sequence generator.
#[derive(Debug)]
pub struct Seq2SeqGenerationMetricBag {
    bag: MetricBag,
}

impl Seq2SeqGenerationMetricBag {
    pub fn new() -> Result<Self, MetricError> {
        let mut bag = MetricBag::new();
        bag.register_metric("generator_num_elements", Sum::default(), false)?;
        bag.register_metric("generator_elapsed_time", Sum::default(), false)?;
        bag.register_metric("num_examples", Sum::default(), false)?;
        bag.register_metric("num_source_elements", Sum::default(), false)?;
        bag.register_derived("generator_elements_per_second", elements_per_second)?;
        Ok(Self { bag })
    }

    pub fn update_batch_metrics(
        &mut self,
        batch: &Seq2SeqBatch,
        num_generated_elements: usize,
        elapsed: Duration,
    ) -> Result<(), MetricError> {
        self.bag
            .get_mut::<Sum>("generator_num_elements")?
            .update(num_generated_elements as f64);
        self.bag
            .get_mut::<Sum>("generator_elapsed_time")?
            .update(elapsed.as_secs_f64());
        self.bag
            .get_mut::<Sum>("num_examples")?
            .update(batch.batch_size() as f64);
        self.bag
            .get_mut::<Sum>("num_source_elements")?
            .update(batch.num_source_elements() as f64);
        Ok(())
    }
}

impl Deref for Seq2SeqGenerationMetricBag {
    type Target = MetricBag;

    fn deref(&self) -> &MetricBag {
        &self.bag
    }
}

impl DerefMut for Seq2SeqGenerationMetricBag {
    fn deref_mut(&mut self) -> &mut MetricBag {
        &mut self.bag
    }
}
