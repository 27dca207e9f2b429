use crate::EvalError;

use anyhow::Result;
use std::sync::Arc;
use tandem_data_provider::Seq2SeqBatch;
use tandem_metrics::Seq2SeqMetricBag;

/// Losses of one forward pass, summed over the batch's target tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Seq2SeqOutput {
    /// Negative log-likelihood of the reference tokens.
    pub nll_loss: f64,
    /// Negative log-probability summed over the whole vocabulary.
    pub smooth_loss: f64,
    pub vocab_size: usize,
}

impl Seq2SeqOutput {
    /// Label-smoothed loss with smoothing `epsilon` spread over the
    /// `vocab_size - 1` non-reference tokens.
    pub fn label_smoothed_loss(&self, epsilon: f64) -> f64 {
        if epsilon == 0.0 || self.vocab_size < 2 {
            return self.nll_loss;
        }
        let eps_i = epsilon / (self.vocab_size - 1) as f64;
        (1.0 - epsilon - eps_i) * self.nll_loss + eps_i * self.smooth_loss
    }
}

/// An encoder-decoder model. Shared read-only by all units.
pub trait Seq2SeqModel: Send + Sync {
    fn forward(&self, batch: &Seq2SeqBatch) -> Result<Seq2SeqOutput>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorOutput {
    pub hypotheses: Vec<Vec<u32>>,
}

impl GeneratorOutput {
    pub fn num_generated_elements(&self) -> usize {
        self.hypotheses.iter().map(Vec::len).sum()
    }
}

/// Produces one hypothesis per source sequence. Decoding strategy is the
/// implementation's concern.
pub trait Seq2SeqGenerator: Send + Sync {
    fn generate(&self, source_seqs: &[Vec<u32>]) -> Result<GeneratorOutput>;
}

/// Computes the label-smoothed translation loss of a batch.
#[derive(Clone)]
pub struct MtCriterion {
    model: Arc<dyn Seq2SeqModel>,
    label_smoothing: f64,
}

impl MtCriterion {
    pub fn new(model: Arc<dyn Seq2SeqModel>, label_smoothing: f64) -> Self {
        Self {
            model,
            label_smoothing,
        }
    }

    pub fn label_smoothing(&self) -> f64 {
        self.label_smoothing
    }

    pub fn evaluate(
        &self,
        batch: &Seq2SeqBatch,
        metric_bag: &mut Seq2SeqMetricBag,
    ) -> Result<(), EvalError> {
        let output = self.model.forward(batch).map_err(EvalError::Model)?;
        let loss = output.label_smoothed_loss(self.label_smoothing);

        metric_bag.update_nll_loss(batch, loss, output.nll_loss)?;
        metric_bag.update_batch_metrics(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_smoothing_mixes_nll_and_smooth_loss() {
        let output = Seq2SeqOutput {
            nll_loss: 10.0,
            smooth_loss: 50.0,
            vocab_size: 11,
        };
        assert_eq!(output.label_smoothed_loss(0.0), 10.0);
        // eps_i = 0.01: 0.89 * 10 + 0.01 * 50
        let loss = output.label_smoothed_loss(0.1);
        assert!((loss - 9.4).abs() < 1e-9, "{loss}");
    }

    #[test]
    fn degenerate_vocabulary_falls_back_to_nll() {
        let output = Seq2SeqOutput {
            nll_loss: 3.0,
            smooth_loss: 3.0,
            vocab_size: 1,
        };
        assert_eq!(output.label_smoothed_loss(0.1), 3.0);
    }
}
