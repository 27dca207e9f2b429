//! Stand-ins for a real encoder-decoder, so a dataset can be pushed through
//! the whole evaluation pipeline without a network.

use anyhow::{ensure, Result};
use tandem_data_provider::Seq2SeqBatch;
use tandem_eval::{
    GeneratorOutput, Seq2SeqGenerator, Seq2SeqGeneratorSection, Seq2SeqModel, Seq2SeqOutput,
};

/// Assigns every token of the vocabulary the same probability.
#[derive(Debug, Clone, Copy)]
pub struct UniformModel {
    vocab_size: usize,
}

impl UniformModel {
    pub fn new(vocab_size: usize) -> Result<Self> {
        ensure!(vocab_size > 0, "vocabulary must not be empty");
        Ok(Self { vocab_size })
    }
}

impl Seq2SeqModel for UniformModel {
    fn forward(&self, batch: &Seq2SeqBatch) -> Result<Seq2SeqOutput> {
        let n = batch.num_target_elements() as f64;
        let nll_per_token = (self.vocab_size as f64).ln();
        Ok(Seq2SeqOutput {
            nll_loss: n * nll_per_token,
            smooth_loss: n * self.vocab_size as f64 * nll_per_token,
            vocab_size: self.vocab_size,
        })
    }
}

/// Translates by copying the source, cut to the configured maximum length.
#[derive(Debug, Clone)]
pub struct CopyGenerator {
    section: Seq2SeqGeneratorSection,
}

impl CopyGenerator {
    pub fn new(section: Seq2SeqGeneratorSection) -> Self {
        Self { section }
    }
}

impl Seq2SeqGenerator for CopyGenerator {
    fn generate(&self, source_seqs: &[Vec<u32>]) -> Result<GeneratorOutput> {
        let hypotheses = source_seqs
            .iter()
            .map(|seq| {
                let max_len = self.section.max_gen_len_for(seq.len());
                seq.iter().copied().take(max_len).collect()
            })
            .collect();
        Ok(GeneratorOutput { hypotheses })
    }
}
