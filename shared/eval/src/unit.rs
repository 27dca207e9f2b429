use crate::{ContractViolation, EvalError, MtCriterion, Seq2SeqGenerator, TranslationStreams};

use serde_json::Value;
use std::sync::Arc;
use tandem_core::Stopwatch;
use tandem_data_provider::{Direction, Seq2SeqBatch, TextTokenizer};
use tandem_metrics::{
    MetricBag, MetricError, ScoreMetric, Seq2SeqGenerationMetricBag, Seq2SeqMetricBag, TextScorer,
};
use tracing::trace;

/// Turns one batch at a time into metric updates.
///
/// Implementations must not fail on a well-formed batch. A batch missing
/// what the unit needs is a wiring mistake and aborts the run.
pub trait EvalUnit: Send {
    fn display_name(&self) -> &str;

    fn invoke(&mut self, batch: &Seq2SeqBatch) -> Result<(), EvalError>;

    fn metric_bag(&self) -> &MetricBag;

    fn metric_bag_mut(&mut self) -> &mut MetricBag;
}

/// Label-smoothed loss of each batch.
pub struct MtLossEvalUnit {
    display_name: String,
    criterion: Arc<MtCriterion>,
    metric_bag: Seq2SeqMetricBag,
}

impl MtLossEvalUnit {
    pub fn new(criterion: Arc<MtCriterion>, direction: &Direction) -> Result<Self, MetricError> {
        Ok(Self {
            display_name: format!("loss/{direction}"),
            criterion,
            metric_bag: Seq2SeqMetricBag::new()?,
        })
    }
}

impl EvalUnit for MtLossEvalUnit {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn invoke(&mut self, batch: &Seq2SeqBatch) -> Result<(), EvalError> {
        self.criterion.evaluate(batch, &mut self.metric_bag)
    }

    fn metric_bag(&self) -> &MetricBag {
        &self.metric_bag
    }

    fn metric_bag_mut(&mut self) -> &mut MetricBag {
        &mut self.metric_bag
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn text_field(
    example: &serde_json::Map<String, Value>,
    field: &'static str,
    batch_size: usize,
) -> Result<Vec<String>, ContractViolation> {
    let value = example
        .get(field)
        .ok_or(ContractViolation::MissingField { field })?;
    let items = value.as_array().ok_or(ContractViolation::NotAnArray {
        field,
        actual: kind(value),
    })?;
    let texts = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or(ContractViolation::NotAString {
                    field,
                    index,
                    actual: kind(item),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if texts.len() != batch_size {
        return Err(ContractViolation::LengthMismatch {
            field,
            expected: batch_size,
            actual: texts.len(),
        });
    }
    Ok(texts)
}

/// Extracts the `source_text` and `target_text` arrays of a batch's side channel.
pub(crate) fn source_and_target_text(
    batch: &Seq2SeqBatch,
) -> Result<(Vec<String>, Vec<String>), ContractViolation> {
    let example = batch
        .example
        .as_ref()
        .ok_or(ContractViolation::MissingExample)?;
    let example = example
        .as_object()
        .ok_or(ContractViolation::ExampleNotAnObject {
            actual: kind(example),
        })?;
    let sources = text_field(example, "source_text", batch.batch_size())?;
    let targets = text_field(example, "target_text", batch.batch_size())?;
    Ok((sources, targets))
}

/// Generates translations, scores them against the references and, when
/// given streams, writes source, reference and hypothesis text.
pub struct MtScoreEvalUnit {
    display_name: String,
    generator: Arc<dyn Seq2SeqGenerator>,
    tokenizer: Arc<dyn TextTokenizer>,
    scorers: Vec<String>,
    streams: Option<TranslationStreams>,
    metric_bag: Seq2SeqGenerationMetricBag,
}

impl MtScoreEvalUnit {
    /// Scoring metrics are persistent: they accumulate across passes.
    pub fn new(
        direction: &Direction,
        generator: Arc<dyn Seq2SeqGenerator>,
        tokenizer: Arc<dyn TextTokenizer>,
        scorers: &[Arc<dyn TextScorer>],
        streams: Option<TranslationStreams>,
    ) -> Result<Self, MetricError> {
        let mut metric_bag = Seq2SeqGenerationMetricBag::new()?;
        for scorer in scorers {
            metric_bag.register_metric(scorer.name(), ScoreMetric::new(scorer.clone()), true)?;
        }
        Ok(Self {
            display_name: format!("score/{direction}"),
            generator,
            tokenizer,
            scorers: scorers.iter().map(|s| s.name().to_string()).collect(),
            streams,
            metric_bag,
        })
    }

    pub fn writes_output(&self) -> bool {
        self.streams.is_some()
    }
}

impl EvalUnit for MtScoreEvalUnit {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn invoke(&mut self, batch: &Seq2SeqBatch) -> Result<(), EvalError> {
        let (sources, references) =
            source_and_target_text(batch).map_err(|violation| EvalError::Contract {
                unit: self.display_name.clone(),
                violation,
            })?;

        let mut stopwatch = Stopwatch::new();
        let output = stopwatch
            .time(|| self.generator.generate(&batch.source_seqs))
            .map_err(EvalError::Model)?;

        let hypotheses = output
            .hypotheses
            .iter()
            .map(|ids| self.tokenizer.decode(ids))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(EvalError::Model)?;

        for name in &self.scorers {
            self.metric_bag
                .get_mut::<ScoreMetric>(name)?
                .update(&references, &hypotheses);
        }
        self.metric_bag.update_batch_metrics(
            batch,
            output.num_generated_elements(),
            stopwatch.elapsed(),
        )?;

        if let Some(streams) = &mut self.streams {
            streams.write_batch(&sources, &references, &hypotheses)?;
        }
        trace!(unit = %self.display_name, batch_size = batch.batch_size(), "scored batch");
        Ok(())
    }

    fn metric_bag(&self) -> &MetricBag {
        &self.metric_bag
    }

    fn metric_bag_mut(&mut self) -> &mut MetricBag {
        &mut self.metric_bag
    }
}
