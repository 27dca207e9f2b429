use crate::Metric;

use std::{fmt::Debug, sync::Arc};
use tandem_gang::ReduceOp;

/// A corpus-level text quality score computed from additive sufficient
/// statistics, so per-rank statistics can simply be summed.
pub trait TextScorer: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn num_statistics(&self) -> usize;

    /// Statistics for a batch of hypotheses against their references.
    /// Must return exactly [`TextScorer::num_statistics`] values.
    fn statistics(&self, references: &[String], hypotheses: &[String]) -> Vec<f64>;

    fn score(&self, statistics: &[f64]) -> f64;
}

/// Accumulates a [`TextScorer`]'s statistics as a reducible metric.
#[derive(Debug, Clone)]
pub struct ScoreMetric {
    scorer: Arc<dyn TextScorer>,
    statistics: Vec<f64>,
}

impl ScoreMetric {
    pub fn new(scorer: Arc<dyn TextScorer>) -> Self {
        let statistics = vec![0.0; scorer.num_statistics()];
        Self { scorer, statistics }
    }

    pub fn scorer(&self) -> &Arc<dyn TextScorer> {
        &self.scorer
    }

    pub fn update(&mut self, references: &[String], hypotheses: &[String]) {
        let batch = self.scorer.statistics(references, hypotheses);
        for (total, value) in self.statistics.iter_mut().zip(batch) {
            *total += value;
        }
    }
}

impl Metric for ScoreMetric {
    fn reset(&mut self) {
        self.statistics.iter_mut().for_each(|s| *s = 0.0);
    }

    fn state(&self) -> Vec<f64> {
        self.statistics.clone()
    }

    fn reduce_op(&self) -> ReduceOp {
        ReduceOp::Sum
    }

    fn compute(&self, state: &[f64]) -> f64 {
        self.scorer.score(state)
    }
}

/// Percentage of hypotheses equal to their reference, ignoring differences
/// in whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchScorer;

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl TextScorer for ExactMatchScorer {
    fn name(&self) -> &str {
        "exact_match"
    }

    fn num_statistics(&self) -> usize {
        2
    }

    fn statistics(&self, references: &[String], hypotheses: &[String]) -> Vec<f64> {
        let matches = references
            .iter()
            .zip(hypotheses)
            .filter(|(r, h)| normalize(r) == normalize(h))
            .count();
        vec![matches as f64, references.len() as f64]
    }

    fn score(&self, statistics: &[f64]) -> f64 {
        if statistics[1] == 0.0 {
            return 0.0;
        }
        100.0 * statistics[0] / statistics[1]
    }
}
