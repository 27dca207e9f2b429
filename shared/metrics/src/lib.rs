//! Reducible evaluation metrics.
//!
//! Every [`Metric`] exposes a flat state vector and the collective that
//! merges it, so a [`MetricBag`] can be reduced across a gang with one
//! all-reduce per metric without touching local state.

mod bag;
mod metric;
mod recorder;
mod score;
mod seq2seq;

use serde::Serialize;
use std::{collections::BTreeMap, fmt};
use tandem_gang::GangError;
use thiserror::Error;

pub use bag::{DerivedMetric, MetricBag};
pub use metric::{AsAny, Max, Mean, Metric, Min, Sum};
pub use recorder::{
    CompositeMetricRecorder, JsonlMetricRecorder, LogMetricRecorder, MetricRecorder,
};
pub use score::{ExactMatchScorer, ScoreMetric, TextScorer};
pub use seq2seq::{Seq2SeqGenerationMetricBag, Seq2SeqMetricBag};

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("metric `{0}` is already registered")]
    DuplicateMetric(String),

    #[error("no metric named `{0}`")]
    UnknownMetric(String),

    #[error("metric `{name}` is not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },

    #[error("failed to reduce metrics: {0}")]
    Gang(#[from] GangError),
}

/// Computed metric values keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricValues(BTreeMap<String, f64>);

impl MetricValues {
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MetricValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            if value.fract() == 0.0 && value.abs() < 1e15 {
                write!(f, "{name}: {value:.0}")?;
            } else {
                write!(f, "{name}: {value:.4}")?;
            }
        }
        Ok(())
    }
}
