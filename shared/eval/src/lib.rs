//! Distributed evaluation of sequence-to-sequence models.
//!
//! An [`Evaluator`] steps a list of [`EvalUnit`]s and their data readers in
//! lock-step on every rank, reduces each unit's metric bag across the
//! data-parallel gang and hands the result to a metric recorder.

mod config;
mod evaluator;
mod model;
mod output;
mod recipe;
mod unit;

use std::{io, path::PathBuf};
use tandem_data_provider::DataError;
use tandem_gang::GangError;
use tandem_metrics::MetricError;
use thiserror::Error;

pub use config::{
    preset, GangSection, MtEvalConfig, MtEvalDatasetSection, MtEvaluatorSection,
    Seq2SeqGeneratorSection, PRESETS,
};
pub use evaluator::{EvalSummary, Evaluator, EvaluatorOptions, PassReport, ReportCadence};
pub use model::{GeneratorOutput, MtCriterion, Seq2SeqGenerator, Seq2SeqModel, Seq2SeqOutput};
pub use output::{FileMode, FileSystem, RuntimeContext, StandardFileSystem, TranslationStreams};
pub use recipe::{create_scorers, load_mt_evaluator};
pub use unit::{EvalUnit, MtLossEvalUnit, MtScoreEvalUnit};

/// Failures before the first batch is processed.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("the {} output directory cannot be created", .path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the {} output file cannot be created", .path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unknown preset `{name}`, available: {}", PRESETS.join(", "))]
    UnknownPreset { name: String },

    #[error("unknown scorer `{0}`")]
    UnknownScorer(String),

    #[error("split `{split}` of dataset `{dataset}` has no directions")]
    NoDirections { dataset: String, split: String },
}

/// A batch whose side channel does not carry what a unit needs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("`batch.example` must not be `None`")]
    MissingExample,

    #[error("`batch.example` must be an object, but is {actual}")]
    ExampleNotAnObject { actual: &'static str },

    #[error("`batch.example` must contain a `{field}` item")]
    MissingField { field: &'static str },

    #[error("`batch.example[\"{field}\"]` must be an array of strings, but is {actual}")]
    NotAnArray {
        field: &'static str,
        actual: &'static str,
    },

    #[error("`batch.example[\"{field}\"][{index}]` must be a string, but is {actual}")]
    NotAString {
        field: &'static str,
        index: usize,
        actual: &'static str,
    },

    #[error("`batch.example[\"{field}\"]` has {actual} entries, but the batch has {expected} examples")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("unit `{unit}` received a malformed batch: {violation}")]
    Contract {
        unit: String,
        violation: ContractViolation,
    },

    #[error(transparent)]
    Gang(#[from] GangError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("model failed: {0:#}")]
    Model(anyhow::Error),

    #[error("failed to write {}", .path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to record metrics: {0:#}")]
    Record(anyhow::Error),
}

impl EvalError {
    /// Whether this rank failed only because a peer aborted the gang.
    pub fn is_gang_abort(&self) -> bool {
        matches!(
            self,
            EvalError::Gang(GangError::Aborted)
                | EvalError::Data(DataError::Gang(GangError::Aborted))
                | EvalError::Metric(MetricError::Gang(GangError::Aborted))
        )
    }
}
