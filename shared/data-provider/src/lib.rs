mod batch;
mod batching;
mod dataset;
mod direction;
mod reader;
mod tokenizer;

use std::{io, path::PathBuf};
use tandem_gang::GangError;
use thiserror::Error;

pub use batch::{Seq2SeqBatch, Seq2SeqExample};
pub use batching::{Batching, LengthBatcher, SequenceLength, StaticBatcher};
pub use dataset::{GenericParallelTextDataset, InMemoryParallelTextDataset, ParallelTextDataset};
pub use direction::Direction;
pub use reader::{DataReader, ReadOptions, SyncMode};
pub use tokenizer::{load_tokenizer, ByteTokenizer, TextTokenizer};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source_lines} source lines but {target_lines} target lines", .path.display())]
    Misaligned {
        path: PathBuf,
        source_lines: usize,
        target_lines: usize,
    },

    #[error("dataset `{dataset}` has no split `{split}`")]
    UnknownSplit { dataset: String, split: String },

    #[error("split `{split}` of dataset `{dataset}` has no direction `{direction}`")]
    UnknownDirection {
        dataset: String,
        split: String,
        direction: Direction,
    },

    #[error("invalid direction `{0}`, expected `[origin/]source-target`")]
    InvalidDirection(String),

    #[error("failed to load tokenizer from {}: {message}", .path.display())]
    Tokenizer { path: PathBuf, message: String },

    #[error("failed to encode example: {0:#}")]
    Encode(anyhow::Error),

    #[error("failed to start prefetch worker for `{reader}`")]
    Spawn {
        reader: String,
        #[source]
        source: io::Error,
    },

    #[error("prefetch worker for `{0}` panicked")]
    PrefetchPanicked(String),

    #[error(transparent)]
    Gang(#[from] GangError),
}
