use crate::{DataError, DataReader, Direction, ReadOptions, TextTokenizer};

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tandem_gang::Gang;
use tracing::{debug, info};

const SOURCE_SUFFIX: &str = ".source.txt";
const TARGET_SUFFIX: &str = ".target.txt";

/// A collection of line-aligned translation pairs, grouped by split and
/// direction.
pub trait ParallelTextDataset: Send + Sync {
    fn name(&self) -> &str;

    fn splits(&self) -> Result<Vec<String>, DataError>;

    /// The directions available in `split`, in sorted order.
    fn directions(&self, split: &str) -> Result<Vec<Direction>, DataError>;

    /// Creates a reader over this member's shard of `split`, restricted to
    /// `options.direction`. `gang` is the group the split is sharded over.
    fn create_reader(
        &self,
        split: &str,
        tokenizer: Arc<dyn TextTokenizer>,
        gang: Arc<dyn Gang>,
        min_seq_len: usize,
        max_seq_len: usize,
        options: ReadOptions,
    ) -> Result<DataReader, DataError>;
}

/// A dataset stored as `<root>/<split>/[<origin>/]<source>-<target>.{source,target}.txt`.
#[derive(Debug, Clone)]
pub struct GenericParallelTextDataset {
    name: String,
    root: PathBuf,
}

impl GenericParallelTextDataset {
    pub fn from_path(path: impl AsRef<Path>, name: Option<String>) -> Result<Self, DataError> {
        let root = fs::canonicalize(path.as_ref()).map_err(|source| DataError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let name = name.unwrap_or_else(|| {
            root.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "dataset".to_string())
        });
        info!(dataset = %name, root = %root.display(), "opened parallel text dataset");
        Ok(Self { name, root })
    }

    fn split_dir(&self, split: &str) -> Result<PathBuf, DataError> {
        let dir = self.root.join(split);
        if !dir.is_dir() {
            return Err(DataError::UnknownSplit {
                dataset: self.name.clone(),
                split: split.to_string(),
            });
        }
        Ok(dir)
    }

    fn pair_files(split_dir: &Path, direction: &Direction) -> (PathBuf, PathBuf) {
        let dir = match &direction.origin {
            Some(origin) => split_dir.join(origin),
            None => split_dir.to_path_buf(),
        };
        let pair = format!("{}-{}", direction.source_lang, direction.target_lang);
        (
            dir.join(format!("{pair}{SOURCE_SUFFIX}")),
            dir.join(format!("{pair}{TARGET_SUFFIX}")),
        )
    }

    fn scan_directions(
        dir: &Path,
        origin: Option<&str>,
        out: &mut Vec<Direction>,
    ) -> Result<(), DataError> {
        let entries = fs::read_dir(dir).map_err(|source| DataError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_dir() {
                if origin.is_none() {
                    Self::scan_directions(&path, Some(file_name), out)?;
                }
                continue;
            }
            let Some(pair) = file_name.strip_suffix(SOURCE_SUFFIX) else {
                continue;
            };
            match pair.parse::<Direction>() {
                Ok(direction) => out.push(match origin {
                    Some(origin) => direction.with_origin(origin),
                    None => direction,
                }),
                Err(_) => debug!(path = %path.display(), "skipping file with unparseable direction"),
            }
        }
        Ok(())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>, DataError> {
    let text = fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text.lines().map(str::to_string).collect())
}

impl ParallelTextDataset for GenericParallelTextDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn splits(&self) -> Result<Vec<String>, DataError> {
        let entries = fs::read_dir(&self.root).map_err(|source| DataError::Io {
            path: self.root.clone(),
            source,
        })?;
        let mut splits: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect();
        splits.sort();
        Ok(splits)
    }

    fn directions(&self, split: &str) -> Result<Vec<Direction>, DataError> {
        let dir = self.split_dir(split)?;
        let mut directions = Vec::new();
        Self::scan_directions(&dir, None, &mut directions)?;
        directions.sort();
        Ok(directions)
    }

    fn create_reader(
        &self,
        split: &str,
        tokenizer: Arc<dyn TextTokenizer>,
        gang: Arc<dyn Gang>,
        min_seq_len: usize,
        max_seq_len: usize,
        options: ReadOptions,
    ) -> Result<DataReader, DataError> {
        let (source_path, target_path) =
            Self::pair_files(&self.split_dir(split)?, &options.direction);
        if !source_path.is_file() {
            return Err(DataError::UnknownDirection {
                dataset: self.name.clone(),
                split: split.to_string(),
                direction: options.direction,
            });
        }

        let sources = read_lines(&source_path)?;
        let targets = read_lines(&target_path)?;
        if sources.len() != targets.len() {
            return Err(DataError::Misaligned {
                path: source_path,
                source_lines: sources.len(),
                target_lines: targets.len(),
            });
        }

        debug!(
            dataset = %self.name,
            split,
            direction = %options.direction,
            num_examples = sources.len(),
            "loaded parallel text"
        );
        Ok(DataReader::new(
            format!("{}/{split}/{}", self.name, options.direction),
            sources.into_iter().zip(targets).collect(),
            tokenizer,
            gang,
            min_seq_len,
            max_seq_len,
            options,
        ))
    }
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryParallelTextDataset {
    name: String,
    splits: BTreeMap<String, BTreeMap<Direction, Vec<(String, String)>>>,
}

impl InMemoryParallelTextDataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            splits: BTreeMap::new(),
        }
    }

    pub fn with_pairs(
        mut self,
        split: impl Into<String>,
        direction: Direction,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.splits
            .entry(split.into())
            .or_default()
            .entry(direction)
            .or_default()
            .extend(pairs);
        self
    }
}

impl ParallelTextDataset for InMemoryParallelTextDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn splits(&self) -> Result<Vec<String>, DataError> {
        Ok(self.splits.keys().cloned().collect())
    }

    fn directions(&self, split: &str) -> Result<Vec<Direction>, DataError> {
        let directions = self.splits.get(split).ok_or_else(|| DataError::UnknownSplit {
            dataset: self.name.clone(),
            split: split.to_string(),
        })?;
        Ok(directions.keys().cloned().collect())
    }

    fn create_reader(
        &self,
        split: &str,
        tokenizer: Arc<dyn TextTokenizer>,
        gang: Arc<dyn Gang>,
        min_seq_len: usize,
        max_seq_len: usize,
        options: ReadOptions,
    ) -> Result<DataReader, DataError> {
        let directions = self.splits.get(split).ok_or_else(|| DataError::UnknownSplit {
            dataset: self.name.clone(),
            split: split.to_string(),
        })?;
        let Some(pairs) = directions.get(&options.direction) else {
            return Err(DataError::UnknownDirection {
                dataset: self.name.clone(),
                split: split.to_string(),
                direction: options.direction,
            });
        };
        Ok(DataReader::new(
            format!("{}/{split}/{}", self.name, options.direction),
            pairs.clone(),
            tokenizer,
            gang,
            min_seq_len,
            max_seq_len,
            options,
        ))
    }
}
