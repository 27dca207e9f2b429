use crate::{EvalError, SetupError};

use std::{
    fmt::Debug,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tandem_data_provider::Direction;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Write,
    Append,
}

pub trait FileSystem: Send + Sync + Debug {
    fn make_directory(&self, path: &Path) -> io::Result<()>;

    fn open_text(&self, path: &Path, mode: FileMode) -> io::Result<Box<dyn Write + Send>>;
}

/// The local file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFileSystem;

impl FileSystem for StandardFileSystem {
    fn make_directory(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn open_text(&self, path: &Path, mode: FileMode) -> io::Result<Box<dyn Write + Send>> {
        let file: File = match mode {
            FileMode::Write => File::create(path)?,
            FileMode::Append => OpenOptions::new().create(true).append(true).open(path)?,
        };
        Ok(Box::new(file))
    }
}

/// Process-level services handed down to recipes. Built once by the caller;
/// nothing here is global.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    file_system: Arc<dyn FileSystem>,
    output_dir: PathBuf,
}

impl RuntimeContext {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            file_system: Arc::new(StandardFileSystem),
            output_dir: output_dir.into(),
        }
    }

    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    pub fn file_system(&self) -> &dyn FileSystem {
        self.file_system.as_ref()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

struct TextStream {
    path: PathBuf,
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl TextStream {
    fn open(fs: &dyn FileSystem, path: PathBuf) -> Result<Self, SetupError> {
        match fs.open_text(&path, FileMode::Write) {
            Ok(file) => Ok(Self {
                writer: BufWriter::new(file),
                path,
            }),
            Err(source) => Err(SetupError::OpenFile { path, source }),
        }
    }

    fn write_lines(&mut self, lines: &[String]) -> Result<(), EvalError> {
        let result = lines
            .iter()
            .try_for_each(|line| writeln!(self.writer, "{line}"))
            .and_then(|_| self.writer.flush());
        result.map_err(|source| EvalError::Output {
            path: self.path.clone(),
            source,
        })
    }
}

/// The source, reference and hypothesis files one data-parallel rank writes
/// for one direction: `translations/{direction}/rank_{dp_rank}.{src,ref,hyp}.txt`.
pub struct TranslationStreams {
    src: TextStream,
    refs: TextStream,
    hyp: TextStream,
}

impl TranslationStreams {
    pub fn create(
        fs: &dyn FileSystem,
        output_dir: &Path,
        direction: &Direction,
        dp_rank: usize,
    ) -> Result<Self, SetupError> {
        let dir = output_dir.join("translations").join(direction.to_string());
        fs.make_directory(&dir)
            .map_err(|source| SetupError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;

        let file = |kind: &str| dir.join(format!("rank_{dp_rank}.{kind}.txt"));
        let streams = Self {
            src: TextStream::open(fs, file("src"))?,
            refs: TextStream::open(fs, file("ref"))?,
            hyp: TextStream::open(fs, file("hyp"))?,
        };
        debug!(dir = %dir.display(), dp_rank, "opened translation output");
        Ok(streams)
    }

    /// Appends one line per example to each stream and flushes.
    pub fn write_batch(
        &mut self,
        sources: &[String],
        references: &[String],
        hypotheses: &[String],
    ) -> Result<(), EvalError> {
        self.src.write_lines(sources)?;
        self.refs.write_lines(references)?;
        self.hyp.write_lines(hypotheses)
    }

    pub fn paths(&self) -> [&Path; 3] {
        [&self.src.path, &self.refs.path, &self.hyp.path]
    }
}
