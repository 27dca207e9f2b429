use std::{fs::OpenOptions, path::PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Installs the global subscriber. Fails if one is already set.
    pub fn init(self) -> anyhow::Result<()> {
        init_logging_core(self.output, self.level, self.write_logs_file)
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

fn quiet_runtime(filter: EnvFilter) -> anyhow::Result<EnvFilter> {
    // the prefetch workers drive tokio channels; their traces are noise
    Ok(filter
        .add_directive("tokio=off".parse::<Directive>()?)
        .add_directive("runtime=off".parse::<Directive>()?))
}

fn output_logs_filter(level: Level) -> anyhow::Result<EnvFilter> {
    quiet_runtime(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    )
}

/// `WRITE_RUST_LOG` wins over `RUST_LOG` for the file layer.
fn detailed_logs_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let filter = if std::env::var("WRITE_RUST_LOG").is_ok() {
        EnvFilter::builder()
            .with_env_var("WRITE_RUST_LOG")
            .from_env()?
    } else {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?
    };
    quiet_runtime(filter)
}

fn init_logging_core(
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

    match output {
        LogOutput::Console => layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(output_logs_filter(level)?)
                .boxed(),
        ),
        LogOutput::Json => layers.push(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_logs_filter(level)?)
                .boxed(),
        ),
        LogOutput::None => {}
    }

    if let Some(log_file_path) = write_logs_file {
        let log_file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_file_path)
            .with_context(|| format!("failed to open log file {}", log_file_path.display()))?;

        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(log_file)
                .with_filter(detailed_logs_filter(level)?)
                .boxed(),
        );
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
