use crate::MetricValues;

use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

/// Sink for reduced metric values.
pub trait MetricRecorder: Send {
    fn record_metrics(&mut self, run: &str, values: &MetricValues, step: Option<u64>)
        -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Logs each record as a single `info` event.
#[derive(Debug, Default)]
pub struct LogMetricRecorder;

impl MetricRecorder for LogMetricRecorder {
    fn record_metrics(
        &mut self,
        run: &str,
        values: &MetricValues,
        step: Option<u64>,
    ) -> Result<()> {
        match step {
            Some(step) => info!(run, step, "{values}"),
            None => info!(run, "{values}"),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    time: String,
    run: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<u64>,
    metrics: &'a MetricValues,
}

/// Appends one JSON object per record to a file.
#[derive(Debug)]
pub struct JsonlMetricRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricRecorder {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricRecorder for JsonlMetricRecorder {
    fn record_metrics(
        &mut self,
        run: &str,
        values: &MetricValues,
        step: Option<u64>,
    ) -> Result<()> {
        let record = JsonRecord {
            time: OffsetDateTime::now_utc().format(&Rfc3339)?,
            run,
            step,
            metrics: values,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }
}

/// Fans every record out to several recorders.
#[derive(Default)]
pub struct CompositeMetricRecorder {
    inner: Vec<Box<dyn MetricRecorder>>,
}

impl CompositeMetricRecorder {
    pub fn new(inner: Vec<Box<dyn MetricRecorder>>) -> Self {
        Self { inner }
    }

    pub fn push(&mut self, recorder: impl MetricRecorder + 'static) {
        self.inner.push(Box::new(recorder));
    }
}

impl MetricRecorder for CompositeMetricRecorder {
    fn record_metrics(
        &mut self,
        run: &str,
        values: &MetricValues,
        step: Option<u64>,
    ) -> Result<()> {
        for recorder in &mut self.inner {
            recorder.record_metrics(run, values, step)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for recorder in &mut self.inner {
            recorder.close()?;
        }
        Ok(())
    }
}
