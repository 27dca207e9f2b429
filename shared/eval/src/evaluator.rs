use crate::{EvalError, EvalUnit};

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tandem_core::Stopwatch;
use tandem_data_provider::DataReader;
use tandem_gang::Gangs;
use tandem_metrics::{LogMetricRecorder, MetricRecorder, MetricValues};
use tracing::{debug, error, info};

const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] step {pos} {msg}";

/// When running values are reduced and recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCadence {
    /// Every `n` steps, and at the end of each pass.
    EveryNSteps(u64),
    EndOfPass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorOptions {
    pub num_passes: usize,
    pub cadence: ReportCadence,
    /// Shows a spinner on the coordinator.
    pub show_progress: bool,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            num_passes: 1,
            cadence: ReportCadence::EndOfPass,
            show_progress: false,
        }
    }
}

/// The reduced values of every unit at the end of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub pass: usize,
    pub units: Vec<(String, MetricValues)>,
}

impl PassReport {
    pub fn unit(&self, display_name: &str) -> Option<&MetricValues> {
        self.units
            .iter()
            .find(|(name, _)| name == display_name)
            .map(|(_, values)| values)
    }
}

#[derive(Debug, Clone)]
pub struct EvalSummary {
    pub passes: Vec<PassReport>,
    pub num_steps: u64,
    pub elapsed: Duration,
}

impl EvalSummary {
    pub fn last_pass(&self) -> Option<&PassReport> {
        self.passes.last()
    }
}

/// Drives units over their readers in lock-step on every rank.
///
/// A step asks each still-active reader for its next batches and hands them
/// to the paired unit. Readers synchronize over the data-parallel gang, so
/// all ranks agree on when a reader is done and on the step count. Metric
/// bags are reduced over the data-parallel gang; only root rank 0 records.
pub struct Evaluator {
    units: Vec<Box<dyn EvalUnit>>,
    readers: Vec<DataReader>,
    gangs: Gangs,
    options: EvaluatorOptions,
    recorder: Box<dyn MetricRecorder>,
    step_nr: u64,
    // values recorded by the periodic report, and the step they were taken at
    last_report: Option<(u64, Vec<(String, MetricValues)>)>,
}

impl Evaluator {
    pub fn new(
        units_and_readers: Vec<(Box<dyn EvalUnit>, DataReader)>,
        gangs: Gangs,
        options: EvaluatorOptions,
    ) -> Self {
        let (units, readers) = units_and_readers.into_iter().unzip();
        Self {
            units,
            readers,
            gangs,
            options,
            recorder: Box::new(LogMetricRecorder),
            step_nr: 0,
            last_report: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Box<dyn MetricRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn gangs(&self) -> &Gangs {
        &self.gangs
    }

    pub fn options(&self) -> &EvaluatorOptions {
        &self.options
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|unit| unit.display_name())
    }

    pub fn units(&self) -> &[Box<dyn EvalUnit>] {
        &self.units
    }

    /// Runs every pass. On failure the gangs are aborted, so peers blocked
    /// in a collective fail instead of waiting out their timeout.
    pub fn run(&mut self) -> Result<EvalSummary, EvalError> {
        let result = self.run_passes();
        if let Err(err) = &result {
            error!(
                rank = self.gangs.root.rank(),
                step = self.step_nr,
                "evaluation aborted: {err}"
            );
            self.gangs.abort();
        }
        result
    }

    fn run_passes(&mut self) -> Result<EvalSummary, EvalError> {
        let stopwatch = Stopwatch::started();
        let rank = self.gangs.root.rank();
        info!(
            rank,
            num_units = self.units.len(),
            num_passes = self.options.num_passes,
            "running evaluation"
        );

        let progress = (self.options.show_progress && self.gangs.root.is_coordinator()).then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });

        let mut passes = Vec::with_capacity(self.options.num_passes);
        for pass in 0..self.options.num_passes {
            if pass > 0 {
                for unit in &mut self.units {
                    unit.metric_bag_mut().reset_non_persistent_metrics();
                }
                for reader in &mut self.readers {
                    reader.reset();
                }
            }
            if let Some(bar) = &progress {
                bar.set_message(format!("pass {}/{}", pass + 1, self.options.num_passes));
            }
            self.last_report = None;

            self.run_pass(progress.as_ref())?;

            let units = match self.last_report.take() {
                Some((step, units)) if step == self.step_nr => units,
                _ => self.report(Some(self.step_nr))?,
            };
            passes.push(PassReport { pass, units });
        }

        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        self.gangs.root.barrier()?;
        self.recorder.close().map_err(EvalError::Record)?;

        let elapsed = stopwatch.elapsed();
        info!(
            rank,
            steps = self.step_nr,
            elapsed_secs = elapsed.as_secs_f64(),
            "evaluation complete"
        );
        Ok(EvalSummary {
            passes,
            num_steps: self.step_nr,
            elapsed,
        })
    }

    fn run_pass(&mut self, progress: Option<&ProgressBar>) -> Result<(), EvalError> {
        let mut active = vec![true; self.readers.len()];
        loop {
            let mut progressed = false;
            for (i, (unit, reader)) in self.units.iter_mut().zip(&mut self.readers).enumerate() {
                if !active[i] {
                    continue;
                }
                let Some(batches) = reader.next_batches()? else {
                    debug!(unit = unit.display_name(), step = self.step_nr, "reader finished");
                    active[i] = false;
                    continue;
                };
                progressed = true;
                // an empty list pads a step for a rank whose shard ran out
                for batch in &batches {
                    unit.invoke(batch)?;
                }
            }
            if !progressed {
                return Ok(());
            }

            self.step_nr += 1;
            if let Some(bar) = progress {
                bar.inc(1);
            }
            if let ReportCadence::EveryNSteps(n) = self.options.cadence {
                if n > 0 && self.step_nr % n == 0 {
                    let units = self.report(Some(self.step_nr))?;
                    self.last_report = Some((self.step_nr, units));
                }
            }
        }
    }

    /// Reduces every bag over the data-parallel gang and records on root rank 0.
    fn report(&mut self, step: Option<u64>) -> Result<Vec<(String, MetricValues)>, EvalError> {
        let is_recorder = self.gangs.root.rank() == 0;
        let mut reports = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let values = unit.metric_bag().reduce(self.gangs.dp.as_ref())?;
            if is_recorder {
                self.recorder
                    .record_metrics(unit.display_name(), &values, step)
                    .map_err(EvalError::Record)?;
            }
            reports.push((unit.display_name().to_string(), values));
        }
        Ok(reports)
    }
}
