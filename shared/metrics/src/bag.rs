use crate::{Metric, MetricError, MetricValues};

use std::fmt;
use tandem_gang::Gang;
use tracing::trace;

/// Computes a value from already-reduced metrics, e.g. a throughput.
pub type DerivedMetric = fn(&MetricValues) -> Option<f64>;

#[derive(Debug)]
struct Entry {
    name: String,
    metric: Box<dyn Metric>,
    persistent: bool,
}

/// A named set of metrics owned by one evaluation unit.
#[derive(Default)]
pub struct MetricBag {
    entries: Vec<Entry>,
    derived: Vec<(String, DerivedMetric)>,
}

impl fmt::Debug for MetricBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricBag")
            .field("entries", &self.entries)
            .field("derived", &self.derived.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

impl MetricBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a metric under `name`. Persistent metrics survive
    /// [`MetricBag::reset_non_persistent_metrics`].
    pub fn register_metric(
        &mut self,
        name: impl Into<String>,
        metric: impl Metric + 'static,
        persistent: bool,
    ) -> Result<(), MetricError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(MetricError::DuplicateMetric(name));
        }
        self.entries.push(Entry {
            name,
            metric: Box::new(metric),
            persistent,
        });
        Ok(())
    }

    /// Adds a value computed after every [`MetricBag::reduce`].
    pub fn register_derived(
        &mut self,
        name: impl Into<String>,
        derive: DerivedMetric,
    ) -> Result<(), MetricError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(MetricError::DuplicateMetric(name));
        }
        self.derived.push((name, derive));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name) || self.derived.iter().any(|(n, _)| n == name)
    }

    /// Metric names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn get<M: Metric + 'static>(&self, name: &str) -> Result<&M, MetricError> {
        let entry = self.entry(name)?;
        // deref the box so the downcast targets the metric, not the box
        (*entry.metric)
            .as_any()
            .downcast_ref::<M>()
            .ok_or_else(|| MetricError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<M>(),
            })
    }

    pub fn get_mut<M: Metric + 'static>(&mut self, name: &str) -> Result<&mut M, MetricError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| MetricError::UnknownMetric(name.to_string()))?;
        (*entry.metric)
            .as_any_mut()
            .downcast_mut::<M>()
            .ok_or_else(|| MetricError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<M>(),
            })
    }

    /// Values of the local, unreduced state.
    pub fn local_values(&self) -> MetricValues {
        let mut values = MetricValues::default();
        for entry in &self.entries {
            values.insert(entry.name.clone(), entry.metric.value());
        }
        self.add_derived(&mut values);
        values
    }

    /// Reduces every metric across `gang`, one collective per metric in
    /// registration order. Local state is left untouched, so this can be
    /// called any number of times between updates.
    pub fn reduce(&self, gang: &dyn Gang) -> Result<MetricValues, MetricError> {
        let mut values = MetricValues::default();
        for entry in &self.entries {
            let mut state = entry.metric.state();
            gang.all_reduce(&mut state, entry.metric.reduce_op())?;
            trace!(metric = %entry.name, rank = gang.rank(), ?state, "reduced metric");
            values.insert(entry.name.clone(), entry.metric.compute(&state));
        }
        self.add_derived(&mut values);
        Ok(values)
    }

    pub fn reset_metrics(&mut self) {
        for entry in &mut self.entries {
            entry.metric.reset();
        }
    }

    pub fn reset_non_persistent_metrics(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.persistent) {
            entry.metric.reset();
        }
    }

    fn entry(&self, name: &str) -> Result<&Entry, MetricError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| MetricError::UnknownMetric(name.to_string()))
    }

    fn add_derived(&self, values: &mut MetricValues) {
        for (name, derive) in &self.derived {
            if let Some(value) = derive(values) {
                values.insert(name.clone(), value);
            }
        }
    }
}
