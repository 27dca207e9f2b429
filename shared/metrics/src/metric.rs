use std::{any::Any, fmt::Debug};
use tandem_gang::ReduceOp;

pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A statistic that can be merged across gang members.
///
/// The state is a flat vector combined element-wise with [`Metric::reduce_op`];
/// [`Metric::compute`] turns a (possibly reduced) state into the reported value.
pub trait Metric: AsAny + Send + Debug {
    fn reset(&mut self);

    fn state(&self) -> Vec<f64>;

    fn reduce_op(&self) -> ReduceOp;

    fn compute(&self, state: &[f64]) -> f64;

    fn value(&self) -> f64 {
        self.compute(&self.state())
    }
}

/// Running total. Also serves as the counter.
#[derive(Debug, Default, Clone)]
pub struct Sum {
    total: f64,
}

impl Sum {
    pub fn update(&mut self, value: f64) {
        self.total += value;
    }
}

impl Metric for Sum {
    fn reset(&mut self) {
        self.total = 0.0;
    }

    fn state(&self) -> Vec<f64> {
        vec![self.total]
    }

    fn reduce_op(&self) -> ReduceOp {
        ReduceOp::Sum
    }

    fn compute(&self, state: &[f64]) -> f64 {
        state[0]
    }
}

/// Weighted mean.
#[derive(Debug, Default, Clone)]
pub struct Mean {
    weighted_sum: f64,
    weight: f64,
}

impl Mean {
    pub fn update(&mut self, value: f64, weight: f64) {
        self.weighted_sum += value * weight;
        self.weight += weight;
    }
}

impl Metric for Mean {
    fn reset(&mut self) {
        self.weighted_sum = 0.0;
        self.weight = 0.0;
    }

    fn state(&self) -> Vec<f64> {
        vec![self.weighted_sum, self.weight]
    }

    fn reduce_op(&self) -> ReduceOp {
        ReduceOp::Sum
    }

    fn compute(&self, state: &[f64]) -> f64 {
        if state[1] == 0.0 {
            0.0
        } else {
            state[0] / state[1]
        }
    }
}

#[derive(Debug, Clone)]
pub struct Max {
    max: f64,
}

impl Default for Max {
    fn default() -> Self {
        Self {
            max: f64::NEG_INFINITY,
        }
    }
}

impl Max {
    pub fn update(&mut self, value: f64) {
        self.max = self.max.max(value);
    }
}

impl Metric for Max {
    fn reset(&mut self) {
        self.max = f64::NEG_INFINITY;
    }

    fn state(&self) -> Vec<f64> {
        vec![self.max]
    }

    fn reduce_op(&self) -> ReduceOp {
        ReduceOp::Max
    }

    // unset reports 0
    fn compute(&self, state: &[f64]) -> f64 {
        if state[0].is_finite() {
            state[0]
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct Min {
    min: f64,
}

impl Default for Min {
    fn default() -> Self {
        Self { min: f64::INFINITY }
    }
}

impl Min {
    pub fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
    }
}

impl Metric for Min {
    fn reset(&mut self) {
        self.min = f64::INFINITY;
    }

    fn state(&self) -> Vec<f64> {
        vec![self.min]
    }

    fn reduce_op(&self) -> ReduceOp {
        ReduceOp::Min
    }

    fn compute(&self, state: &[f64]) -> f64 {
        if state[0].is_finite() {
            state[0]
        } else {
            0.0
        }
    }
}
