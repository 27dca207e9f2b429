//! Process groups ("gangs") and the collectives evaluation relies on.
//!
//! A [`Gang`] is one coordination group of workers. Three of them form a
//! [`Gangs`] bundle: `root` spans every worker, `dp` is the group the dataset
//! is sharded over, and `tp` is the group a single example is split across.
//!
//! Collectives are blocking. A collective that cannot complete within the
//! gang's [`WaitPolicy`] fails with [`GangError::Timeout`] and poisons the
//! gang: every later collective fails with [`GangError::Aborted`].

mod fake;
mod gangs;
mod thread;

use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

pub use fake::FakeGang;
pub use gangs::{Gangs, ParallelismConfig};
pub use thread::ThreadGang;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Mean,
}

impl ReduceOp {
    /// Combines `contributions` element-wise into `out`.
    pub(crate) fn combine(self, out: &mut [f64], contributions: &[Vec<f64>]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let values = contributions.iter().map(|c| c[i]);
            *slot = match self {
                ReduceOp::Sum => values.sum(),
                ReduceOp::Max => values.fold(f64::NEG_INFINITY, f64::max),
                ReduceOp::Min => values.fold(f64::INFINITY, f64::min),
                ReduceOp::Mean => {
                    let n = contributions.len().max(1) as f64;
                    values.sum::<f64>() / n
                }
            };
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GangError {
    #[error("collective `{op}` timed out on rank {rank} after {waited:?}")]
    Timeout {
        op: &'static str,
        rank: usize,
        waited: Duration,
    },

    #[error("gang was aborted by an earlier failed collective")]
    Aborted,

    #[error("collective mismatch observed by rank {rank}: {reason}")]
    Mismatch { rank: usize, reason: String },

    #[error("rank {rank} is out of range for a gang of size {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("invalid gang topology: root size {root} != dp size {dp} * tp size {tp}")]
    InvalidTopology { root: usize, dp: usize, tp: usize },

    #[error("gang state lock poisoned")]
    Poisoned,
}

/// How long a member waits for its peers inside one collective.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Option<Duration>,
}

impl WaitPolicy {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    pub fn unbounded() -> Self {
        Self { timeout: None }
    }

    pub fn bounded(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::bounded(Self::DEFAULT_TIMEOUT)
    }
}

pub trait Gang: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn device(&self) -> Device;

    /// Combines `values` element-wise across all members. Every member ends up
    /// with the identical result.
    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> Result<(), GangError>;

    /// Returns every member's `value`, indexed by rank.
    fn all_gather(&self, value: f64) -> Result<Vec<f64>, GangError>;

    /// Replaces `values` on every member with the contents held by `source_rank`.
    fn broadcast(&self, values: &mut Vec<f64>, source_rank: usize) -> Result<(), GangError>;

    fn barrier(&self) -> Result<(), GangError>;

    /// Marks the gang as failed and wakes members blocked in a collective.
    /// Pending and later collectives fail with [`GangError::Aborted`].
    fn abort(&self) {}

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_ops_combine_elementwise() {
        let contributions = vec![vec![1.0, 5.0], vec![3.0, -1.0]];
        let mut out = [0.0; 2];

        ReduceOp::Sum.combine(&mut out, &contributions);
        assert_eq!(out, [4.0, 4.0]);
        ReduceOp::Max.combine(&mut out, &contributions);
        assert_eq!(out, [3.0, 5.0]);
        ReduceOp::Min.combine(&mut out, &contributions);
        assert_eq!(out, [1.0, -1.0]);
        ReduceOp::Mean.combine(&mut out, &contributions);
        assert_eq!(out, [2.0, 2.0]);
    }
}
