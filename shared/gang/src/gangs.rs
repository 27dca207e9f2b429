use crate::{FakeGang, Gang, GangError, ThreadGang, WaitPolicy};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Requested data- and tensor-parallel degrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelismConfig {
    pub dp: usize,
    pub tp: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self { dp: 1, tp: 1 }
    }
}

impl ParallelismConfig {
    pub fn world_size(&self) -> usize {
        self.dp * self.tp
    }
}

/// The root, data-parallel and tensor-parallel gangs of one worker.
#[derive(Clone, Debug)]
pub struct Gangs {
    pub root: Arc<dyn Gang>,
    pub dp: Arc<dyn Gang>,
    pub tp: Arc<dyn Gang>,
}

impl Gangs {
    pub fn new(
        root: Arc<dyn Gang>,
        dp: Arc<dyn Gang>,
        tp: Arc<dyn Gang>,
    ) -> Result<Self, GangError> {
        if root.size() != dp.size() * tp.size() {
            return Err(GangError::InvalidTopology {
                root: root.size(),
                dp: dp.size(),
                tp: tp.size(),
            });
        }
        Ok(Self { root, dp, tp })
    }

    /// The degenerate single-worker bundle.
    pub fn single() -> Self {
        let gang: Arc<dyn Gang> = Arc::new(FakeGang::default());
        Self {
            root: gang.clone(),
            dp: gang.clone(),
            tp: gang,
        }
    }

    /// Aborts all three gangs, failing every peer's pending and later collectives.
    pub fn abort(&self) {
        self.root.abort();
        self.dp.abort();
        self.tp.abort();
    }

    /// Builds the bundles of an in-process `dp x tp` cluster, indexed by root rank.
    ///
    /// Tensor-parallel ranks are contiguous: root rank `r` has dp rank
    /// `r / tp` and tp rank `r % tp`.
    pub fn thread_cluster(
        config: ParallelismConfig,
        policy: WaitPolicy,
    ) -> Result<Vec<Gangs>, GangError> {
        let ParallelismConfig { dp, tp } = config;
        if dp == 0 || tp == 0 {
            return Err(GangError::InvalidTopology {
                root: dp * tp,
                dp,
                tp,
            });
        }

        let root = ThreadGang::cluster(dp * tp, policy);
        // dp gangs group the ranks sharing a tp rank, and vice versa
        let dp_gangs: Vec<Vec<ThreadGang>> =
            (0..tp).map(|_| ThreadGang::cluster(dp, policy)).collect();
        let tp_gangs: Vec<Vec<ThreadGang>> =
            (0..dp).map(|_| ThreadGang::cluster(tp, policy)).collect();

        root.into_iter()
            .enumerate()
            .map(|(rank, root)| {
                let (dp_rank, tp_rank) = (rank / tp, rank % tp);
                Gangs::new(
                    Arc::new(root),
                    Arc::new(dp_gangs[tp_rank][dp_rank].clone()),
                    Arc::new(tp_gangs[dp_rank][tp_rank].clone()),
                )
            })
            .collect()
    }
}
