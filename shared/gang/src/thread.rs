use crate::{Device, Gang, GangError, ReduceOp, WaitPolicy};

use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Collective {
    AllReduce(ReduceOp),
    AllGather,
    Broadcast(usize),
    Barrier,
}

impl Collective {
    fn name(&self) -> &'static str {
        match self {
            Collective::AllReduce(_) => "all_reduce",
            Collective::AllGather => "all_gather",
            Collective::Broadcast(_) => "broadcast",
            Collective::Barrier => "barrier",
        }
    }
}

type Outcome = Result<Arc<Vec<Vec<f64>>>, String>;

#[derive(Debug)]
struct Rendezvous {
    generation: u64,
    arrivals: Vec<Option<(Collective, Vec<f64>)>>,
    arrived: usize,
    // outcome of the last completed generation; peers of that generation
    // cannot start the next one without us, so it is never overwritten early
    last: Option<(u64, Outcome)>,
    aborted: bool,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    policy: WaitPolicy,
    state: Mutex<Rendezvous>,
    cond: Condvar,
}

/// A gang whose members are threads of the current process.
///
/// Members meet at a generation-counted rendezvous; the last member to
/// arrive validates that everyone issued the same collective, computes the
/// result and wakes the rest.
#[derive(Debug, Clone)]
pub struct ThreadGang {
    rank: usize,
    device: Device,
    shared: Arc<Shared>,
}

impl ThreadGang {
    /// Creates all `size` members of one gang, indexed by rank.
    pub fn cluster(size: usize, policy: WaitPolicy) -> Vec<ThreadGang> {
        let size = size.max(1);
        let shared = Arc::new(Shared {
            size,
            policy,
            state: Mutex::new(Rendezvous {
                generation: 0,
                arrivals: vec![None; size],
                arrived: 0,
                last: None,
                aborted: false,
            }),
            cond: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadGang {
                rank,
                device: Device::Cpu,
                shared: shared.clone(),
            })
            .collect()
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().map(|state| state.aborted).unwrap_or(true)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Rendezvous>, GangError> {
        self.shared.state.lock().map_err(|_| GangError::Poisoned)
    }

    fn rendezvous(
        &self,
        collective: Collective,
        payload: Vec<f64>,
    ) -> Result<Arc<Vec<Vec<f64>>>, GangError> {
        let mut state = self.lock()?;
        if state.aborted {
            return Err(GangError::Aborted);
        }

        let generation = state.generation;
        state.arrivals[self.rank] = Some((collective, payload));
        state.arrived += 1;
        trace!(
            rank = self.rank,
            generation,
            op = collective.name(),
            "arrived at collective"
        );

        if state.arrived == self.shared.size {
            let outcome = Self::complete(&mut state.arrivals);
            if outcome.is_err() {
                state.aborted = true;
            }
            state.last = Some((generation, outcome.clone()));
            state.arrived = 0;
            state.generation += 1;
            self.shared.cond.notify_all();
            return outcome.map_err(|reason| GangError::Mismatch {
                rank: self.rank,
                reason,
            });
        }

        let started = Instant::now();
        loop {
            state = match self.shared.policy.timeout {
                None => self
                    .shared
                    .cond
                    .wait(state)
                    .map_err(|_| GangError::Poisoned)?,
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining == Duration::ZERO {
                        state.aborted = true;
                        self.shared.cond.notify_all();
                        let waited = started.elapsed();
                        warn!(
                            rank = self.rank,
                            op = collective.name(),
                            "collective timed out after {waited:?}, aborting gang"
                        );
                        return Err(GangError::Timeout {
                            op: collective.name(),
                            rank: self.rank,
                            waited,
                        });
                    }
                    self.shared
                        .cond
                        .wait_timeout(state, remaining)
                        .map_err(|_| GangError::Poisoned)?
                        .0
                }
            };

            if state.generation != generation {
                return match &state.last {
                    Some((done, outcome)) if *done == generation => {
                        outcome.clone().map_err(|reason| GangError::Mismatch {
                            rank: self.rank,
                            reason,
                        })
                    }
                    _ => Err(GangError::Aborted),
                };
            }
            if state.aborted {
                return Err(GangError::Aborted);
            }
        }
    }

    fn complete(arrivals: &mut [Option<(Collective, Vec<f64>)>]) -> Outcome {
        let taken: Vec<(Collective, Vec<f64>)> =
            arrivals.iter_mut().filter_map(Option::take).collect();
        let Some((first, first_payload)) = taken.first() else {
            return Err("no arrivals".to_string());
        };
        for (rank, (collective, payload)) in taken.iter().enumerate() {
            if collective != first {
                return Err(format!(
                    "rank 0 issued {first:?} but rank {rank} issued {collective:?}"
                ));
            }
            if matches!(first, Collective::AllReduce(_)) && payload.len() != first_payload.len()
            {
                return Err(format!(
                    "rank 0 reduced {} values but rank {rank} reduced {}",
                    first_payload.len(),
                    payload.len()
                ));
            }
        }
        Ok(Arc::new(taken.into_iter().map(|(_, p)| p).collect()))
    }
}

impl Gang for ThreadGang {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn device(&self) -> Device {
        self.device
    }

    fn all_reduce(&self, values: &mut [f64], op: ReduceOp) -> Result<(), GangError> {
        if self.shared.size == 1 {
            return Ok(());
        }
        let contributions = self.rendezvous(Collective::AllReduce(op), values.to_vec())?;
        op.combine(values, &contributions);
        Ok(())
    }

    fn all_gather(&self, value: f64) -> Result<Vec<f64>, GangError> {
        let contributions = self.rendezvous(Collective::AllGather, vec![value])?;
        Ok(contributions.iter().map(|c| c[0]).collect())
    }

    fn broadcast(&self, values: &mut Vec<f64>, source_rank: usize) -> Result<(), GangError> {
        if source_rank >= self.shared.size {
            return Err(GangError::InvalidRank {
                rank: source_rank,
                size: self.shared.size,
            });
        }
        let payload = if self.rank == source_rank {
            values.clone()
        } else {
            Vec::new()
        };
        let contributions = self.rendezvous(Collective::Broadcast(source_rank), payload)?;
        values.clone_from(&contributions[source_rank]);
        Ok(())
    }

    fn barrier(&self) -> Result<(), GangError> {
        self.rendezvous(Collective::Barrier, Vec::new())?;
        Ok(())
    }

    fn abort(&self) {
        // a poisoned lock means the gang is already unusable
        if let Ok(mut state) = self.lock() {
            if !state.aborted {
                warn!(rank = self.rank, "aborting gang");
                state.aborted = true;
            }
        }
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_on_cluster<T, F>(size: usize, policy: WaitPolicy, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(ThreadGang) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = ThreadGang::cluster(size, policy)
            .into_iter()
            .map(|gang| {
                let f = f.clone();
                thread::spawn(move || f(gang))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    }

    #[test]
    fn all_reduce_sums_across_members() {
        let results = run_on_cluster(4, WaitPolicy::default(), |gang| {
            let mut values = [gang.rank() as f64, 1.0];
            gang.all_reduce(&mut values, ReduceOp::Sum).unwrap();
            values
        });
        for values in results {
            assert_eq!(values, [6.0, 4.0]);
        }
    }

    #[test]
    fn repeated_collectives_stay_in_step() {
        let results = run_on_cluster(3, WaitPolicy::default(), |gang| {
            let mut total = 0.0;
            for step in 0..50 {
                let mut values = [(gang.rank() + step) as f64];
                gang.all_reduce(&mut values, ReduceOp::Max).unwrap();
                total += values[0];
                gang.barrier().unwrap();
            }
            total
        });
        let expected: f64 = (0..50).map(|step| (step + 2) as f64).sum();
        assert!(results.iter().all(|t| *t == expected));
    }

    #[test]
    fn broadcast_and_gather() {
        let results = run_on_cluster(3, WaitPolicy::default(), |gang| {
            let mut values = if gang.rank() == 2 {
                vec![7.0, 8.0, 9.0]
            } else {
                vec![]
            };
            gang.broadcast(&mut values, 2).unwrap();
            let gathered = gang.all_gather(gang.rank() as f64 * 10.0).unwrap();
            (values, gathered)
        });
        for (values, gathered) in results {
            assert_eq!(values, vec![7.0, 8.0, 9.0]);
            assert_eq!(gathered, vec![0.0, 10.0, 20.0]);
        }
    }

    #[test]
    fn mismatched_collectives_are_fatal() {
        let results = run_on_cluster(2, WaitPolicy::default(), |gang| {
            if gang.rank() == 0 {
                gang.barrier()
            } else {
                let mut values = [1.0];
                gang.all_reduce(&mut values, ReduceOp::Sum)
            }
        });
        for result in results {
            assert!(matches!(result, Err(GangError::Mismatch { .. })));
        }
    }

    #[test]
    fn missing_peer_times_out_and_aborts_gang() {
        let mut members = ThreadGang::cluster(2, WaitPolicy::bounded(Duration::from_millis(50)));
        let absent = members.pop().unwrap();
        let present = members.pop().unwrap();

        let err = present.barrier().unwrap_err();
        assert!(matches!(err, GangError::Timeout { op: "barrier", rank: 0, .. }));
        assert!(present.is_aborted());

        // the straggler finally shows up, but the gang is gone
        assert_eq!(absent.barrier().unwrap_err(), GangError::Aborted);
    }

    #[test]
    fn abort_wakes_a_member_blocked_without_timeout() {
        let mut members = ThreadGang::cluster(2, WaitPolicy::unbounded());
        let failing = members.pop().unwrap();
        let waiting = members.pop().unwrap();

        let handle = thread::spawn(move || waiting.barrier());
        thread::sleep(Duration::from_millis(20));
        failing.abort();

        assert_eq!(handle.join().unwrap().unwrap_err(), GangError::Aborted);
        assert!(failing.is_aborted());
        assert_eq!(failing.barrier().unwrap_err(), GangError::Aborted);
    }

    #[test]
    fn size_one_cluster_needs_no_peers() {
        let gang = ThreadGang::cluster(1, WaitPolicy::bounded(Duration::from_millis(1)))
            .pop()
            .unwrap();
        let mut values = [3.0];
        gang.all_reduce(&mut values, ReduceOp::Sum).unwrap();
        assert_eq!(values, [3.0]);
        gang.barrier().unwrap();
    }
}
