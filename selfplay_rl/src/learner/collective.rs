//! Collective communication between learner replicas.
//!
//! Every replica of one player's learner holds a `Collective` handle with a
//! distinct rank. Operations are blocking rendezvous: each rank must issue
//! the same sequence of operations with the same buffer lengths.
//!
//! ```text
//! rank 0 ──all_reduce_sum──┐
//! rank 1 ──all_reduce_sum──┼──> sum written back to every rank
//! rank 2 ──all_reduce_sum──┘
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by collective operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectiveError {
    /// Ranks issued different operations in the same round.
    #[error("rank {rank} issued {found} while the group is running {expected}")]
    Mismatch {
        rank: usize,
        expected: String,
        found: String,
    },
    /// Broadcast root outside the group.
    #[error("broadcast root {root} outside a group of {world_size}")]
    InvalidRoot { root: usize, world_size: usize },
    /// Another rank failed and the group can no longer make progress.
    #[error("collective group is poisoned: {0}")]
    Poisoned(String),
}

/// Blocking collective operations over `f32` buffers.
pub trait Collective: Send {
    /// Rank of this replica, in `0..world_size()`.
    fn rank(&self) -> usize;

    /// Number of replicas in the group.
    fn world_size(&self) -> usize;

    /// Replace `data` on every rank with the element-wise sum across ranks.
    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), CollectiveError>;

    /// Overwrite `data` on every rank with the contents held by `root`.
    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<(), CollectiveError>;

    /// Wait until every rank reaches this point.
    fn barrier(&self) -> Result<(), CollectiveError>;
}

/// Group of one. Every operation is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloCollective;

impl Collective for SoloCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _data: &mut [f32]) -> Result<(), CollectiveError> {
        Ok(())
    }

    fn broadcast(&self, _data: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        if root != 0 {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: 1,
            });
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Sum,
    Broadcast { root: usize },
    Barrier,
}

/// What every rank must agree on for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpSignature {
    kind: OpKind,
    len: usize,
}

impl std::fmt::Display for OpSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            OpKind::Sum => write!(f, "all_reduce_sum[{}]", self.len),
            OpKind::Broadcast { root } => write!(f, "broadcast[{}] from {}", self.len, root),
            OpKind::Barrier => write!(f, "barrier"),
        }
    }
}

struct Round {
    /// Bumped every time a round completes
    generation: u64,
    arrived: usize,
    current: Option<OpSignature>,
    buffer: Vec<f32>,
    /// Output of the last completed round
    result: Arc<Vec<f32>>,
    poisoned: Option<String>,
}

struct Group {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

/// In-process collective for replicas running on threads of one process.
///
/// Built with [`local_group`]; one handle per rank.
pub struct LocalCollective {
    rank: usize,
    group: Arc<Group>,
}

/// Create `world_size` connected handles, ranks `0..world_size`.
pub fn local_group(world_size: usize) -> Vec<LocalCollective> {
    let group = Arc::new(Group {
        world_size: world_size.max(1),
        round: Mutex::new(Round {
            generation: 0,
            arrived: 0,
            current: None,
            buffer: Vec::new(),
            result: Arc::new(Vec::new()),
            poisoned: None,
        }),
        done: Condvar::new(),
    });
    (0..group.world_size)
        .map(|rank| LocalCollective {
            rank,
            group: Arc::clone(&group),
        })
        .collect()
}

impl LocalCollective {
    fn rendezvous(&self, kind: OpKind, data: &mut [f32]) -> Result<(), CollectiveError> {
        let signature = OpSignature {
            kind,
            len: data.len(),
        };
        let group = &*self.group;
        let mut round = group.round.lock();
        if let Some(reason) = &round.poisoned {
            return Err(CollectiveError::Poisoned(reason.clone()));
        }

        match round.current {
            None => {
                round.current = Some(signature);
                round.buffer.clear();
                if kind == OpKind::Sum {
                    round.buffer.resize(data.len(), 0.0);
                }
            }
            Some(expected) if expected != signature => {
                let err = CollectiveError::Mismatch {
                    rank: self.rank,
                    expected: expected.to_string(),
                    found: signature.to_string(),
                };
                round.poisoned = Some(err.to_string());
                group.done.notify_all();
                return Err(err);
            }
            Some(_) => {}
        }

        match kind {
            OpKind::Sum => {
                for (acc, value) in round.buffer.iter_mut().zip(data.iter()) {
                    *acc += *value;
                }
            }
            OpKind::Broadcast { root } if root == self.rank => {
                round.buffer.clear();
                round.buffer.extend_from_slice(data);
            }
            OpKind::Broadcast { .. } | OpKind::Barrier => {}
        }

        round.arrived += 1;
        let generation = round.generation;
        if round.arrived == group.world_size {
            round.result = Arc::new(std::mem::take(&mut round.buffer));
            round.arrived = 0;
            round.current = None;
            round.generation += 1;
            group.done.notify_all();
        } else {
            while round.generation == generation && round.poisoned.is_none() {
                group.done.wait(&mut round);
            }
            if round.generation == generation {
                let reason = round.poisoned.clone().unwrap_or_default();
                return Err(CollectiveError::Poisoned(reason));
            }
        }

        // The next round cannot complete before this rank arrives, so the
        // result stays valid until it is copied out.
        let result = Arc::clone(&round.result);
        drop(round);
        if kind != OpKind::Barrier {
            data.copy_from_slice(&result);
        }
        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, data: &mut [f32]) -> Result<(), CollectiveError> {
        if self.group.world_size == 1 {
            return Ok(());
        }
        self.rendezvous(OpKind::Sum, data)
    }

    fn broadcast(&self, data: &mut [f32], root: usize) -> Result<(), CollectiveError> {
        if root >= self.group.world_size {
            return Err(CollectiveError::InvalidRoot {
                root,
                world_size: self.group.world_size,
            });
        }
        if self.group.world_size == 1 {
            return Ok(());
        }
        self.rendezvous(OpKind::Broadcast { root }, data)
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        if self.group.world_size == 1 {
            return Ok(());
        }
        self.rendezvous(OpKind::Barrier, &mut [])
    }
}

impl std::fmt::Debug for LocalCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.group.world_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalCollective) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = local_group(world_size)
            .into_iter()
            .map(|collective| {
                let f = Arc::clone(&f);
                thread::spawn(move || f(collective))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_solo_is_noop() {
        let solo = SoloCollective;
        let mut data = [1.0, 2.0];
        solo.all_reduce_sum(&mut data).unwrap();
        solo.broadcast(&mut data, 0).unwrap();
        solo.barrier().unwrap();
        assert_eq!(data, [1.0, 2.0]);
        assert_eq!(solo.world_size(), 1);
        assert!(matches!(
            solo.broadcast(&mut data, 1),
            Err(CollectiveError::InvalidRoot { root: 1, .. })
        ));
    }

    #[test]
    fn test_local_group_ranks() {
        let group = local_group(3);
        let ranks: Vec<_> = group.iter().map(|c| c.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(group.iter().all(|c| c.world_size() == 3));
    }

    #[test]
    fn test_all_reduce_sum() {
        let results = run_group(4, |c| {
            let rank = c.rank() as f32;
            let mut data = vec![rank, 10.0 * rank, 1.0];
            c.all_reduce_sum(&mut data).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![6.0, 60.0, 4.0]);
        }
    }

    #[test]
    fn test_all_reduce_random_buffers() {
        fn buffer(rank: usize) -> Vec<f32> {
            let mut rng = fastrand::Rng::with_seed(rank as u64);
            // Integers keep the sum exact in any arrival order
            (0..257).map(|_| rng.i32(-1000..1000) as f32).collect()
        }

        let world_size = 5;
        let mut expected = vec![0.0f32; 257];
        for rank in 0..world_size {
            for (acc, value) in expected.iter_mut().zip(buffer(rank)) {
                *acc += value;
            }
        }

        let results = run_group(world_size, |c| {
            let mut data = buffer(c.rank());
            c.all_reduce_sum(&mut data).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, expected);
        }
    }

    #[test]
    fn test_broadcast_from_nonzero_root() {
        let results = run_group(3, |c| {
            let mut data = vec![c.rank() as f32; 2];
            c.broadcast(&mut data, 2).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![2.0, 2.0]);
        }
    }

    #[test]
    fn test_many_rounds_stay_ordered() {
        let results = run_group(3, |c| {
            let mut sums = Vec::new();
            for round in 0..50 {
                let mut data = vec![(c.rank() + round) as f32];
                c.all_reduce_sum(&mut data).unwrap();
                c.barrier().unwrap();
                sums.push(data[0]);
            }
            sums
        });
        let expected: Vec<f32> = (0..50).map(|round| (3 * round + 3) as f32).collect();
        for sums in results {
            assert_eq!(sums, expected);
        }
    }

    #[test]
    fn test_mismatched_lengths_poison_group() {
        let results = run_group(2, |c| {
            let mut data = vec![1.0; 1 + c.rank()];
            c.all_reduce_sum(&mut data)
        });
        assert!(results.iter().any(|r| matches!(r, Err(CollectiveError::Mismatch { .. }))));
        assert!(results.iter().all(|r| r.is_err()));
    }

    #[test]
    fn test_invalid_root() {
        let group = local_group(2);
        let mut data = [0.0];
        assert!(matches!(
            group[0].broadcast(&mut data, 5),
            Err(CollectiveError::InvalidRoot {
                root: 5,
                world_size: 2
            })
        ));
    }

    #[test]
    fn test_group_of_one_needs_no_peers() {
        let group = local_group(1);
        let mut data = [3.0];
        group[0].all_reduce_sum(&mut data).unwrap();
        group[0].barrier().unwrap();
        assert_eq!(data, [3.0]);
    }
}
