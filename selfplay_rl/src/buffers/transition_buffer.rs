//! Per-policy transition accumulation with episode rollback.
//!
//! Key characteristics:
//! - One buffer per policy slot, one episode list per environment
//! - Eager chunking: every `unroll_len` transitions of an episode form a chunk,
//!   a finished episode's remainder forms a shorter terminal chunk
//! - The newest episode of an environment can be dropped at any time, which is
//!   how abnormal steps and too-short episodes are rolled back
//! - Strict per-environment ordering, no ordering across environments

use crate::core::transition::{TrajectoryChunk, Transition};
use std::collections::VecDeque;

#[derive(Debug)]
struct Episode<R> {
    /// Transitions not yet flushed
    pending: Vec<Transition<R>>,
    /// Transitions appended over the episode's lifetime, flushed or not
    total_len: usize,
    /// Episode reached its natural end
    finished: bool,
}

impl<R> Episode<R> {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::with_capacity(capacity),
            total_len: 0,
            finished: false,
        }
    }
}

/// Accumulates one policy's transitions across `env_num` environments.
#[derive(Debug)]
pub struct TransitionBuffer<R> {
    policy_id: usize,
    unroll_len: usize,
    episodes: Vec<VecDeque<Episode<R>>>,
}

impl<R> TransitionBuffer<R> {
    /// Create an empty buffer.
    ///
    /// # Panics
    /// Panics if `unroll_len` is zero.
    pub fn new(policy_id: usize, env_num: usize, unroll_len: usize) -> Self {
        assert!(unroll_len > 0, "unroll_len must be > 0");
        Self {
            policy_id,
            unroll_len,
            episodes: (0..env_num).map(|_| VecDeque::new()).collect(),
        }
    }

    /// Policy slot this buffer belongs to.
    pub fn policy_id(&self) -> usize {
        self.policy_id
    }

    /// Target chunk length.
    pub fn unroll_len(&self) -> usize {
        self.unroll_len
    }

    /// Number of environments tracked.
    pub fn env_num(&self) -> usize {
        self.episodes.len()
    }

    /// Append one transition for `env_id`.
    ///
    /// Opens a new episode when the newest one is finished. Returns `false`
    /// when this transition ends an episode that is shorter than
    /// `unroll_len`; the caller is expected to roll that episode back.
    ///
    /// # Panics
    /// Panics if `env_id >= env_num`.
    pub fn append(&mut self, env_id: usize, transition: Transition<R>) -> bool {
        let unroll_len = self.unroll_len;
        let episodes = &mut self.episodes[env_id];

        if episodes.back().map_or(true, |ep| ep.finished) {
            episodes.push_back(Episode::new(unroll_len));
        }
        let Some(episode) = episodes.back_mut() else {
            return true;
        };

        let done = transition.done;
        episode.pending.push(transition);
        episode.total_len += 1;

        if done {
            episode.finished = true;
            return episode.total_len >= unroll_len;
        }
        true
    }

    /// End the open episode of `env_id` without a new transition.
    ///
    /// For a policy that had no component in the final timestep. The last
    /// buffered transition is marked `done`; if everything was flushed
    /// already, no terminal chunk follows. Returns `None` when `env_id` has
    /// no open episode, otherwise whether the episode reached `unroll_len`.
    pub fn finish_episode(&mut self, env_id: usize) -> Option<bool> {
        let episode = self.episodes.get_mut(env_id)?.back_mut()?;
        if episode.finished {
            return None;
        }
        episode.finished = true;
        if let Some(last) = episode.pending.last_mut() {
            last.done = true;
        }
        Some(episode.total_len >= self.unroll_len)
    }

    /// Drop the newest episode of `env_id`.
    ///
    /// With `before_append`, a newest episode that already finished is kept:
    /// the fault happened before the next episode received its first
    /// transition, so the finished one is intact. Returns the number of
    /// buffered transitions dropped; a no-op on empty state.
    pub fn clear_newest_episode(&mut self, env_id: usize, before_append: bool) -> usize {
        let Some(episodes) = self.episodes.get_mut(env_id) else {
            return 0;
        };
        if before_append && episodes.back().is_some_and(|ep| ep.finished) {
            return 0;
        }
        episodes.pop_back().map_or(0, |ep| ep.pending.len())
    }

    /// Flush ready chunks.
    ///
    /// Finished episodes are emitted whole and removed. Unfinished episodes
    /// give up their complete chunks unless `only_finished` is set, in which
    /// case they stay untouched.
    pub fn to_trajectories(&mut self, only_finished: bool) -> Vec<TrajectoryChunk<R>> {
        let unroll_len = self.unroll_len;
        let policy_id = self.policy_id;
        let mut chunks = Vec::new();

        for (env_id, episodes) in self.episodes.iter_mut().enumerate() {
            let mut kept = VecDeque::with_capacity(episodes.len());

            for mut episode in episodes.drain(..) {
                if episode.finished {
                    let pending = std::mem::take(&mut episode.pending);
                    split_into_chunks(pending, unroll_len, true, |transitions, terminal| {
                        chunks.push(TrajectoryChunk {
                            env_id,
                            policy_id,
                            transitions,
                            terminal,
                        });
                    });
                    continue;
                }

                if !only_finished {
                    let full = episode.pending.len() / unroll_len * unroll_len;
                    if full > 0 {
                        let rest = episode.pending.split_off(full);
                        let ready = std::mem::replace(&mut episode.pending, rest);
                        split_into_chunks(ready, unroll_len, false, |transitions, terminal| {
                            chunks.push(TrajectoryChunk {
                                env_id,
                                policy_id,
                                transitions,
                                terminal,
                            });
                        });
                    }
                }
                kept.push_back(episode);
            }

            *episodes = kept;
        }

        chunks
    }

    /// Drop all buffered state.
    pub fn clear(&mut self) {
        for episodes in &mut self.episodes {
            episodes.clear();
        }
    }

    /// Buffered (unflushed) transitions for one environment.
    pub fn buffered_len(&self, env_id: usize) -> usize {
        self.episodes
            .get(env_id)
            .map_or(0, |eps| eps.iter().map(|ep| ep.pending.len()).sum())
    }

    /// Episodes held for one environment, finished or not.
    pub fn episode_count(&self, env_id: usize) -> usize {
        self.episodes.get(env_id).map_or(0, VecDeque::len)
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.episodes.iter().all(VecDeque::is_empty)
    }
}

/// Split `transitions` into `unroll_len` pieces in order. When `closes_episode`
/// the last piece is flagged terminal.
fn split_into_chunks<R>(
    transitions: Vec<Transition<R>>,
    unroll_len: usize,
    closes_episode: bool,
    mut emit: impl FnMut(Vec<Transition<R>>, bool),
) {
    let mut remaining = transitions.len();
    let mut iter = transitions.into_iter();
    while remaining > 0 {
        let take = remaining.min(unroll_len);
        let chunk: Vec<_> = iter.by_ref().take(take).collect();
        remaining -= take;
        emit(chunk, closes_episode && remaining == 0);
    }
}
