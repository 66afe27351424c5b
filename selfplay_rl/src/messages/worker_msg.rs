//! Messages exchanged with collector worker threads.
//!
//! # Data Integrity
//!
//! Episode reward averages filter non-finite values (NaN, Inf) so a single
//! corrupted episode cannot poison the running mean.

use crate::core::player::PlayerRef;
use crate::core::transition::TrajectoryChunk;

/// One collection job: who plays and how many episodes to finish.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectJob {
    /// Identifier echoed back in every event of the job
    pub job_id: u64,
    /// Participants, one per policy slot, in policy-id order
    pub players: Vec<PlayerRef>,
    /// Finished episodes after which the job is done
    pub n_episode: usize,
    /// Run active players in value-only pretraining mode
    pub only_update_baseline: bool,
}

impl CollectJob {
    /// Create a job.
    pub fn new(job_id: u64, players: Vec<PlayerRef>, n_episode: usize) -> Self {
        Self {
            job_id,
            players,
            n_episode,
            only_update_baseline: false,
        }
    }

    /// Set value-only pretraining mode.
    pub fn with_only_update_baseline(mut self, only_update_baseline: bool) -> Self {
        self.only_update_baseline = only_update_baseline;
        self
    }
}

/// Commands sent to a collector worker.
#[derive(Debug, Clone)]
pub enum WorkerMsg {
    /// Run a job to completion.
    Collect(CollectJob),

    /// Report statistics on the event channel.
    RequestStats,

    /// Stop the worker gracefully.
    Stop,
}

/// Events emitted by a collector worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent<R, I> {
    /// Trajectory chunks flushed by one tick.
    Chunks {
        job_id: u64,
        chunks: Vec<TrajectoryChunk<R>>,
    },

    /// The job reached its episode target.
    JobFinished {
        job_id: u64,
        /// Final per-episode info, indexed by policy id
        episode_info: Vec<Vec<I>>,
        stats: CollectorStats,
    },

    /// The job was abandoned.
    JobFailed { job_id: u64, reason: String },

    /// Reply to `WorkerMsg::RequestStats`.
    Stats(CollectorStats),
}

/// Statistics reported by a collector.
///
/// Uses numerically stable running averages so long runs neither overflow
/// nor lose precision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorStats {
    /// Collector identifier.
    pub collector_id: usize,

    /// Total environment timesteps processed.
    pub steps: usize,

    /// Episodes kept for training (including those with non-finite rewards).
    pub episodes: usize,

    /// Number of episodes with finite rewards used in the average.
    pub valid_episodes: usize,

    /// Number of episodes with non-finite rewards that were filtered.
    pub filtered_episodes: usize,

    /// Average episode reward of policy 0 over valid episodes.
    pub avg_episode_reward: f32,

    /// Most recent episode reward (may be non-finite for diagnostics).
    pub recent_episode_reward: f32,

    /// Episodes discarded for being shorter than the unroll length.
    pub short_episodes: usize,

    /// Abnormal environment steps.
    pub abnormal_steps: usize,

    /// Caught collection faults.
    pub faults: usize,

    /// Trajectory chunks emitted.
    pub chunks: usize,
}

impl CollectorStats {
    /// Create new collector stats.
    pub fn new(collector_id: usize) -> Self {
        Self {
            collector_id,
            ..Default::default()
        }
    }

    /// Update stats after an episode was kept.
    ///
    /// Welford's incremental mean; non-finite rewards are counted in
    /// `filtered_episodes` but never enter the average.
    pub fn record_episode(&mut self, reward: f32) {
        self.episodes += 1;
        self.recent_episode_reward = reward;

        if !reward.is_finite() {
            self.filtered_episodes += 1;
            return;
        }

        // avg_new = avg_old + (x - avg_old) / n
        self.valid_episodes += 1;
        let delta = reward - self.avg_episode_reward;
        self.avg_episode_reward += delta / self.valid_episodes as f32;
    }

    /// Update step count. Saturating.
    pub fn add_steps(&mut self, n: usize) {
        self.steps = self.steps.saturating_add(n);
    }

    /// Count emitted chunks. Saturating.
    pub fn add_chunks(&mut self, n: usize) {
        self.chunks = self.chunks.saturating_add(n);
    }

    /// Count an episode discarded for being too short.
    pub fn record_short_episode(&mut self) {
        self.short_episodes += 1;
    }

    /// Count an abnormal environment step.
    pub fn record_abnormal(&mut self) {
        self.abnormal_steps += 1;
    }

    /// Count a caught collection fault.
    pub fn record_fault(&mut self) {
        self.faults += 1;
    }

    /// Check if any episodes had non-finite rewards.
    pub fn has_filtered_episodes(&self) -> bool {
        self.filtered_episodes > 0
    }

    /// Fold another collector's stats into this one.
    ///
    /// Averages are combined weighted by valid episode counts.
    pub fn merge(&mut self, other: &CollectorStats) {
        let total_valid = self.valid_episodes + other.valid_episodes;
        if total_valid > 0 {
            let w_self = self.valid_episodes as f32 / total_valid as f32;
            let w_other = other.valid_episodes as f32 / total_valid as f32;
            self.avg_episode_reward =
                self.avg_episode_reward * w_self + other.avg_episode_reward * w_other;
        }
        self.valid_episodes = total_valid;
        self.episodes += other.episodes;
        self.filtered_episodes += other.filtered_episodes;
        self.short_episodes += other.short_episodes;
        self.abnormal_steps += other.abnormal_steps;
        self.faults += other.faults;
        self.add_steps(other.steps);
        self.add_chunks(other.chunks);
        if other.episodes > 0 {
            self.recent_episode_reward = other.recent_episode_reward;
        }
    }
}
