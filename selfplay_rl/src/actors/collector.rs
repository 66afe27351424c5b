//! Rollout collection loop.
//!
//! One `RolloutCollector` drives a `BattleEnv` with one policy slot per
//! participant and turns environment steps into trajectory chunks. Each call
//! to [`RolloutCollector::step`] runs ticks until either `unroll_len`
//! environment steps have been taken or the job's episode target is reached,
//! then flushes the transition buffers into the context.
//!
//! Faults raised while collecting (inference, stepping, malformed timesteps,
//! unknown environment ids) never escape a tick: the environment set is
//! closed, every environment's in-flight episode is dropped, and the next
//! tick relaunches.

use crate::actors::freshness::{FreshnessError, ModelFreshnessTracker};
use crate::actors::policy::{Policy, PolicyError, PolicySlot};
use crate::buffers::TransitionBuffer;
use crate::config::{CollectorConfig, ConfigError, FreshnessConfig};
use crate::core::model_store::ModelSource;
use crate::core::player::PlayerRef;
use crate::core::transition::{TrajectoryChunk, Transition};
use crate::environment::{BattleEnv, EnvError, EnvMap, StepOutcome, Timestep};
use crate::messages::CollectorStats;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the collection loop.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Environment failure.
    #[error(transparent)]
    Env(#[from] EnvError),
    /// Policy failure.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Model refresh failure.
    #[error(transparent)]
    Freshness(#[from] FreshnessError),
    /// The environment set reported an id outside `0..env_num`.
    #[error("env id {env_id} outside a set of {env_num} environments")]
    UnknownEnv { env_id: usize, env_num: usize },
    /// An environment reported an observation for a policy id with no slot.
    #[error("env {env_id} has an observation for unknown policy {policy_id}")]
    UnknownPolicy { env_id: usize, policy_id: usize },
    /// Players, policy slots and transition buffers disagree.
    #[error("{players} players, {slots} policy slots, {buffers} buffers")]
    SlotMismatch {
        players: usize,
        slots: usize,
        buffers: usize,
    },
}

/// Mutable state of one collection job, carried across `step` calls.
pub struct CollectContext<P: Policy> {
    /// Participants, `players[i]` controls `policies[i]`
    pub players: Vec<PlayerRef>,
    /// Policy slots indexed by policy id
    pub policies: Vec<PolicySlot<P>>,
    /// Finished episodes after which the job is done
    pub n_episode: usize,
    /// Finished (kept) episodes so far
    pub env_episode: usize,
    /// Environment timesteps processed in this job
    pub env_step: usize,
    /// Timesteps processed by the collector over its lifetime
    pub total_envstep_count: usize,
    /// Final info of each kept episode, indexed by policy id
    pub episode_info: Vec<Vec<P::Info>>,
    /// Chunks flushed so far, drained by the caller
    pub trajectories: Vec<TrajectoryChunk<P::Record>>,
    /// Episode target reached
    pub job_finished: bool,
    /// Running statistics
    pub stats: CollectorStats,
}

impl<P: Policy> CollectContext<P> {
    /// Create the context for a new job.
    pub fn new(players: Vec<PlayerRef>, policies: Vec<PolicySlot<P>>, n_episode: usize) -> Self {
        let n_policies = policies.len();
        Self {
            players,
            policies,
            n_episode,
            env_episode: 0,
            env_step: 0,
            total_envstep_count: 0,
            episode_info: (0..n_policies).map(|_| Vec::new()).collect(),
            trajectories: Vec::new(),
            job_finished: false,
            stats: CollectorStats::default(),
        }
    }

    /// Take the chunks flushed so far.
    pub fn take_trajectories(&mut self) -> Vec<TrajectoryChunk<P::Record>> {
        std::mem::take(&mut self.trajectories)
    }

    /// Whether the episode target has been reached.
    pub fn target_reached(&self) -> bool {
        self.env_episode >= self.n_episode
    }
}

/// Drives one environment set for one collector.
pub struct RolloutCollector<E, P>
where
    P: Policy,
{
    config: CollectorConfig,
    env: E,
    tracker: ModelFreshnessTracker<P::Weights>,
    source: Arc<dyn ModelSource<P::Weights> + Send + Sync>,
    buffers: Vec<TransitionBuffer<P::Record>>,
    /// Running return per policy per environment
    episode_returns: Vec<Vec<f32>>,
    total_envstep_count: usize,
}

impl<E, P> RolloutCollector<E, P>
where
    E: BattleEnv<Obs = P::Obs, Action = P::Action, Info = P::Info>,
    P: Policy,
    P::Obs: Clone,
    P::Info: Clone,
{
    /// Create a collector for jobs with `agent_num` participants.
    pub fn new(
        config: CollectorConfig,
        freshness: FreshnessConfig,
        env: E,
        agent_num: usize,
        source: Arc<dyn ModelSource<P::Weights> + Send + Sync>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let env_num = env.env_num();
        let tracker = ModelFreshnessTracker::new(freshness)?.with_collector_id(config.collector_id);
        Ok(Self {
            buffers: (0..agent_num)
                .map(|policy_id| TransitionBuffer::new(policy_id, env_num, config.unroll_len))
                .collect(),
            episode_returns: vec![vec![0.0; env_num]; agent_num],
            config,
            env,
            tracker,
            source,
            total_envstep_count: 0,
        })
    }

    /// Replace the freshness tracker (e.g. to inject a clock).
    pub fn with_tracker(mut self, tracker: ModelFreshnessTracker<P::Weights>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Run ticks until `unroll_len` steps were taken or the job finished.
    ///
    /// Only freshness failures, environment launch failures and a malformed
    /// context propagate; everything else is handled inside the tick.
    pub fn step(&mut self, ctx: &mut CollectContext<P>) -> Result<(), CollectError> {
        if ctx.players.len() != ctx.policies.len() || ctx.policies.len() != self.buffers.len() {
            return Err(CollectError::SlotMismatch {
                players: ctx.players.len(),
                slots: ctx.policies.len(),
                buffers: self.buffers.len(),
            });
        }
        ctx.stats.collector_id = self.config.collector_id;
        ctx.total_envstep_count = self.total_envstep_count;
        let start = ctx.env_step;

        loop {
            if self.env.closed() {
                self.env.launch()?;
                self.reset_all(ctx);
            }
            self.tracker
                .refresh(&ctx.players, &mut ctx.policies, &*self.source)?;

            if let Err(err) = self.collect_once(ctx) {
                log::error!(
                    "[collector {}] got an error when collecting data: {}",
                    self.config.collector_id,
                    err
                );
                ctx.stats.record_fault();
                self.env.close();
                self.drop_in_flight();
            }

            self.total_envstep_count = ctx.total_envstep_count;

            let finished = ctx.target_reached();
            let unroll_reached =
                self.config.unroll_len > 0 && ctx.env_step - start >= self.config.unroll_len;
            if unroll_reached || finished {
                for buffer in &mut self.buffers {
                    let chunks = buffer.to_trajectories(finished);
                    ctx.stats.add_chunks(chunks.len());
                    ctx.trajectories.extend(chunks);
                }
                if finished {
                    self.env.close();
                    ctx.job_finished = true;
                    for buffer in &mut self.buffers {
                        buffer.clear();
                    }
                    log::info!(
                        "[collector {}] job finished after {} episodes, {} steps",
                        self.config.collector_id,
                        ctx.env_episode,
                        ctx.env_step
                    );
                }
                return Ok(());
            }
        }
    }

    /// Inference plus one environment step plus bookkeeping.
    fn collect_once(&mut self, ctx: &mut CollectContext<P>) -> Result<(), CollectError> {
        let env_num = self.env.env_num();
        let ready = self.env.ready_obs();
        check_env_ids(ready.keys(), env_num)?;
        let mut actions: EnvMap<P::Action> = BTreeMap::new();
        for (&env_id, observations) in &ready {
            let env_actions = actions.entry(env_id).or_default();
            for (&policy_id, obs) in observations {
                let slot = ctx
                    .policies
                    .get_mut(policy_id)
                    .ok_or(CollectError::UnknownPolicy { env_id, policy_id })?;
                env_actions.insert(policy_id, slot.policy.forward(env_id, obs)?);
            }
        }

        let timesteps = self.env.step(actions)?;
        ctx.total_envstep_count += timesteps.len();
        ctx.env_step += timesteps.len();
        ctx.stats.add_steps(timesteps.len());
        check_env_ids(timesteps.keys(), env_num)?;

        for (env_id, outcome) in timesteps {
            match outcome {
                StepOutcome::Abnormal { reason } => self.handle_abnormal(ctx, env_id, &reason),
                StepOutcome::Normal(timestep) => self.handle_timestep(ctx, env_id, timestep)?,
            }
        }
        Ok(())
    }

    fn handle_abnormal(&mut self, ctx: &mut CollectContext<P>, env_id: usize, reason: &str) {
        log::warn!(
            "[collector {}] env {} stepped abnormally ({}), dropping its episode",
            self.config.collector_id,
            env_id,
            reason
        );
        ctx.stats.record_abnormal();
        for buffer in &mut self.buffers {
            buffer.clear_newest_episode(env_id, true);
        }
        self.reset_env(ctx, env_id);
        self.clear_returns(env_id);
    }

    fn handle_timestep(
        &mut self,
        ctx: &mut CollectContext<P>,
        env_id: usize,
        timestep: Timestep<P::Obs, P::Info>,
    ) -> Result<(), CollectError> {
        // Slice every component first so a malformed timestep leaves all
        // buffers untouched
        let mut parts = Vec::with_capacity(ctx.policies.len());
        for policy_id in 0..ctx.policies.len() {
            if let Some(part) = timestep.for_policy(env_id, policy_id)? {
                parts.push((policy_id, part));
            }
        }

        // Policies holding an episode that this timestep extends or ends
        let mut in_episode = vec![false; ctx.policies.len()];
        let mut episode_long_enough = true;
        for (policy_id, policy_timestep) in parts {
            let slot = &mut ctx.policies[policy_id];
            let reward = policy_timestep.reward;
            let done = policy_timestep.done;
            let collect_train_iter = self.tracker.collect_train_iter(&slot.player.id);
            let record = slot.policy.process_transition(env_id, policy_timestep);

            if let Some(ret) = self
                .episode_returns
                .get_mut(policy_id)
                .and_then(|returns| returns.get_mut(env_id))
            {
                *ret += reward;
            }

            let appended = self.buffers[policy_id].append(
                env_id,
                Transition::new(record, reward, done, collect_train_iter),
            );
            in_episode[policy_id] = true;
            episode_long_enough = episode_long_enough && appended;
        }

        let mut info_pushed = vec![false; ctx.policies.len()];
        if timestep.done {
            // Policies without a component still end their episode here
            for (policy_id, buffer) in self.buffers.iter_mut().enumerate() {
                if in_episode[policy_id] {
                    continue;
                }
                if let Some(long_enough) = buffer.finish_episode(env_id) {
                    in_episode[policy_id] = true;
                    episode_long_enough = episode_long_enough && long_enough;
                }
            }
            self.reset_env(ctx, env_id);
            for (policy_id, pushed) in info_pushed.iter_mut().enumerate() {
                if let Some(info) = timestep.info.get(&policy_id) {
                    ctx.episode_info[policy_id].push(info.clone());
                    *pushed = true;
                }
            }
        }

        if !episode_long_enough {
            for (buffer, &held) in self.buffers.iter_mut().zip(&in_episode) {
                if held {
                    buffer.clear_newest_episode(env_id, false);
                }
            }
            for (policy_id, pushed) in info_pushed.into_iter().enumerate() {
                if pushed {
                    ctx.episode_info[policy_id].pop();
                }
            }
            ctx.stats.record_short_episode();
            log::debug!(
                "[collector {}] env {} episode shorter than {}, discarded",
                self.config.collector_id,
                env_id,
                self.config.unroll_len
            );
        } else if timestep.done {
            ctx.env_episode += 1;
            let focal_return = self
                .episode_returns
                .first()
                .and_then(|returns| returns.get(env_id))
                .copied()
                .unwrap_or(0.0);
            ctx.stats.record_episode(focal_return);
        }

        if timestep.done {
            self.clear_returns(env_id);
        }
        Ok(())
    }

    /// Reset every policy for every environment after a launch.
    fn reset_all(&mut self, ctx: &mut CollectContext<P>) {
        let ready = self.env.ready_obs();
        for env_id in 0..self.env.env_num() {
            let observations = ready.get(&env_id);
            for (policy_id, slot) in ctx.policies.iter_mut().enumerate() {
                slot.policy
                    .reset(env_id, observations.and_then(|obs| obs.get(&policy_id)));
            }
            self.clear_returns(env_id);
        }
    }

    /// Reset every policy for one environment at an episode boundary.
    fn reset_env(&mut self, ctx: &mut CollectContext<P>, env_id: usize) {
        let ready = self.env.ready_obs();
        let observations = ready.get(&env_id);
        for (policy_id, slot) in ctx.policies.iter_mut().enumerate() {
            slot.policy
                .reset(env_id, observations.and_then(|obs| obs.get(&policy_id)));
        }
    }

    fn clear_returns(&mut self, env_id: usize) {
        for returns in &mut self.episode_returns {
            if let Some(ret) = returns.get_mut(env_id) {
                *ret = 0.0;
            }
        }
    }

    /// Drop every environment's in-flight episode after a fault.
    fn drop_in_flight(&mut self) {
        for env_id in 0..self.env.env_num() {
            for buffer in &mut self.buffers {
                buffer.clear_newest_episode(env_id, true);
            }
            self.clear_returns(env_id);
        }
    }

    /// Abandon the current job after an error: close the environment set and
    /// drop everything buffered. The next `step` relaunches.
    pub fn abort(&mut self) {
        self.close();
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        for returns in &mut self.episode_returns {
            returns.fill(0.0);
        }
    }

    /// Close the environment set.
    pub fn close(&mut self) {
        if !self.env.closed() {
            self.env.close();
        }
    }

    /// Collector configuration.
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The environment set.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Mutable access to the environment set.
    pub fn env_mut(&mut self) -> &mut E {
        &mut self.env
    }

    /// The freshness tracker.
    pub fn tracker(&self) -> &ModelFreshnessTracker<P::Weights> {
        &self.tracker
    }

    /// Transition buffers, indexed by policy id.
    pub fn buffers(&self) -> &[TransitionBuffer<P::Record>] {
        &self.buffers
    }

    /// Timesteps processed over the collector's lifetime.
    pub fn total_envstep_count(&self) -> usize {
        self.total_envstep_count
    }
}

fn check_env_ids<'a>(
    mut env_ids: impl Iterator<Item = &'a usize>,
    env_num: usize,
) -> Result<(), CollectError> {
    match env_ids.find(|&&env_id| env_id >= env_num) {
        Some(&env_id) => Err(CollectError::UnknownEnv { env_id, env_num }),
        None => Ok(()),
    }
}
