//! Collector worker thread.
//!
//! A worker owns one `RolloutCollector` on its own thread. Jobs arrive on a
//! crossbeam command channel; trajectory chunks, job results and statistics
//! leave on an event channel that doubles as the trajectory sink.
//!
//! Policies are pooled per player across jobs, so inference state and
//! loaded weights survive from one job to the next.

use crate::actors::collector::{CollectContext, RolloutCollector};
use crate::actors::freshness::ModelFreshnessTracker;
use crate::actors::policy::{Policy, PolicySlot};
use crate::config::{CollectorConfig, ConfigError, FreshnessConfig};
use crate::core::clock::Clock;
use crate::core::model_store::ModelSource;
use crate::core::player::{PlayerId, PlayerRef};
use crate::environment::BattleEnv;
use crate::messages::{CollectJob, CollectorStats, WorkerEvent, WorkerMsg};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// Capacity of the command and event channels.
const CHANNEL_CAPACITY: usize = 100;

/// Errors raised while spawning a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid collector config: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle for controlling a spawned worker thread.
pub struct WorkerHandle<R, I> {
    /// Thread handle
    pub thread: std::thread::JoinHandle<()>,
    /// Channel to send commands to the worker
    pub cmd_tx: Sender<WorkerMsg>,
    /// Channel to receive chunks, results and stats from the worker
    pub event_rx: Receiver<WorkerEvent<R, I>>,
}

impl<R, I> WorkerHandle<R, I> {
    /// Queue a job. Returns `false` if the worker is gone.
    pub fn submit(&self, job: CollectJob) -> bool {
        self.cmd_tx.send(WorkerMsg::Collect(job)).is_ok()
    }

    /// Ask for a `WorkerEvent::Stats` reply. Returns `false` if the
    /// command queue is full or the worker is gone.
    pub fn request_stats(&self) -> bool {
        self.cmd_tx.try_send(WorkerMsg::RequestStats).is_ok()
    }

    /// Send stop command to the worker.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(WorkerMsg::Stop);
    }

    /// Next event, if one is ready (non-blocking).
    pub fn try_event(&self) -> Option<WorkerEvent<R, I>> {
        self.event_rx.try_recv().ok()
    }

    /// Wait for the worker thread to finish.
    pub fn join(self) -> std::thread::Result<()> {
        self.thread.join()
    }
}

/// Spawns collector worker threads.
pub struct CollectorWorker {
    config: CollectorConfig,
    freshness: FreshnessConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl CollectorWorker {
    /// Create a worker with the given configuration.
    pub fn new(config: CollectorConfig, freshness: FreshnessConfig) -> Self {
        Self {
            config,
            freshness,
            clock: None,
        }
    }

    /// Use a different time source for freshness gating.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configs and spawn the worker thread.
    ///
    /// The environment set is built on the worker thread by `env_factory`.
    /// `policy_factory` creates a policy the first time a player needs one
    /// more slot than the pool holds.
    pub fn spawn<E, P, FEnv, FPolicy>(
        self,
        env_factory: FEnv,
        policy_factory: FPolicy,
        agent_num: usize,
        source: Arc<dyn ModelSource<P::Weights> + Send + Sync>,
    ) -> Result<WorkerHandle<P::Record, P::Info>, WorkerError>
    where
        E: BattleEnv<Obs = P::Obs, Action = P::Action, Info = P::Info> + 'static,
        P: Policy + 'static,
        P::Obs: Clone,
        P::Info: Clone + Send + 'static,
        P::Record: Send + 'static,
        P::Weights: Send + Sync + 'static,
        FEnv: FnOnce() -> E + Send + 'static,
        FPolicy: FnMut(&PlayerRef) -> P + Send + 'static,
    {
        self.config.validate()?;
        let collector_id = self.config.collector_id;
        let mut tracker =
            ModelFreshnessTracker::new(self.freshness.clone())?.with_collector_id(collector_id);
        if let Some(clock) = self.clock {
            tracker = tracker.with_clock(clock);
        }

        let (cmd_tx, cmd_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = crossbeam_channel::bounded(CHANNEL_CAPACITY);

        let thread = std::thread::Builder::new()
            .name(format!("Collector-{collector_id}"))
            .spawn(move || {
                let collector = match RolloutCollector::new(
                    self.config,
                    self.freshness,
                    env_factory(),
                    agent_num,
                    source,
                ) {
                    Ok(collector) => collector.with_tracker(tracker),
                    Err(err) => {
                        log::error!("[collector {collector_id}] cannot start: {err}");
                        return;
                    }
                };
                let mut state = WorkerState {
                    collector,
                    policy_factory,
                    pool: Vec::new(),
                    queued: VecDeque::new(),
                    stats: CollectorStats::new(collector_id),
                    cmd_rx,
                    event_tx,
                };
                state.run();
            })?;

        Ok(WorkerHandle {
            thread,
            cmd_tx,
            event_rx,
        })
    }
}

/// Everything owned by the worker thread.
struct WorkerState<E, P, FPolicy>
where
    P: Policy,
{
    collector: RolloutCollector<E, P>,
    policy_factory: FPolicy,
    /// Idle policies by player
    pool: Vec<(PlayerId, P)>,
    /// Jobs received while another job was running
    queued: VecDeque<CollectJob>,
    /// Lifetime statistics
    stats: CollectorStats,
    cmd_rx: Receiver<WorkerMsg>,
    event_tx: Sender<WorkerEvent<P::Record, P::Info>>,
}

/// What the worker should do after handling a command.
enum Flow {
    Continue,
    Stop,
}

impl<E, P, FPolicy> WorkerState<E, P, FPolicy>
where
    E: BattleEnv<Obs = P::Obs, Action = P::Action, Info = P::Info>,
    P: Policy,
    P::Obs: Clone,
    P::Info: Clone,
    FPolicy: FnMut(&PlayerRef) -> P,
{
    fn run(&mut self) {
        loop {
            let job = match self.queued.pop_front() {
                Some(job) => job,
                None => match self.cmd_rx.recv() {
                    Ok(WorkerMsg::Collect(job)) => job,
                    Ok(WorkerMsg::RequestStats) => {
                        self.send_stats();
                        continue;
                    }
                    Ok(WorkerMsg::Stop) | Err(_) => break,
                },
            };
            if let Flow::Stop = self.run_job(job) {
                break;
            }
        }
        self.collector.close();
    }

    fn run_job(&mut self, job: CollectJob) -> Flow {
        let job_id = job.job_id;
        let policies = self.checkout(&job);
        let mut ctx = CollectContext::new(job.players, policies, job.n_episode);

        let flow = loop {
            if let Flow::Stop = self.poll_commands() {
                break Flow::Stop;
            }

            if let Err(err) = self.collector.step(&mut ctx) {
                log::error!(
                    "[collector {}] job {} failed: {}",
                    self.collector.config().collector_id,
                    job_id,
                    err
                );
                self.collector.abort();
                let reason = err.to_string();
                break self.emit(WorkerEvent::JobFailed { job_id, reason });
            }

            let chunks = ctx.take_trajectories();
            if !chunks.is_empty() {
                if let Flow::Stop = self.emit(WorkerEvent::Chunks { job_id, chunks }) {
                    break Flow::Stop;
                }
            }

            if ctx.job_finished {
                self.stats.merge(&ctx.stats);
                let episode_info = std::mem::take(&mut ctx.episode_info);
                let stats = ctx.stats.clone();
                break self.emit(WorkerEvent::JobFinished {
                    job_id,
                    episode_info,
                    stats,
                });
            }
        };

        self.checkin(ctx.policies);
        flow
    }

    /// Build the job's policy slots from the pool, creating what is missing.
    fn checkout(&mut self, job: &CollectJob) -> Vec<PolicySlot<P>> {
        job.players
            .iter()
            .map(|player| {
                let pooled = self
                    .pool
                    .iter()
                    .position(|(id, _)| *id == player.id)
                    .map(|idx| self.pool.swap_remove(idx).1);
                let policy = match pooled {
                    Some(policy) => policy,
                    None => self.fresh_policy(player),
                };
                let mut slot = PolicySlot::new(player.clone(), policy);
                slot.set_only_update_baseline(job.only_update_baseline && player.is_active());
                slot
            })
            .collect()
    }

    /// Create a policy and bring it up to the weights already loaded for
    /// its player.
    fn fresh_policy(&mut self, player: &PlayerRef) -> P {
        let mut policy = (self.policy_factory)(player);
        if let Some(weights) = self.collector.tracker().loaded_weights(&player.id) {
            if let Err(err) = policy.load_state_dict(&weights) {
                log::warn!(
                    "[collector {}] could not load current weights for {}: {}",
                    self.collector.config().collector_id,
                    player.id,
                    err
                );
            }
        }
        policy
    }

    fn checkin(&mut self, slots: Vec<PolicySlot<P>>) {
        self.pool.extend(
            slots
                .into_iter()
                .map(|slot| (slot.player.id.clone(), slot.into_policy())),
        );
    }

    /// Handle commands that arrived while a job is running.
    fn poll_commands(&mut self) -> Flow {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(WorkerMsg::Collect(job)) => self.queued.push_back(job),
                Ok(WorkerMsg::RequestStats) => self.send_stats(),
                Ok(WorkerMsg::Stop) | Err(TryRecvError::Disconnected) => return Flow::Stop,
                Err(TryRecvError::Empty) => return Flow::Continue,
            }
        }
    }

    fn send_stats(&self) {
        if let Err(err) = self.event_tx.try_send(WorkerEvent::Stats(self.stats.clone())) {
            log::debug!(
                "[collector {}] dropped stats reply: {}",
                self.collector.config().collector_id,
                err
            );
        }
    }

    /// Send an event; a dropped receiver stops the worker.
    fn emit(&self, event: WorkerEvent<P::Record, P::Info>) -> Flow {
        match self.event_tx.send(event) {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }
}
