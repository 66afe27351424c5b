//! # selfplay_rl: actor/learner core for distributed self-play RL
//!
//! Collectors drive battle environments with one policy per agent, cut the
//! resulting steps into fixed-length trajectory chunks and keep every
//! active player's model fresh. Learners train replicas of one player's
//! model, average gradients across replicas and publish weights back to the
//! collectors.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Collector threads                         Learner replicas          │
//! │  ┌──────────────────┐                      ┌──────────────────┐      │
//! │  │ RolloutCollector │   WorkerEvent::      │ RlTrainer rank 0 │──┐   │
//! │  │  BattleEnv       │──── Chunks ────────> │ RlTrainer rank 1 │  │   │
//! │  │  Policy slots    │                      │ RlTrainer rank N │  │   │
//! │  │  TransitionBuf.  │                      └────────┬─────────┘  │   │
//! │  │  FreshnessTrack. │                               │ Collective │   │
//! │  └────────▲─────────┘                      GradientSynchronizer  │   │
//! │           │                                                      │   │
//! │           │ fetch            ┌──────────────┐   publish (rank 0) │   │
//! │           └──────────────────│  ModelStore  │<───────────────────┘   │
//! │                              │ (swap slots) │                        │
//! │                              └──────────────┘                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use selfplay_rl::{CollectorConfig, CollectorWorker, FreshnessConfig, CollectJob, model_store};
//!
//! let store = model_store::<Vec<u8>>();
//! let worker = CollectorWorker::new(
//!     CollectorConfig::for_collector(0).with_unroll_len(32),
//!     FreshnessConfig::new().with_staleness_bound_secs(600.0),
//! );
//! let handle = worker.spawn(make_env, make_policy, 2, store.clone())?;
//! handle.submit(CollectJob::new(0, players, 1));
//! ```

pub mod actors;
pub mod buffers;
pub mod config;
pub mod core;
pub mod environment;
pub mod learner;
pub mod messages;

pub use config::{CollectorConfig, ConfigError, FreshnessConfig, LearnerConfig};

pub use core::clock::{Clock, ManualClock, SystemClock};
pub use core::model_store::{model_store, ModelSnapshot, ModelSource, ModelStore, NoModelSource, SharedModelStore};
pub use core::player::{PlayerId, PlayerRef, PlayerRole};
pub use core::transition::{TrajectoryChunk, Transition};

pub use environment::{BattleEnv, EnvError, EnvMap, PolicyTimestep, StepOutcome, Timestep};

pub use buffers::TransitionBuffer;

pub use actors::{
    CollectContext, CollectError, CollectorWorker, FreshnessError, ModelFreshnessTracker,
    PlayerModelInfo, Policy, PolicyError, PolicySlot, RolloutCollector, WorkerError, WorkerHandle,
};

pub use messages::{CollectJob, CollectorStats, WorkerEvent, WorkerMsg};

pub use learner::{
    decode_model, encode_model, local_group, Collective, CollectiveError, ControlFlags,
    GradientSynchronizer, HostMemoryProbe, LearnerModel, LocalCollective, MemoryDelta,
    MemoryMonitor, MemoryProbe, MemoryReport, NullProbe, RlTrainer, ScratchScope, SnapshotError,
    SoloCollective, SyncError, SyncState, TrainError, TrainStepInfo,
};
