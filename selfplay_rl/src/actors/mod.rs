//! Actor side of self-play: rollout collection and model freshness.
//!
//! - `RolloutCollector`: drives an environment set with per-player policies
//!   and cuts the resulting steps into trajectory chunks
//! - `ModelFreshnessTracker`: per-player model bookkeeping, gates collection
//!   on sufficiently recent models
//! - `CollectorWorker`: runs a collector on its own thread behind channels

pub mod collector;
pub mod freshness;
pub mod policy;
pub mod worker;


pub use collector::{CollectContext, CollectError, RolloutCollector};
pub use freshness::{FreshnessError, ModelFreshnessTracker, PlayerModelInfo};
pub use policy::{Policy, PolicyError, PolicySlot};
pub use worker::{CollectorWorker, WorkerError, WorkerHandle};

// Re-export from messages for convenience
pub use crate::messages::{CollectJob, CollectorStats, WorkerEvent, WorkerMsg};
