//! Learner side: replica synchronization and the training step.
//!
//! - `GradientSynchronizer`: averages gradients and broadcasts parameters
//!   across the replicas of one player's learner
//! - `Collective`: blocking rendezvous the synchronizer runs on
//! - `RlTrainer`: forward, backward, sync, optimizer step, publication
//! - `MemoryMonitor`: per-step scratch storage with memory accounting

pub mod collective;
pub mod control;
pub mod gradient_sync;
pub mod memory;
pub mod snapshot;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use collective::{local_group, Collective, CollectiveError, LocalCollective, SoloCollective};
pub use control::ControlFlags;
pub use gradient_sync::{GradientSynchronizer, SyncError, SyncState};
pub use memory::{
    HostMemoryProbe, MemoryDelta, MemoryMonitor, MemoryProbe, MemoryReport, NullProbe, ScratchScope,
};
pub use snapshot::{decode_model, encode_model, SnapshotError};
pub use trainer::{LearnerModel, RlTrainer, TrainError, TrainStepInfo};
