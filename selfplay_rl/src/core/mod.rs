//! Core types shared by actors and learners.

pub mod clock;
pub mod model_store;
pub mod player;
pub mod transition;

pub use clock::{Clock, ManualClock, SystemClock};
pub use model_store::{model_store, ModelSnapshot, ModelSource, ModelStore, NoModelSource, SharedModelStore};
pub use player::{PlayerId, PlayerRef, PlayerRole};
pub use transition::{TrajectoryChunk, Transition};
