//! Message types for collector workers.
//!
//! # Architecture
//!
//! ```text
//!        +-------------+   WorkerMsg    +------------------+
//!        |  Scheduler  | -------------> | CollectorWorker  |
//!        +-------------+                +------------------+
//!               ^                                |
//!               |      WorkerEvent (chunks,      |
//!               +------- job results, stats) ----+
//! ```

mod worker_msg;


pub use worker_msg::{CollectJob, CollectorStats, WorkerEvent, WorkerMsg};
