//! Out-of-band control requests for a running learner.
//!
//! An operator thread raises flags; the trainer consumes them at the end of
//! its next training step, so a request never interrupts a step halfway.

use crate::config::LearnerConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pending control requests, shared between the trainer and its operator.
#[derive(Debug, Default)]
pub struct ControlFlags {
    update_config: AtomicBool,
    reset_value: AtomicBool,
    staged_config: Mutex<Option<LearnerConfig>>,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a new configuration for the next step.
    ///
    /// A later request before the step replaces an earlier one.
    pub fn request_update_config(&self, config: LearnerConfig) {
        *self.staged_config.lock() = Some(config);
        self.update_config.store(true, Ordering::Release);
    }

    /// Ask for the value head to be reinitialized.
    pub fn request_reset_value(&self) {
        self.reset_value.store(true, Ordering::Release);
    }

    pub fn update_config_requested(&self) -> bool {
        self.update_config.load(Ordering::Acquire)
    }

    pub fn reset_value_requested(&self) -> bool {
        self.reset_value.load(Ordering::Acquire)
    }

    /// Clear the update flag and hand out the staged config.
    pub fn take_update_config(&self) -> Option<LearnerConfig> {
        if self.update_config.swap(false, Ordering::AcqRel) {
            self.staged_config.lock().take()
        } else {
            None
        }
    }

    /// Clear the reset flag, returning whether it was set.
    pub fn take_reset_value(&self) -> bool {
        self.reset_value.swap(false, Ordering::AcqRel)
    }
}
