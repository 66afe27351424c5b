//! Configuration for collectors and learners.
//!
//! Every config follows the same pattern: `Default` values, `with_*` builder
//! setters, `validate()` and a `build()` that validates. Configs are
//! serializable so an external loader can produce them.

use crate::core::player::PlayerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A count parameter must be positive.
    #[error("{field} must be > 0, got {value}")]
    InvalidCount { field: &'static str, value: u64 },
    /// A parameter is outside its valid range.
    #[error("{field} must be in [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    /// A required identifier is empty.
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidCount { field, value });
    }
    Ok(())
}

// =============================================================================
// COLLECTOR
// =============================================================================

/// Rollout collection settings for one collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Collector identifier used in log lines
    pub collector_id: usize,
    /// Target trajectory chunk length, also the env-step budget of one tick
    pub unroll_len: usize,
    /// Finished episodes after which a job is done
    pub n_episode: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collector_id: 0,
            unroll_len: 32,
            n_episode: 1,
        }
    }
}

impl CollectorConfig {
    /// Create default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config for a specific collector id.
    pub fn for_collector(collector_id: usize) -> Self {
        Self {
            collector_id,
            ..Default::default()
        }
    }

    /// Set the trajectory chunk length.
    pub fn with_unroll_len(mut self, unroll_len: usize) -> Self {
        self.unroll_len = unroll_len;
        self
    }

    /// Set the episode target per job.
    pub fn with_n_episode(mut self, n_episode: usize) -> Self {
        self.n_episode = n_episode;
        self
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("unroll_len", self.unroll_len as u64)?;
        require_positive("n_episode", self.n_episode as u64)?;
        Ok(())
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

// =============================================================================
// FRESHNESS
// =============================================================================

/// Model freshness gating settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessConfig {
    /// Maximum age of a player's newest model before collection blocks.
    /// `None` disables the gate.
    pub staleness_bound_secs: Option<f64>,
    /// Sleep between polls while waiting
    pub poll_interval_ms: u64,
    /// Minimum gap between two warnings for the same player
    pub warn_interval_secs: f64,
    /// Give up after this many polls. `None` waits forever.
    pub max_polls: Option<usize>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            staleness_bound_secs: None,
            poll_interval_ms: 1000,
            warn_interval_secs: 5.0,
            max_polls: None,
        }
    }
}

impl FreshnessConfig {
    /// Create default config (gate disabled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the staleness bound in seconds.
    pub fn with_staleness_bound_secs(mut self, secs: f64) -> Self {
        self.staleness_bound_secs = Some(secs);
        self
    }

    /// Disable the staleness gate.
    pub fn without_staleness_bound(mut self) -> Self {
        self.staleness_bound_secs = None;
        self
    }

    /// Set the poll interval in milliseconds.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the warning interval in seconds.
    pub fn with_warn_interval_secs(mut self, secs: f64) -> Self {
        self.warn_interval_secs = secs;
        self
    }

    /// Bound the number of polls.
    pub fn with_max_polls(mut self, max_polls: usize) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    /// Staleness bound as a duration. Infinite, absent or unrepresentable
    /// bounds map to `None`.
    pub fn staleness_bound(&self) -> Option<Duration> {
        self.staleness_bound_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Warning interval as a duration.
    pub fn warn_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.warn_interval_secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(secs) = self.staleness_bound_secs {
            if secs.is_nan() || secs <= 0.0 {
                return Err(ConfigError::OutOfRange {
                    field: "staleness_bound_secs",
                    value: secs,
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }
        require_positive("poll_interval_ms", self.poll_interval_ms)?;
        if !self.warn_interval_secs.is_finite() || self.warn_interval_secs < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "warn_interval_secs",
                value: self.warn_interval_secs,
                min: 0.0,
                max: f64::MAX,
            });
        }
        if let Some(max_polls) = self.max_polls {
            require_positive("max_polls", max_polls as u64)?;
        }
        Ok(())
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

// =============================================================================
// LEARNER
// =============================================================================

/// Training-step settings for one learner replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Player whose model this learner trains
    pub player_id: PlayerId,
    /// Optimizer learning rate
    pub learning_rate: f64,
    /// Training steps during which only the value head is updated
    pub value_pretrain_iters: u64,
    /// Publish inference weights every this many training steps
    pub publish_freq: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            player_id: PlayerId::new("main_player"),
            learning_rate: 1e-4,
            value_pretrain_iters: 0,
            publish_freq: 1,
        }
    }
}

impl LearnerConfig {
    /// Create default config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config for a specific player.
    pub fn for_player(player_id: impl Into<String>) -> Self {
        Self {
            player_id: PlayerId::new(player_id),
            ..Default::default()
        }
    }

    /// Set learning rate.
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set value pretraining length.
    pub fn with_value_pretrain_iters(mut self, iters: u64) -> Self {
        self.value_pretrain_iters = iters;
        self
    }

    /// Set publication frequency.
    pub fn with_publish_freq(mut self, freq: u64) -> Self {
        self.publish_freq = freq;
        self
    }

    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.player_id.as_str().is_empty() {
            return Err(ConfigError::Empty { field: "player_id" });
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "learning_rate",
                value: self.learning_rate,
                min: 0.0,
                max: f64::MAX,
            });
        }
        require_positive("publish_freq", self.publish_freq)?;
        Ok(())
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}
