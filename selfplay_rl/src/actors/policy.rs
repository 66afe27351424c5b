//! Policy surface consumed by the collector.
//!
//! A policy owns its weights and per-environment inference state (e.g. a
//! recurrent hidden state). The collector never looks inside: it asks for an
//! action, hands back the resulting timestep, and gets an opaque record that
//! goes into the transition buffer.

use crate::core::player::PlayerRef;
use crate::environment::PolicyTimestep;
use thiserror::Error;

/// Errors raised by a policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Inference failed for one environment.
    #[error("forward failed for env {env_id}: {reason}")]
    Forward { env_id: usize, reason: String },
    /// Weights could not be loaded.
    #[error("failed to load weights: {0}")]
    Load(String),
}

/// Acting policy for one player.
pub trait Policy {
    /// Observation for this policy
    type Obs;
    /// Action sent to the environment
    type Action;
    /// Per-step info from the environment
    type Info;
    /// Step record stored in the transition buffer
    type Record;
    /// Weights accepted by `load_state_dict`
    type Weights;

    /// Choose an action for `env_id`.
    ///
    /// The policy keeps whatever it needs (logits, hidden state, ...) to build
    /// the record in the following `process_transition` call.
    fn forward(&mut self, env_id: usize, obs: &Self::Obs) -> Result<Self::Action, PolicyError>;

    /// Reset inference state for `env_id` at an episode boundary.
    ///
    /// `obs` is the first observation of the next episode when the
    /// environment already has one.
    fn reset(&mut self, env_id: usize, obs: Option<&Self::Obs>);

    /// Turn the outcome of the last action in `env_id` into a step record.
    fn process_transition(
        &mut self,
        env_id: usize,
        timestep: PolicyTimestep<Self::Obs, Self::Info>,
    ) -> Self::Record;

    /// Replace the policy weights. Must leave the old weights in place on
    /// failure.
    fn load_state_dict(&mut self, weights: &Self::Weights) -> Result<(), PolicyError>;

    /// Switch value-only pretraining mode.
    fn set_only_update_baseline(&mut self, _only_update_baseline: bool) {}
}

/// One participant's policy inside a job.
#[derive(Debug)]
pub struct PolicySlot<P> {
    /// Player controlling this slot
    pub player: PlayerRef,
    /// The acting policy
    pub policy: P,
    only_update_baseline: bool,
}

impl<P: Policy> PolicySlot<P> {
    /// Wrap a policy for `player`.
    pub fn new(player: PlayerRef, policy: P) -> Self {
        Self {
            player,
            policy,
            only_update_baseline: false,
        }
    }

    /// Whether the slot runs in value-only pretraining mode.
    pub fn only_update_baseline(&self) -> bool {
        self.only_update_baseline
    }

    /// Switch value-only pretraining mode, forwarding it to the policy.
    pub fn set_only_update_baseline(&mut self, only_update_baseline: bool) {
        self.only_update_baseline = only_update_baseline;
        self.policy.set_only_update_baseline(only_update_baseline);
    }

    /// Unwrap the policy.
    pub fn into_policy(self) -> P {
        self.policy
    }
}
