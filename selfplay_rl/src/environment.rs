//! Environment control surface for multi-player battle environments.
//!
//! One `BattleEnv` manages `env_num` parallel game instances. Every instance
//! hosts several policies (one per player in self-play), so observations,
//! actions, rewards and infos are keyed by environment id and then by policy
//! id.
//!
//! Step results are tagged: an engine-reported fault surfaces as
//! `StepOutcome::Abnormal` instead of a side-channel flag.

use std::collections::BTreeMap;
use thiserror::Error;

/// Per-environment, per-policy mapping.
pub type EnvMap<T> = BTreeMap<usize, BTreeMap<usize, T>>;

/// Errors raised by an environment manager.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Launching the environment set failed.
    #[error("failed to launch environments: {0}")]
    Launch(String),
    /// Stepping failed for the whole set.
    #[error("environment step failed: {0}")]
    Step(String),
    /// Operation requires a launched environment set.
    #[error("environment set is closed")]
    Closed,
    /// A timestep lacks the component for a policy that has an observation.
    #[error("timestep for env {env_id} has no {field} for policy {policy_id}")]
    Malformed {
        env_id: usize,
        policy_id: usize,
        field: &'static str,
    },
}

/// Joint result of one environment step across all its policies.
#[derive(Debug, Clone, PartialEq)]
pub struct Timestep<O, I> {
    /// Next observation per policy. Policies absent here did not act.
    pub obs: BTreeMap<usize, O>,
    /// Reward per policy
    pub reward: BTreeMap<usize, f32>,
    /// Episode finished
    pub done: bool,
    /// Extra per-policy information (e.g. episode result)
    pub info: BTreeMap<usize, I>,
}

impl<O: Clone, I: Clone> Timestep<O, I> {
    /// Slice the joint timestep down to one policy.
    ///
    /// Returns `Ok(None)` when the policy has no observation in this step and
    /// an error when it has an observation but no reward or info.
    pub fn for_policy(
        &self,
        env_id: usize,
        policy_id: usize,
    ) -> Result<Option<PolicyTimestep<O, I>>, EnvError> {
        let Some(obs) = self.obs.get(&policy_id) else {
            return Ok(None);
        };
        let reward = *self.reward.get(&policy_id).ok_or(EnvError::Malformed {
            env_id,
            policy_id,
            field: "reward",
        })?;
        let info = self.info.get(&policy_id).ok_or(EnvError::Malformed {
            env_id,
            policy_id,
            field: "info",
        })?;

        Ok(Some(PolicyTimestep {
            obs: obs.clone(),
            reward,
            done: self.done,
            info: info.clone(),
        }))
    }
}

/// One policy's view of a timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTimestep<O, I> {
    pub obs: O,
    pub reward: f32,
    pub done: bool,
    pub info: I,
}

/// Outcome of stepping one environment instance.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<O, I> {
    /// Regular step.
    Normal(Timestep<O, I>),
    /// Engine error or out-of-sync game state. The in-flight episode is
    /// unusable.
    Abnormal { reason: String },
}

impl<O, I> StepOutcome<O, I> {
    /// Abnormal outcome with a reason.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::Abnormal {
            reason: reason.into(),
        }
    }

    /// Whether the step was abnormal.
    #[inline]
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Abnormal { .. })
    }

    /// Whether the step finished the episode normally.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Normal(ts) if ts.done)
    }
}

/// Manager of `env_num` parallel multi-player environments.
///
/// Instances that finish an episode are expected to restart on their own so
/// `ready_obs` always reflects the next decision point.
pub trait BattleEnv {
    /// Observation for one policy
    type Obs;
    /// Action for one policy
    type Action;
    /// Per-policy step info
    type Info;

    /// Number of parallel environment instances.
    fn env_num(&self) -> usize;

    /// Whether the set is currently closed.
    fn closed(&self) -> bool;

    /// Start (or restart) every instance.
    fn launch(&mut self) -> Result<(), EnvError>;

    /// Shut every instance down. Idempotent.
    fn close(&mut self);

    /// Observations of the instances waiting for actions.
    fn ready_obs(&self) -> EnvMap<Self::Obs>;

    /// Step the instances named in `actions`.
    fn step(
        &mut self,
        actions: EnvMap<Self::Action>,
    ) -> Result<BTreeMap<usize, StepOutcome<Self::Obs, Self::Info>>, EnvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestep(done: bool) -> Timestep<u32, &'static str> {
        Timestep {
            obs: BTreeMap::from([(0, 10), (1, 11)]),
            reward: BTreeMap::from([(0, 1.0), (1, -1.0)]),
            done,
            info: BTreeMap::from([(0, "win"), (1, "loss")]),
        }
    }

    #[test]
    fn test_for_policy_slices_components() {
        let ts = timestep(true);
        let p1 = ts.for_policy(0, 1).unwrap().unwrap();
        assert_eq!(p1.obs, 11);
        assert_eq!(p1.reward, -1.0);
        assert!(p1.done);
        assert_eq!(p1.info, "loss");
    }

    #[test]
    fn test_for_policy_without_observation() {
        let ts = timestep(false);
        assert!(ts.for_policy(0, 7).unwrap().is_none());
    }

    #[test]
    fn test_for_policy_missing_reward_is_malformed() {
        let mut ts = timestep(false);
        ts.reward.remove(&1);
        let err = ts.for_policy(3, 1).unwrap_err();
        assert!(matches!(
            err,
            EnvError::Malformed {
                env_id: 3,
                policy_id: 1,
                field: "reward"
            }
        ));
    }

    #[test]
    fn test_outcome_flags() {
        let done: StepOutcome<u32, &str> = StepOutcome::Normal(timestep(true));
        let running: StepOutcome<u32, &str> = StepOutcome::Normal(timestep(false));
        let abnormal: StepOutcome<u32, &str> = StepOutcome::abnormal("desync");

        assert!(done.is_done());
        assert!(!running.is_done());
        assert!(abnormal.is_abnormal());
        assert!(!abnormal.is_done());
    }
}
