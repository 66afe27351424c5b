//! Transition and trajectory chunk types.
//!
//! - `Transition<R>`: one environment step for one policy, wrapping the
//!   policy-built record `R` with the fields the collection core needs
//! - `TrajectoryChunk<R>`: an unroll of consecutive transitions for one
//!   (environment, policy) pair, as handed to the replay buffer

/// One environment step seen by one policy.
///
/// `record` carries the policy-specific observation, action and auxiliary
/// fields produced by `Policy::process_transition`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<R> {
    /// Policy-built step record
    pub record: R,
    /// Reward for this policy at this step
    pub reward: f32,
    /// Episode ended at this step
    pub done: bool,
    /// Training iteration of the model that chose the action
    pub collect_train_iter: u64,
}

impl<R> Transition<R> {
    /// Create a transition.
    pub fn new(record: R, reward: f32, done: bool, collect_train_iter: u64) -> Self {
        Self {
            record,
            reward,
            done,
            collect_train_iter,
        }
    }
}

/// Fixed-length run of transitions for one (environment, policy) pair.
///
/// Invariant: `len() <= unroll_len`. Only the last chunk of a finished
/// episode may be shorter, and that chunk has `terminal == true`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryChunk<R> {
    /// Environment that produced the chunk
    pub env_id: usize,
    /// Policy slot inside the environment
    pub policy_id: usize,
    /// Ordered transitions
    pub transitions: Vec<Transition<R>>,
    /// Chunk closes its episode
    pub terminal: bool,
}

impl<R> TrajectoryChunk<R> {
    /// Number of transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Iterate over transitions.
    pub fn iter(&self) -> impl Iterator<Item = &Transition<R>> {
        self.transitions.iter()
    }

    /// Sum of rewards in the chunk.
    pub fn total_reward(&self) -> f32 {
        self.transitions.iter().map(|t| t.reward).sum()
    }

    /// Oldest model iteration that contributed to the chunk.
    pub fn min_train_iter(&self) -> Option<u64> {
        self.transitions.iter().map(|t| t.collect_train_iter).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_accessors() {
        let chunk = TrajectoryChunk {
            env_id: 1,
            policy_id: 0,
            transitions: vec![
                Transition::new("a", 1.0, false, 4),
                Transition::new("b", 0.5, false, 3),
                Transition::new("c", -0.5, true, 5),
            ],
            terminal: true,
        };

        assert_eq!(chunk.len(), 3);
        assert!(!chunk.is_empty());
        assert!((chunk.total_reward() - 1.0).abs() < 1e-6);
        assert_eq!(chunk.min_train_iter(), Some(3));
        assert_eq!(
            chunk.iter().map(|t| t.record).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_empty_chunk() {
        let chunk: TrajectoryChunk<u8> = TrajectoryChunk {
            env_id: 0,
            policy_id: 0,
            transitions: Vec::new(),
            terminal: false,
        };
        assert!(chunk.is_empty());
        assert_eq!(chunk.min_train_iter(), None);
    }
}
