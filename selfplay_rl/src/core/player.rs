//! Player identity for league self-play.
//!
//! A player is one participant in a match. Active players keep training and
//! receive fresh snapshots from their learner; historical players are frozen
//! past versions that never change once published.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque player identifier assigned by the league.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create a player id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Role of a player inside the league.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlayerRole {
    /// Player still being trained. Its model must stay fresh.
    #[default]
    Active,
    /// Frozen past version. Exempt from freshness checks and never updated.
    Historical,
}

/// Player id tagged with its league role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerRef {
    pub id: PlayerId,
    pub role: PlayerRole,
}

impl PlayerRef {
    /// Active (training) player.
    pub fn active(id: impl Into<String>) -> Self {
        Self {
            id: PlayerId::new(id),
            role: PlayerRole::Active,
        }
    }

    /// Frozen historical player.
    pub fn historical(id: impl Into<String>) -> Self {
        Self {
            id: PlayerId::new(id),
            role: PlayerRole::Historical,
        }
    }

    /// Whether this player receives model updates.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.role, PlayerRole::Active)
    }

    /// Whether this player is a frozen past version.
    #[inline]
    pub fn is_historical(&self) -> bool {
        matches!(self.role, PlayerRole::Historical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let main = PlayerRef::active("main_player");
        let past = PlayerRef::historical("main_player_v3");

        assert!(main.is_active());
        assert!(!main.is_historical());
        assert!(past.is_historical());
        assert!(!past.is_active());
    }

    #[test]
    fn test_role_is_not_inferred_from_name() {
        // Names containing "historical" are still active unless tagged.
        let player = PlayerRef::active("historical_looking_name");
        assert!(player.is_active());
    }

    #[test]
    fn test_player_id_display() {
        let id = PlayerId::from("agent1");
        assert_eq!(id.to_string(), "agent1");
        assert_eq!(id.as_str(), "agent1");
    }
}
