//! Per-player model freshness tracking.
//!
//! The tracker sits between the model distribution channel and the policy
//! slots of one collector. It remembers, per player, when the newest model
//! was received and which training iteration is currently loaded, and it
//! gates collection until every active player's newest model is younger
//! than the staleness bound.
//!
//! ```text
//! ModelSource ──fetch──> receive ──pending──> apply_pending ──> Policy
//!                           │                      │
//!                  get_new_model_time    update_new_model_time
//!                                        update_train_iter
//! ```
//!
//! Historical players never wait and never receive updates.

use crate::actors::policy::{Policy, PolicyError, PolicySlot};
use crate::config::{ConfigError, FreshnessConfig};
use crate::core::clock::{Clock, SystemClock};
use crate::core::model_store::{ModelSnapshot, ModelSource};
use crate::core::player::{PlayerId, PlayerRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while refreshing player models.
#[derive(Debug, Error)]
pub enum FreshnessError {
    /// Bounded wait ran out before the player received a fresh model.
    #[error("model for {player_id} still stale after {polls} polls ({waited:?})")]
    Stale {
        player_id: PlayerId,
        polls: usize,
        waited: Duration,
    },
    /// The policy rejected a snapshot.
    #[error("failed to load model {train_iter} for {player_id}")]
    Load {
        player_id: PlayerId,
        train_iter: u64,
        #[source]
        source: PolicyError,
    },
    /// Players and policy slots of a job disagree.
    #[error("{players} players but {slots} policy slots")]
    SlotMismatch { players: usize, slots: usize },
}

/// Freshness bookkeeping for one player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerModelInfo {
    /// When the newest model was received (or the player was first seen)
    pub get_new_model_time: Instant,
    /// When a model was last loaded into the policy
    pub update_new_model_time: Option<Instant>,
    /// Training iteration of the loaded model
    pub update_train_iter: Option<u64>,
}

struct PlayerEntry<W> {
    info: PlayerModelInfo,
    pending: Option<ModelSnapshot<W>>,
    loaded: Option<ModelSnapshot<W>>,
    last_warned: Option<Instant>,
}

/// Tracks model freshness for every player a collector has seen.
pub struct ModelFreshnessTracker<W> {
    config: FreshnessConfig,
    clock: Arc<dyn Clock>,
    collector_id: usize,
    players: HashMap<PlayerId, PlayerEntry<W>>,
}

impl<W> ModelFreshnessTracker<W> {
    /// Create a tracker on the system clock.
    pub fn new(config: FreshnessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            collector_id: 0,
            players: HashMap::new(),
        })
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tag log lines with a collector id.
    pub fn with_collector_id(mut self, collector_id: usize) -> Self {
        self.collector_id = collector_id;
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    /// Create the player's entry the first time it is seen.
    ///
    /// The entry is stamped with the current time and no loaded model, so a
    /// player no learner has published for yet does not block collection
    /// until the staleness bound elapses. Returns whether an entry was
    /// created.
    pub fn needs_initial_entry(&mut self, player_id: &PlayerId) -> bool {
        if self.players.contains_key(player_id) {
            return false;
        }
        let now = self.clock.now();
        self.players.insert(
            player_id.clone(),
            PlayerEntry {
                info: PlayerModelInfo {
                    get_new_model_time: now,
                    update_new_model_time: None,
                    update_train_iter: None,
                },
                pending: None,
                loaded: None,
                last_warned: None,
            },
        );
        true
    }

    /// Record a newly received snapshot.
    ///
    /// Accepted only when its iteration is newer than both the loaded and the
    /// already pending model. Returns whether it was accepted.
    pub fn receive(&mut self, snapshot: ModelSnapshot<W>) -> bool {
        self.needs_initial_entry(&snapshot.player_id);
        let now = self.clock.now();
        let Some(entry) = self.players.get_mut(&snapshot.player_id) else {
            return false;
        };

        let train_iter = snapshot.train_iter;
        let not_newer = |iter: Option<u64>| iter.is_some_and(|iter| train_iter <= iter);
        if not_newer(entry.info.update_train_iter)
            || not_newer(entry.pending.as_ref().map(|s| s.train_iter))
        {
            log::debug!(
                "collector {}: ignoring model {} for {}, not newer",
                self.collector_id,
                train_iter,
                snapshot.player_id
            );
            return false;
        }

        entry.info.get_new_model_time = now;
        entry.pending = Some(snapshot);
        true
    }

    /// Pull snapshots for every active player from `source`.
    ///
    /// Returns how many were accepted.
    pub fn poll_source<S>(&mut self, players: &[PlayerRef], source: &S) -> usize
    where
        S: ModelSource<W> + ?Sized,
    {
        players
            .iter()
            .filter(|player| player.is_active())
            .filter_map(|player| source.fetch(&player.id))
            .map(|snapshot| self.receive(snapshot))
            .filter(|&accepted| accepted)
            .count()
    }

    /// Block until every active player's newest model is younger than the
    /// staleness bound.
    ///
    /// Polls `source` between sleeps. Without a bound this returns at once.
    /// With `max_polls` set, gives up with `FreshnessError::Stale` after that
    /// many sleeps.
    pub fn wait_until_fresh<S>(
        &mut self,
        players: &[PlayerRef],
        source: &S,
    ) -> Result<(), FreshnessError>
    where
        S: ModelSource<W> + ?Sized,
    {
        let Some(bound) = self.config.staleness_bound() else {
            return Ok(());
        };
        for player in players.iter().filter(|p| p.is_active()) {
            self.needs_initial_entry(&player.id);
        }

        let started = self.clock.now();
        let mut polls = 0usize;
        loop {
            self.poll_source(players, source);

            let stale = self.stale_players(players, bound);
            let Some((first, _)) = stale.first() else {
                return Ok(());
            };

            if self.config.max_polls.is_some_and(|max| polls >= max) {
                return Err(FreshnessError::Stale {
                    player_id: first.clone(),
                    polls,
                    waited: self.clock.now().saturating_duration_since(started),
                });
            }

            self.warn_stale(&stale);
            self.clock.sleep(self.config.poll_interval());
            polls += 1;
        }
    }

    fn stale_players(&self, players: &[PlayerRef], bound: Duration) -> Vec<(PlayerId, Duration)> {
        let now = self.clock.now();
        players
            .iter()
            .filter(|player| player.is_active())
            .filter_map(|player| {
                let entry = self.players.get(&player.id)?;
                let age = now.saturating_duration_since(entry.info.get_new_model_time);
                (age >= bound).then(|| (player.id.clone(), age))
            })
            .collect()
    }

    fn warn_stale(&mut self, stale: &[(PlayerId, Duration)]) {
        let now = self.clock.now();
        let warn_interval = self.config.warn_interval();
        for (player_id, age) in stale {
            let Some(entry) = self.players.get_mut(player_id) else {
                continue;
            };
            let due = entry
                .last_warned
                .map_or(true, |at| now.saturating_duration_since(at) >= warn_interval);
            if due {
                log::warn!(
                    "collector {}: model for {} not updated for {:.1}s, waiting for a new model",
                    self.collector_id,
                    player_id,
                    age.as_secs_f64()
                );
                entry.last_warned = Some(now);
            }
        }
    }

    /// Load the player's pending snapshot into `slot`.
    ///
    /// Returns whether weights were loaded. A snapshot not newer than the
    /// loaded model is dropped without touching the policy. If loading
    /// fails the snapshot stays pending and bookkeeping is unchanged.
    pub fn apply_pending<P>(&mut self, slot: &mut PolicySlot<P>) -> Result<bool, FreshnessError>
    where
        P: Policy<Weights = W>,
    {
        let player = slot.player.clone();
        self.apply_to_slots(&player, std::slice::from_mut(slot))
    }

    /// Load the player's pending snapshot into every slot it controls.
    fn apply_to_slots<P>(
        &mut self,
        player: &PlayerRef,
        slots: &mut [PolicySlot<P>],
    ) -> Result<bool, FreshnessError>
    where
        P: Policy<Weights = W>,
    {
        if player.is_historical() {
            return Ok(false);
        }
        let now = self.clock.now();
        let Some(entry) = self.players.get_mut(&player.id) else {
            return Ok(false);
        };
        let Some(snapshot) = entry.pending.take() else {
            return Ok(false);
        };
        if entry
            .info
            .update_train_iter
            .is_some_and(|applied| snapshot.train_iter <= applied)
        {
            return Ok(false);
        }

        let loaded = slots
            .iter_mut()
            .filter(|slot| slot.player.id == player.id)
            .try_for_each(|slot| slot.policy.load_state_dict(&snapshot.weights));
        if let Err(source) = loaded {
            let train_iter = snapshot.train_iter;
            entry.pending = Some(snapshot);
            return Err(FreshnessError::Load {
                player_id: player.id.clone(),
                train_iter,
                source,
            });
        }

        entry.info.update_new_model_time = Some(now);
        entry.info.update_train_iter = Some(snapshot.train_iter);
        entry.loaded = Some(snapshot);
        Ok(true)
    }

    /// Per-tick refresh: create entries, wait for fresh models, load them.
    ///
    /// `slots[i]` must belong to `players[i]`.
    pub fn refresh<P, S>(
        &mut self,
        players: &[PlayerRef],
        slots: &mut [PolicySlot<P>],
        source: &S,
    ) -> Result<usize, FreshnessError>
    where
        P: Policy<Weights = W>,
        S: ModelSource<W> + ?Sized,
    {
        if players.len() != slots.len() {
            return Err(FreshnessError::SlotMismatch {
                players: players.len(),
                slots: slots.len(),
            });
        }
        for player in players {
            self.needs_initial_entry(&player.id);
        }
        self.wait_until_fresh(players, source)?;
        // Pick up anything that arrived without a wait
        self.poll_source(players, source);

        let mut applied = 0;
        let mut seen = Vec::with_capacity(players.len());
        for player in players.iter().filter(|p| p.is_active()) {
            if seen.contains(&&player.id) {
                continue;
            }
            seen.push(&player.id);
            if self.apply_to_slots(player, slots)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Training iteration of the model loaded for `player_id`, 0 if none.
    pub fn collect_train_iter(&self, player_id: &PlayerId) -> u64 {
        self.players
            .get(player_id)
            .and_then(|entry| entry.info.update_train_iter)
            .unwrap_or(0)
    }

    /// Bookkeeping for a player.
    pub fn info(&self, player_id: &PlayerId) -> Option<PlayerModelInfo> {
        self.players.get(player_id).map(|entry| entry.info)
    }

    /// Iteration of the snapshot waiting to be loaded, if any.
    pub fn pending_train_iter(&self, player_id: &PlayerId) -> Option<u64> {
        self.players
            .get(player_id)
            .and_then(|entry| entry.pending.as_ref())
            .map(|snapshot| snapshot.train_iter)
    }

    /// Weights currently loaded for a player, for policies created after
    /// the load.
    pub fn loaded_weights(&self, player_id: &PlayerId) -> Option<Arc<W>> {
        self.players
            .get(player_id)
            .and_then(|entry| entry.loaded.as_ref())
            .map(|snapshot| Arc::clone(&snapshot.weights))
    }

    /// Number of players seen so far.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}
