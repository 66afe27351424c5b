//! Per-player model distribution channel between learners and actors.
//!
//! Learners publish weight snapshots keyed by player id and training
//! iteration; actors fetch them before collecting. Each player has a single
//! pending slot with swap semantics: a newer snapshot overwrites an untaken
//! older one, so stale weights never accumulate.
//!
//! ```text
//! Memory invariant: pending snapshots per player <= 1
//! Ordering invariant: accepted train_iter strictly increases per player
//! ```

use crate::core::player::PlayerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Immutable published weights for one player.
///
/// Weights sit behind an `Arc` so re-delivery and peeking never copy the
/// (potentially large) blob.
#[derive(Debug)]
pub struct ModelSnapshot<W> {
    /// Player the weights belong to
    pub player_id: PlayerId,
    /// Model weights
    pub weights: Arc<W>,
    /// Learner training iteration that produced the weights
    pub train_iter: u64,
}

impl<W> ModelSnapshot<W> {
    /// Create a snapshot.
    pub fn new(player_id: PlayerId, weights: W, train_iter: u64) -> Self {
        Self {
            player_id,
            weights: Arc::new(weights),
            train_iter,
        }
    }
}

impl<W> Clone for ModelSnapshot<W> {
    fn clone(&self) -> Self {
        Self {
            player_id: self.player_id.clone(),
            weights: Arc::clone(&self.weights),
            train_iter: self.train_iter,
        }
    }
}

/// Anything an actor can pull fresh snapshots from.
pub trait ModelSource<W> {
    /// Take the pending snapshot for `player_id`, if any.
    fn fetch(&self, player_id: &PlayerId) -> Option<ModelSnapshot<W>>;
}

impl<W, T: ModelSource<W> + ?Sized> ModelSource<W> for Arc<T> {
    fn fetch(&self, player_id: &PlayerId) -> Option<ModelSnapshot<W>> {
        (**self).fetch(player_id)
    }
}

/// Source that never has anything to offer.
///
/// Used when a collector runs on whatever weights its policies start with.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModelSource;

impl<W> ModelSource<W> for NoModelSource {
    fn fetch(&self, _player_id: &PlayerId) -> Option<ModelSnapshot<W>> {
        None
    }
}

struct PlayerSlot<W> {
    pending: Option<ModelSnapshot<W>>,
    /// Highest iteration ever accepted for this player
    latest_train_iter: Option<u64>,
}

/// In-process model distribution channel.
pub struct ModelStore<W> {
    slots: Mutex<HashMap<PlayerId, PlayerSlot<W>>>,
    /// Snapshots accepted
    published_count: AtomicUsize,
    /// Snapshots overwritten before being taken
    dropped_count: AtomicUsize,
    /// Snapshots handed to actors
    taken_count: AtomicUsize,
    /// Re-deliveries rejected because their iteration was not newer
    ignored_count: AtomicUsize,
}

impl<W> ModelStore<W> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            published_count: AtomicUsize::new(0),
            dropped_count: AtomicUsize::new(0),
            taken_count: AtomicUsize::new(0),
            ignored_count: AtomicUsize::new(0),
        }
    }

    /// Publish weights for a player.
    ///
    /// Returns `false` (and changes nothing) when `train_iter` is not newer
    /// than the latest iteration already published for the player, so a
    /// re-delivered snapshot can never roll a player back.
    pub fn publish(&self, player_id: PlayerId, weights: W, train_iter: u64) -> bool {
        self.publish_snapshot(ModelSnapshot::new(player_id, weights, train_iter))
    }

    /// Publish a prepared snapshot. Same acceptance rule as `publish`.
    pub fn publish_snapshot(&self, snapshot: ModelSnapshot<W>) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(snapshot.player_id.clone())
            .or_insert_with(|| PlayerSlot {
                pending: None,
                latest_train_iter: None,
            });

        if slot
            .latest_train_iter
            .is_some_and(|latest| snapshot.train_iter <= latest)
        {
            self.ignored_count.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if slot.pending.is_some() {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
        }
        slot.latest_train_iter = Some(snapshot.train_iter);
        slot.pending = Some(snapshot);
        self.published_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the pending snapshot for a player, leaving the slot empty.
    pub fn take(&self, player_id: &PlayerId) -> Option<ModelSnapshot<W>> {
        let snapshot = self
            .slots
            .lock()
            .get_mut(player_id)
            .and_then(|slot| slot.pending.take());
        if snapshot.is_some() {
            self.taken_count.fetch_add(1, Ordering::Relaxed);
        }
        snapshot
    }

    /// Clone the pending snapshot without consuming it.
    pub fn peek(&self, player_id: &PlayerId) -> Option<ModelSnapshot<W>> {
        self.slots
            .lock()
            .get(player_id)
            .and_then(|slot| slot.pending.clone())
    }

    /// Check whether a snapshot is waiting for the player.
    pub fn has_pending(&self, player_id: &PlayerId) -> bool {
        self.slots
            .lock()
            .get(player_id)
            .is_some_and(|slot| slot.pending.is_some())
    }

    /// Latest accepted iteration for the player.
    pub fn latest_train_iter(&self, player_id: &PlayerId) -> Option<u64> {
        self.slots
            .lock()
            .get(player_id)
            .and_then(|slot| slot.latest_train_iter)
    }

    /// Debug statistics: (published, dropped, taken, ignored)
    pub fn stats(&self) -> (usize, usize, usize, usize) {
        (
            self.published_count.load(Ordering::Relaxed),
            self.dropped_count.load(Ordering::Relaxed),
            self.taken_count.load(Ordering::Relaxed),
            self.ignored_count.load(Ordering::Relaxed),
        )
    }
}

impl<W> Default for ModelStore<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ModelSource<W> for ModelStore<W> {
    fn fetch(&self, player_id: &PlayerId) -> Option<ModelSnapshot<W>> {
        self.take(player_id)
    }
}

/// Thread-safe shared model store.
pub type SharedModelStore<W> = Arc<ModelStore<W>>;

/// Create a new shared model store.
pub fn model_store<W>() -> SharedModelStore<W> {
    Arc::new(ModelStore::new())
}
