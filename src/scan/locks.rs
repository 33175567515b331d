//! Per-key async mutual exclusion.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Hands out one async mutex per key. Entries are dropped once nobody holds or waits on
/// them, so the map only ever contains keys that are in flight.
#[derive(Debug)]
pub struct KeyedLocks<K: Eq + Hash + Clone> {
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = self.slots.entry(key.clone()).or_default().clone();
        let guard = slot.lock_owned().await;

        KeyGuard {
            guard: Some(guard),
            key,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Keys currently locked or awaited.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }
}

pub struct KeyGuard<K: Eq + Hash + Clone> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // release our Arc first so an idle slot has exactly one owner: the map
        drop(self.guard.take());
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
