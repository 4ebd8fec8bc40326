//! Per-key exclusive update discipline.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// A table of async mutexes keyed by string.
///
/// Writers to the same key are serialized; writers to different keys never
/// wait on each other. There is no table-wide lock. A key's mutex is freed
/// when its last holder releases it and nobody is waiting.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Arc<LockTable>,
}

/// Holds one or more keys until dropped.
#[derive(Debug)]
pub struct KeyGuard {
    table: Arc<LockTable>,
    held: Vec<(String, OwnedMutexGuard<()>)>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            // Only the table's reference is left once no one holds or waits.
            self.table
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

impl KeyedLocks {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &str) -> Arc<Mutex<()>> {
        // The shard guard is released before any await.
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let guard = self.mutex(key).lock_owned().await;
        KeyGuard {
            table: self.locks.clone(),
            held: vec![(key.to_string(), guard)],
        }
    }

    /// Waits for exclusive access to every key in `keys`.
    ///
    /// Keys are acquired in sorted order so two callers locking overlapping
    /// sets cannot deadlock.
    pub async fn lock_many(&self, keys: &[&str]) -> KeyGuard {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let guard = self.mutex(key).lock_owned().await;
            held.push((key.to_string(), guard));
        }
        KeyGuard {
            table: self.locks.clone(),
            held,
        }
    }

    /// Returns the number of keys with a mutex allocated.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no mutex is allocated.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
