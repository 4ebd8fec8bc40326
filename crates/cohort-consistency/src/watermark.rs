//! Bounded memory of guids that are no longer held.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Number of guids remembered before old entries are evicted.
pub const DEFAULT_WATERMARK_LIMIT: usize = 100_000;

/// Entries younger than this survive eviction while the table is under its limit.
pub const DEFAULT_WATERMARK_RETENTION: Duration = Duration::from_secs(3600);

/// Last state known for a guid no longer held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Watermark {
    /// Removed at `version` by `home`. Events from `home` at or below it are stale.
    Version { home: String, version: u64 },
    /// Claimed by more than one other home. Copies are not cached until only
    /// one claimant is left.
    Contested { claimants: BTreeSet<String> },
}

#[derive(Debug)]
struct Entry {
    mark: Watermark,
    recorded: Instant,
}

/// Tombstones and reidentify attempts, evicted oldest first past a limit.
#[derive(Debug)]
pub(crate) struct Watermarks {
    entries: DashMap<String, Entry>,
    attempts: DashMap<String, Instant>,
    limit: usize,
    retention: Duration,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(DEFAULT_WATERMARK_LIMIT, DEFAULT_WATERMARK_RETENTION)
    }
}

impl Watermarks {
    pub(crate) fn new(limit: usize, retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            attempts: DashMap::new(),
            limit: limit.max(1),
            retention,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn attempts(&self) -> usize {
        self.attempts.len()
    }

    pub(crate) fn set(&self, guid: &str, mark: Watermark) {
        self.entries.insert(
            guid.to_string(),
            Entry {
                mark,
                recorded: Instant::now(),
            },
        );
        evict(&self.entries, |e| e.recorded, self.limit, self.retention);
    }

    pub(crate) fn clear(&self, guid: &str) {
        self.entries.remove(guid);
    }

    pub(crate) fn is_contested(&self, guid: &str) -> bool {
        matches!(
            self.entries.get(guid).map(|e| e.mark.clone()),
            Some(Watermark::Contested { .. })
        )
    }

    /// Returns true if an event from `home` at `version` is already
    /// superseded, or the guid is contested.
    pub(crate) fn is_stale(&self, guid: &str, home: &str, version: u64) -> bool {
        match self.entries.get(guid).map(|e| e.mark.clone()) {
            Some(Watermark::Version {
                home: removed_by,
                version: removed_at,
            }) => removed_by == home && version <= removed_at,
            Some(Watermark::Contested { .. }) => true,
            None => false,
        }
    }

    /// Adds `home` to the claimants of a contested guid. Returns false if the
    /// guid is not contested.
    pub(crate) fn join_contest(&self, guid: &str, home: &str) -> bool {
        match self.entries.get_mut(guid) {
            Some(mut entry) => match &mut entry.mark {
                Watermark::Contested { claimants } => {
                    claimants.insert(home.to_string());
                    true
                }
                Watermark::Version { .. } => false,
            },
            None => false,
        }
    }

    /// Marks `guid` as claimed by every home in `homes`. Returns true if the
    /// guid was not contested before.
    pub(crate) fn contest<'a>(
        &self,
        guid: &str,
        homes: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        let previous = self.entries.get(guid).map(|e| e.mark.clone());
        let (mut claimants, fresh) = match previous {
            Some(Watermark::Contested { claimants }) => (claimants, false),
            _ => (BTreeSet::new(), true),
        };
        claimants.extend(homes.into_iter().map(str::to_string));
        self.set(guid, Watermark::Contested { claimants });
        fresh
    }

    /// Records that `home` gave up `guid` at `version`. A contested guid with
    /// a single claimant left is released so that claimant's events apply.
    pub(crate) fn withdraw(&self, guid: &str, home: &str, version: u64) -> bool {
        let withdrawn = Watermark::Version {
            home: home.to_string(),
            version,
        };
        let previous = self.entries.get(guid).map(|e| e.mark.clone());
        match previous {
            Some(Watermark::Contested { mut claimants }) => {
                claimants.remove(home);
                if claimants.len() > 1 {
                    self.set(guid, Watermark::Contested { claimants });
                    false
                } else {
                    self.set(guid, withdrawn);
                    true
                }
            }
            _ => {
                self.set(guid, withdrawn);
                false
            }
        }
    }

    /// Records a reidentify attempt. Returns false if `key` was attempted
    /// already.
    pub(crate) fn first_attempt(&self, key: String) -> bool {
        if self.attempts.contains_key(&key) {
            return false;
        }
        self.attempts.insert(key, Instant::now());
        evict(&self.attempts, |at| *at, self.limit, self.retention);
        true
    }
}

/// Drops expired entries once `map` grows past `limit`, then the oldest
/// until a quarter of the limit is free.
fn evict<V>(
    map: &DashMap<String, V>,
    recorded: fn(&V) -> Instant,
    limit: usize,
    retention: Duration,
) {
    if map.len() <= limit {
        return;
    }
    map.retain(|_, v| recorded(v).elapsed() < retention);

    let target = limit - limit / 4;
    let excess = map.len().saturating_sub(target);
    if excess == 0 {
        return;
    }
    let mut ages: Vec<(Instant, String)> = map
        .iter()
        .map(|e| (recorded(e.value()), e.key().clone()))
        .collect();
    ages.sort_unstable();
    for (_, key) in ages.into_iter().take(excess) {
        map.remove(&key);
    }
    tracing::debug!(evicted = excess, remaining = map.len(), "watermarks evicted");
}
