// Dedup Gate: short-lived membership cache used to collapse repeated upstream
// trigger events (the same push notification arriving twice within a few ms)
// before they ever turn into scheduled work.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::Instant;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupStats {
    pub first_seen: usize,
    pub duplicates: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { ttl_ms: 10 }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

pub struct DedupGate {
    // key -> expiry
    store: DashMap<String, Instant>,
    expiry_index: Arc<RwLock<BTreeMap<Instant, HashSet<String>>>>,
    stats: Arc<RwLock<DedupStats>>,
    ttl: Duration,
}

impl DedupGate {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            store: DashMap::new(),
            expiry_index: Arc::new(RwLock::new(BTreeMap::new())),
            stats: Arc::new(RwLock::new(DedupStats::default())),
            ttl: config.ttl(),
        }
    }

    /// Returns `true` when `key` was already marked and has not expired; the
    /// existing entry is left untouched. Otherwise marks `key` with a fresh
    /// time-to-live and returns `false`.
    pub fn check_and_mark(&self, key: &str) -> bool {
        let now = Instant::now();
        self.sweep_expired(now);

        let expires_at = now + self.ttl;
        match self.store.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() > now {
                    self.stats.write().duplicates += 1;
                    return true;
                }
                e.insert(expires_at);
            }
            Entry::Vacant(e) => {
                e.insert(expires_at);
            }
        }

        self.expiry_index
            .write()
            .entry(expires_at)
            .or_default()
            .insert(key.to_string());
        self.stats.write().first_seen += 1;

        false
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn stats(&self) -> DedupStats {
        self.stats.read().clone()
    }

    fn sweep_expired(&self, now: Instant) {
        loop {
            let due = match self.expiry_index.read().first_key_value() {
                Some((at, _)) => *at <= now,
                None => break,
            };
            if !due {
                break;
            }

            // index lock is released before the store is touched
            let popped = self.expiry_index.write().pop_first();
            let Some((at, keys)) = popped else { break };

            for key in keys {
                // the key may have been re-marked with a later expiry since
                if self.store.remove_if(&key, |_, exp| *exp <= at).is_some() {
                    self.stats.write().expired += 1;
                }
            }
        }
    }
}

impl Default for DedupGate {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
