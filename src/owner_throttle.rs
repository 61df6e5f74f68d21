// Owner Throttle Set: which logical owners already have scheduled work.
//
// Sticky mode never forgets an owner on its own; only `remove` clears it.
// RefCounted mode tracks outstanding items per owner and forgets the owner
// when the last one reaches a terminal state. Each entry carries the
// generation it was created in, so releases from items acquired before a
// `remove` cannot drain an entry created after it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleMode {
    #[default]
    Sticky,
    RefCounted,
}

#[derive(Debug)]
struct OwnerEntry {
    generation: u64,
    // outstanding items, only meaningful in RefCounted mode
    count: usize,
}

#[derive(Debug)]
pub struct OwnerThrottle {
    mode: ThrottleMode,
    owners: DashMap<String, OwnerEntry>,
    next_generation: AtomicU64,
}

impl OwnerThrottle {
    pub fn new(mode: ThrottleMode) -> Self {
        Self {
            mode,
            owners: DashMap::new(),
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ThrottleMode {
        self.mode
    }

    /// Called once per non-retry submission. Returns the generation of the
    /// owner's entry, which the matching `release` must hand back.
    pub fn acquire(&self, owner: &str) -> u64 {
        let mut entry = self
            .owners
            .entry(owner.to_string())
            .or_insert_with(|| OwnerEntry {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                count: 0,
            });
        entry.count += 1;
        entry.generation
    }

    // Called once per terminal transition; stale generations are ignored
    pub fn release(&self, owner: &str, generation: u64) {
        if self.mode == ThrottleMode::Sticky {
            return;
        }
        self.owners.remove_if_mut(owner, |_, entry| {
            if entry.generation != generation {
                return false;
            }
            entry.count = entry.count.saturating_sub(1);
            entry.count == 0
        });
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.owners.contains_key(owner)
    }

    pub fn remove(&self, owner: &str) -> bool {
        self.owners.remove(owner).is_some()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
