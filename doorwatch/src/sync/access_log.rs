//! Bounded access history.
//!
//! Entries are kept newest-first, unique by `LogKey`, and never more than
//! `capacity` of them. Each slot remembers the `Stamp` of the write that
//! installed it, so a snapshot requested before a push arrived cannot
//! erase the pushed entry.

use super::Stamp;
use crate::model::{AccessLogEntry, LogKey};

use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Slot {
    entry: AccessLogEntry,
    stamp: Stamp,
}

#[derive(Debug, Clone)]
pub struct AccessLog {
    slots: Vec<Slot>,
    capacity: usize,
}

/// Newest timestamp first; among equal timestamps the latest write first.
fn newest_first(a: &Slot, b: &Slot) -> Ordering {
    b.entry
        .timestamp
        .cmp(&a.entry.timestamp)
        .then(b.stamp.cmp(&a.stamp))
        .then_with(|| a.entry.key().cmp(&b.entry.key()))
}

impl AccessLog {
    pub fn new(capacity: usize) -> AccessLog {
        AccessLog {
            slots: Vec::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessLogEntry> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn newest(&self) -> Option<&AccessLogEntry> {
        self.slots.first().map(|s| &s.entry)
    }

    pub fn granted_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.granted).count()
    }

    pub fn contains(&self, key: &LogKey) -> bool {
        self.slots.iter().any(|s| s.entry.key() == *key)
    }

    /// Inserts a single entry, replacing one with the same key.
    /// Returns false if an identical entry is already present, or if the
    /// entry fell off the end (older than everything in a full log).
    pub fn insert(&mut self, entry: AccessLogEntry, stamp: Stamp) -> bool {
        let key = entry.key();
        if self.slots.iter().any(|s| s.entry == entry) {
            return false;
        }
        self.slots.retain(|s| s.entry.key() != key);
        let slot = Slot { entry, stamp };
        let pos = self
            .slots
            .binary_search_by(|probe| newest_first(probe, &slot))
            .unwrap_or_else(|p| p);
        if pos >= self.capacity {
            return false;
        }
        self.slots.insert(pos, slot);
        self.slots.truncate(self.capacity);
        true
    }

    /// Replaces the contents with a fetched batch. Entries written after
    /// `as_of` (the moment the batch was requested) are newer than the
    /// batch and survive it, winning over a batch entry with the same key.
    pub fn apply_snapshot(&mut self, batch: Vec<AccessLogEntry>, as_of: Stamp, stamp: Stamp) {
        let mut merged: HashMap<LogKey, Slot> = HashMap::with_capacity(batch.len());
        for entry in batch {
            merged.insert(entry.key(), Slot { entry, stamp });
        }
        for slot in self.slots.drain(..) {
            if slot.stamp > as_of {
                merged.insert(slot.entry.key(), slot);
            }
        }
        let mut slots: Vec<Slot> = merged.into_values().collect();
        slots.sort_by(newest_first);
        slots.truncate(self.capacity);
        self.slots = slots;
    }

    pub fn to_vec(&self) -> Vec<AccessLogEntry> {
        self.iter().cloned().collect()
    }
}
