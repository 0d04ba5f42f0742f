//! In-memory key-value store
//!
//! Values are immutable [`Bytes`]. A `set` swaps in a whole new value under
//! the key's shard lock, so readers see either the old or the new value and
//! never a mix. A `get` hands out another reference to the current value; a
//! later `set` replaces the map entry without touching bytes already handed
//! out.

use bytes::Bytes;
use dashmap::DashMap;

/// Server-side map from key to value
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<Bytes, Bytes>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value for `key`
    pub fn set(&self, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `key`, returning whether it existed
    pub fn delete(&self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for entry in self.entries.iter() {
            stats.entries += 1;
            stats.key_bytes += entry.key().len();
            stats.value_bytes += entry.value().len();
        }
        stats
    }
}

/// Store statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub key_bytes: usize,
    pub value_bytes: usize,
}
