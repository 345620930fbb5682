//! `LruStrategy`: an in-memory, ordered index over live cache keys with
//! byte accounting, enforcing a byte budget via eviction callbacks.
//!
//! Grounded on the bounded in-memory cache idiom in `managers/moka.rs`,
//! generalized from an opaque `moka::Cache` to an explicit ordered index
//! since the spec requires observable eviction order (oldest
//! last-accessed evicted first, ties broken by lower created-epoch) that
//! `moka` does not expose as a public contract.

use std::collections::BTreeMap;

/// One live entry tracked by the LRU index.
#[derive(Debug, Clone, Copy)]
struct Entry {
    bytes: u64,
    last_accessed_epoch: i64,
    created_epoch: i64,
    /// Monotonic insertion/touch sequence, used to break ties between
    /// equal `last_accessed_epoch` values (insertion order, per §5).
    sequence: u64,
}

/// In-memory ordered index enforcing `max_bytes` via LRU eviction.
///
/// Not thread-safe on its own; `ResponseCache` guards it with a short
/// internal mutex per §5 ("a short internal mutex guards LRU index and
/// byte-counter; body-file writes do not hold this mutex").
pub struct LruStrategy {
    max_bytes: u64,
    current_bytes: u64,
    entries: std::collections::HashMap<String, Entry>,
    next_sequence: u64,
}

impl LruStrategy {
    pub fn new(max_bytes: u64) -> Self {
        LruStrategy {
            max_bytes,
            current_bytes: 0,
            entries: std::collections::HashMap::new(),
            next_sequence: 0,
        }
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// Rebuild the index from persisted metadata on startup (see
    /// `cache::metadata_store::enumerate`, already ordered oldest-first).
    pub fn rebuild<'a>(
        &mut self,
        rows: impl Iterator<Item = (&'a str, u64, i64, i64)>,
    ) {
        self.entries.clear();
        self.current_bytes = 0;
        for (key, bytes, last_accessed_epoch, created_epoch) in rows {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.entries.insert(
                key.to_string(),
                Entry { bytes, last_accessed_epoch, created_epoch, sequence },
            );
            self.current_bytes += bytes;
        }
    }

    /// Insert or replace `key`'s entry, returning the keys evicted to
    /// bring `current_bytes` back under `max_bytes`.
    pub fn insert(&mut self, key: &str, bytes: u64, now_epoch: i64) -> Vec<String> {
        if let Some(old) = self.entries.remove(key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.bytes);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            key.to_string(),
            Entry { bytes, last_accessed_epoch: now_epoch, created_epoch: now_epoch, sequence },
        );
        self.current_bytes += bytes;
        self.evict_to_budget()
    }

    /// Move `key` to MRU position and refresh its `last_accessed_epoch`,
    /// called on every `ResponseCache::lookup` hit.
    pub fn touch(&mut self, key: &str, now_epoch: i64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_accessed_epoch = now_epoch;
            entry.sequence = self.next_sequence;
            self.next_sequence += 1;
        }
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_bytes = self.current_bytes.saturating_sub(entry.bytes);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Evict least-recently-used entries (oldest `last_accessed_epoch`
    /// first, ties broken by lower `created_epoch`, further ties by
    /// insertion order) until `current_bytes <= max_bytes`.
    fn evict_to_budget(&mut self) -> Vec<String> {
        let mut evicted = Vec::new();
        if self.current_bytes <= self.max_bytes {
            return evicted;
        }
        // BTreeMap over (last_accessed, created, sequence) gives us the
        // eviction order directly without re-sorting on every call.
        let mut ordered: BTreeMap<(i64, i64, u64), String> = BTreeMap::new();
        for (key, entry) in &self.entries {
            ordered.insert(
                (entry.last_accessed_epoch, entry.created_epoch, entry.sequence),
                key.clone(),
            );
        }
        for key in ordered.into_values() {
            if self.current_bytes <= self.max_bytes {
                break;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.current_bytes = self.current_bytes.saturating_sub(entry.bytes);
                evicted.push(key);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_prefers_oldest_last_accessed() {
        let mut lru = LruStrategy::new(300);
        lru.insert("k1", 100, 1);
        lru.insert("k2", 100, 2);
        lru.insert("k3", 100, 3);
        let evicted = lru.insert("k4", 100, 4);
        assert_eq!(evicted, vec!["k1".to_string()]);
        assert!(!lru.contains("k1"));
        assert!(lru.contains("k2") && lru.contains("k3") && lru.contains("k4"));
    }

    #[test]
    fn touch_refreshes_mru_and_changes_eviction_order() {
        let mut lru = LruStrategy::new(300);
        lru.insert("k1", 100, 1);
        lru.insert("k2", 100, 2);
        lru.insert("k3", 100, 3);
        lru.touch("k1", 4);
        let evicted = lru.insert("k4", 100, 5);
        assert_eq!(evicted, vec!["k2".to_string()]);
    }

    #[test]
    fn ties_broken_by_lower_created_epoch() {
        let mut lru = LruStrategy::new(200);
        lru.insert("k1", 100, 5);
        lru.insert("k2", 100, 5);
        let evicted = lru.insert("k3", 100, 5);
        assert_eq!(evicted, vec!["k1".to_string()]);
    }

    #[test]
    fn remove_updates_byte_counter() {
        let mut lru = LruStrategy::new(300);
        lru.insert("k1", 100, 1);
        assert_eq!(lru.current_bytes(), 100);
        lru.remove("k1");
        assert_eq!(lru.current_bytes(), 0);
    }
}
