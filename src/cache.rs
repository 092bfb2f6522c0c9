/// Time-bounded in-memory caches

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Default lifetime of cached entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

struct CacheEntry<V> {
    value: Arc<V>,
    stored_at: Instant,
}

/// A TTL-expiring key/value map with O(1) get/set/delete.
///
/// Reads hand out shared references instead of clones. Expired entries are
/// evicted passively at lookup time; there is no background sweeper and no
/// persistence. Entries must always be recomputable from durable state.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> TtlCache<V> {
    /// Create a cache with a custom entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a key, evicting it first if it has expired.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(Arc::clone(&entry.value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert or replace a value, resetting its lifetime.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.into(),
            CacheEntry {
                value: Arc::new(value),
                stored_at: Instant::now(),
            },
        );
    }

    /// Delete a key. Returns true if an entry was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Number of entries currently held, including not-yet-evicted expired
    /// ones.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
