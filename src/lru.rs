use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Fixed-capacity cache from value string form to node id, shared between
/// readers and the writer under a single lock.
#[derive(Debug)]
pub struct ValueCache {
    inner: Mutex<LruCache<String, u64>>,
}

impl ValueCache {
    pub fn new(capacity: usize) -> ValueCache {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).expect("nonzero"));
        ValueCache {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// On hit, promotes the entry to most recently used.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.inner.lock().get(key).copied()
    }

    /// Evicts the least recently used entry when full.
    pub fn put(&self, key: impl Into<String>, id: u64) {
        self.inner.lock().put(key.into(), id);
    }

    pub fn del(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    /// Drops every entry. Used when a failed write transaction may have
    /// cached ids that were never committed.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
