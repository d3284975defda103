//! Byte-bounded LRU with per-entry TTL.
//!
//! Fronts the identity-mapping and token namespaces. Entries are sized as
//! `key.len() + value.len()`; once the total exceeds the budget the least
//! recently used entries are evicted. Expired entries are dropped lazily on
//! access.
//!
//! Every removal bumps an epoch. Readers that fill the cache from the store
//! capture the epoch before the read and fill through [`TtlCache::put_if_unchanged`],
//! so a value read before a concurrent remap cannot land after its
//! invalidation.

use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use dl_keystore::SharedClock;

use crate::config::MappingCacheConfig;

struct Entry {
    value: String,
    inserted_at: Instant,
}

struct State {
    entries: LruCache<String, Entry>,
    bytes: usize,
    epoch: u64,
}

impl State {
    fn pop(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.bytes -= entry_size(key, &entry.value);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, key: String, value: String, now: Instant, max_bytes: usize) {
        let size = entry_size(&key, &value);
        if size > max_bytes {
            // Would evict everything else and still not fit.
            self.pop(&key);
            return;
        }
        if let Some(old) = self.entries.put(key.clone(), Entry { value, inserted_at: now }) {
            self.bytes -= entry_size(&key, &old.value);
        }
        self.bytes += size;

        while self.bytes > max_bytes {
            match self.entries.pop_lru() {
                Some((k, evicted)) => self.bytes -= entry_size(&k, &evicted.value),
                None => break,
            }
        }
    }
}

/// Clones share the same entries.
#[derive(Clone)]
pub struct TtlCache {
    state: Arc<Mutex<State>>,
    ttl: Duration,
    max_bytes: usize,
    clock: SharedClock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

impl TtlCache {
    pub fn new(config: &MappingCacheConfig, clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                entries: LruCache::unbounded(),
                bytes: 0,
                epoch: 0,
            })),
            ttl: config.ttl(),
            max_bytes: config.max_bytes,
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.pop(key);
        }
        None
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        let now = self.clock.now();
        self.state.lock().insert(key.into(), value.into(), now, self.max_bytes);
    }

    /// Current invalidation epoch. Capture it before reading the backing
    /// store and hand it to [`Self::put_if_unchanged`].
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Insert only if nothing was invalidated since `epoch` was captured.
    /// Returns whether the entry was stored.
    pub fn put_if_unchanged(&self, epoch: u64, key: impl Into<String>, value: impl Into<String>) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }
        state.insert(key.into(), value.into(), now, self.max_bytes);
        true
    }

    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        state.pop(key);
        state.epoch += 1;
    }

    /// Drop every listed key under one epoch bump.
    pub fn invalidate<S: AsRef<str>>(&self, keys: &[S]) {
        let mut state = self.state.lock();
        for key in keys {
            state.pop(key.as_ref());
        }
        state.epoch += 1;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
        state.epoch += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            max_bytes: self.max_bytes,
        }
    }
}
