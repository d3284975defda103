//! Named async locks (sender-key names, session addresses).
//!
//! Entries are created on demand and dropped once nobody holds or waits
//! for them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone, Default)]
pub struct NamedLocks {
    locks: LockMap,
}

pub struct NamedGuard {
    name: String,
    locks: LockMap,
    mutex: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for NamedGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees the map and `self.mutex`.
        self.guard.take();
        let mut locks = self.locks.lock();
        if Arc::strong_count(&self.mutex) == 2 {
            locks.remove(&self.name);
        }
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> NamedGuard {
        let mutex = self
            .locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = mutex.clone().lock_owned().await;
        NamedGuard {
            name: name.to_string(),
            locks: self.locks.clone(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Lock several names in sorted order, skipping duplicates.
    pub async fn lock_all(&self, names: &[String]) -> Vec<NamedGuard> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            guards.push(self.lock(name).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
