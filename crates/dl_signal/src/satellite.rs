//! Collaborators outside the session layer proper: a short-lived cache of
//! sent messages for retry requests, and delivery-receipt tracking.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use dl_keystore::SharedClock;
use dl_proto::{Address, Jid};

use crate::config::OutboundCacheConfig;

pub trait OutboundMessageCache: Send + Sync {
    fn put(&self, chat: &Jid, id: &str, message: Vec<u8>);
    fn get(&self, chat: &Jid, id: &str) -> Option<Vec<u8>>;
    fn clear(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckProgress {
    /// Message is not being tracked.
    Unknown,
    Pending { remaining: usize },
    Complete,
}

pub trait ReceiptTracker: Send + Sync {
    fn start_tracking(&self, message_id: &str, targets: &[Address]);
    fn mark_acknowledged(&self, message_id: &str, device: &Address) -> AckProgress;
    fn clear(&self);
}

// ── Outbound cache ───────────────────────────────────────────────────────────

pub struct MemoryOutboundCache {
    entries: Mutex<LruCache<(Jid, String), (Instant, Vec<u8>)>>,
    ttl: Duration,
    clock: SharedClock,
}

impl MemoryOutboundCache {
    pub fn new(config: &OutboundCacheConfig, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: config.ttl(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboundMessageCache for MemoryOutboundCache {
    fn put(&self, chat: &Jid, id: &str, message: Vec<u8>) {
        let now = self.clock.now();
        self.entries.lock().put((chat.bare(), id.to_string()), (now, message));
    }

    fn get(&self, chat: &Jid, id: &str) -> Option<Vec<u8>> {
        let key = (chat.bare(), id.to_string());
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(&key)
            .map(|(stored_at, message)| (now.duration_since(*stored_at) < self.ttl, message.clone()));
        match fresh {
            Some((true, message)) => Some(message),
            Some((false, _)) => {
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

// ── Receipts ─────────────────────────────────────────────────────────────────

struct Tracked {
    waiting: HashSet<Address>,
    started_at: Instant,
}

pub struct MemoryReceiptTracker {
    tracked: Mutex<HashMap<String, Tracked>>,
    clock: SharedClock,
}

impl MemoryReceiptTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn pending(&self, message_id: &str) -> Vec<Address> {
        let tracked = self.tracked.lock();
        let mut waiting: Vec<Address> = tracked
            .get(message_id)
            .map(|t| t.waiting.iter().cloned().collect())
            .unwrap_or_default();
        waiting.sort();
        waiting
    }

    /// Remove and return messages still missing receipts after `timeout`,
    /// with the devices that never acknowledged.
    pub fn take_expired(&self, timeout: Duration) -> Vec<(String, Vec<Address>)> {
        let now = self.clock.now();
        let mut tracked = self.tracked.lock();
        let expired: Vec<String> = tracked
            .iter()
            .filter(|(_, t)| now.duration_since(t.started_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let mut out: Vec<(String, Vec<Address>)> = expired
            .into_iter()
            .filter_map(|id| {
                tracked.remove(&id).map(|t| {
                    let mut devices: Vec<Address> = t.waiting.into_iter().collect();
                    devices.sort();
                    (id, devices)
                })
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl ReceiptTracker for MemoryReceiptTracker {
    fn start_tracking(&self, message_id: &str, targets: &[Address]) {
        if targets.is_empty() {
            return;
        }
        self.tracked.lock().insert(
            message_id.to_string(),
            Tracked {
                waiting: targets.iter().cloned().collect(),
                started_at: self.clock.now(),
            },
        );
    }

    fn mark_acknowledged(&self, message_id: &str, device: &Address) -> AckProgress {
        let mut tracked = self.tracked.lock();
        let Some(entry) = tracked.get_mut(message_id) else {
            return AckProgress::Unknown;
        };
        entry.waiting.remove(device);
        if entry.waiting.is_empty() {
            tracked.remove(message_id);
            AckProgress::Complete
        } else {
            AckProgress::Pending {
                remaining: entry.waiting.len(),
            }
        }
    }

    fn clear(&self) {
        self.tracked.lock().clear();
    }
}
