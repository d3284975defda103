//! Group messages waiting for their sender key.
//!
//! A decrypt that finds no sender key parks the message here under the
//! sender-key name. Storing that name later replays every parked message
//! in arrival order; a message that waits longer than the timeout is
//! removed and rejected with `QueueTimeout`.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{error::KeyStoreError, retry::SharedClock};

type Replay = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Pending {
    id: u64,
    enqueued_at: tokio::time::Instant,
    replay: Replay,
}

#[derive(Default)]
struct QueueState {
    waiting: HashMap<String, VecDeque<Pending>>,
    closed: bool,
}

#[derive(Clone)]
pub struct SenderKeyQueue {
    state: Arc<Mutex<QueueState>>,
    next_id: Arc<AtomicU64>,
    clock: SharedClock,
    timeout: Duration,
}

/// Handle to one parked message. Await [`QueuedMessage::wait`] for its result.
pub struct QueuedMessage<E> {
    name: String,
    id: u64,
    rx: oneshot::Receiver<Result<Vec<u8>, E>>,
    queue: SenderKeyQueue,
}

impl SenderKeyQueue {
    pub fn new(clock: SharedClock, timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            clock,
            timeout,
        }
    }

    /// Park `ciphertext` until `name` is stored. `decrypt` runs on replay.
    ///
    /// Registration happens before this returns, so callers can register
    /// while holding the sender-key lock and wait after releasing it.
    pub fn enqueue<F, Fut, E>(&self, name: &str, ciphertext: Vec<u8>, decrypt: F) -> QueuedMessage<E>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
        E: From<KeyStoreError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replay: Replay = Box::new(move || {
            Box::pin(async move {
                let result = decrypt(ciphertext).await;
                let _ = tx.send(result);
            })
        });

        let mut state = self.state.lock();
        if state.closed {
            // Dropping `replay` drops `tx`; the waiter sees QueueClosed.
            drop(replay);
        } else {
            state
                .waiting
                .entry(name.to_string())
                .or_default()
                .push_back(Pending {
                    id,
                    enqueued_at: self.clock.now(),
                    replay,
                });
            tracing::debug!(sender_key = %name, id, "queued group message awaiting sender key");
        }

        QueuedMessage {
            name: name.to_string(),
            id,
            rx,
            queue: self.clone(),
        }
    }

    /// Replay everything parked under `name`, FIFO, on a background task.
    pub fn notify_stored(&self, name: &str) {
        let Some(entries) = self.state.lock().waiting.remove(name) else {
            return;
        };
        let now = self.clock.now();
        tracing::debug!(sender_key = %name, count = entries.len(), "sender key stored; replaying queued messages");
        for entry in &entries {
            tracing::trace!(id = entry.id, waited_ms = (now - entry.enqueued_at).as_millis() as u64, "replaying");
        }
        tokio::spawn(async move {
            for entry in entries {
                (entry.replay)().await;
            }
        });
    }

    /// Remove a waiter; false if it was already taken for replay.
    fn remove(&self, name: &str, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(entries) = state.waiting.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|p| p.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            state.waiting.remove(name);
        }
        removed
    }

    pub fn pending(&self, name: &str) -> usize {
        self.state.lock().waiting.get(name).map_or(0, |q| q.len())
    }

    /// Reject everything parked and refuse new entries.
    pub fn close(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiting)
        };
        let count: usize = drained.values().map(|q| q.len()).sum();
        if count > 0 {
            tracing::info!(count, "sender key queue closed; rejecting queued messages");
        }
    }
}

impl<E> QueuedMessage<E>
where
    E: From<KeyStoreError>,
{
    pub async fn wait(self) -> Result<Vec<u8>, E> {
        let QueuedMessage {
            name,
            id,
            mut rx,
            queue,
        } = self;

        tokio::select! {
            result = &mut rx => {
                return result.unwrap_or_else(|_| Err(KeyStoreError::QueueClosed.into()));
            }
            _ = queue.clock.sleep(queue.timeout) => {}
        }

        if queue.remove(&name, id) {
            tracing::warn!(sender_key = %name, id, "queued group message timed out");
            return Err(KeyStoreError::QueueTimeout { name }.into());
        }
        // Already handed to a replay; its result is on the way.
        rx.await
            .unwrap_or_else(|_| Err(KeyStoreError::QueueClosed.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::TokioClock;

    fn queue(timeout_ms: u64) -> SenderKeyQueue {
        SenderKeyQueue::new(Arc::new(TokioClock), Duration::from_millis(timeout_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn replays_in_arrival_order() {
        let q = queue(30_000);
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3u8 {
            let order = order.clone();
            waiters.push(q.enqueue::<_, _, KeyStoreError>("g::a::1", vec![i], move |ct| async move {
                order.lock().push(ct[0]);
                Ok(ct)
            }));
        }
        assert_eq!(q.pending("g::a::1"), 3);
        q.notify_stored("g::a::1");
        for (i, w) in waiters.into_iter().enumerate() {
            assert_eq!(w.wait().await.unwrap(), vec![i as u8]);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(q.pending("g::a::1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_is_removed() {
        let q = queue(1_000);
        let w = q.enqueue::<_, _, KeyStoreError>("g::a::1", vec![1], |ct| async move { Ok(ct) });
        let err = w.wait().await.unwrap_err();
        assert!(matches!(err, KeyStoreError::QueueTimeout { ref name } if name == "g::a::1"));
        assert_eq!(q.pending("g::a::1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_error_is_propagated() {
        let q = queue(1_000);
        let w = q.enqueue::<_, _, KeyStoreError>("g::a::1", vec![1], |_| async move {
            Err(KeyStoreError::Backend("still no key".into()))
        });
        q.notify_stored("g::a::1");
        assert!(matches!(w.wait().await, Err(KeyStoreError::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_waiters() {
        let q = queue(30_000);
        let w = q.enqueue::<_, _, KeyStoreError>("g::a::1", vec![1], |ct| async move { Ok(ct) });
        q.close();
        assert!(matches!(w.wait().await, Err(KeyStoreError::QueueClosed)));
        let late = q.enqueue::<_, _, KeyStoreError>("g::a::1", vec![2], |ct| async move { Ok(ct) });
        assert!(matches!(late.wait().await, Err(KeyStoreError::QueueClosed)));
    }
}
