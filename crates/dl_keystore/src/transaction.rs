//! Transactional key store.
//!
//! Reads and writes go through `KeyStore`. Inside `transaction(..)` they
//! hit a stack of frames held in a task-local context:
//!
//!   frame = { cache: kind → id → value|absent, mutations, query count }
//!
//! Reads consult the frames innermost first and fall through to the
//! backing store on a miss (one fetch per batch, cached afterwards).
//! Writes land in the innermost frame. A nested frame that succeeds is
//! folded into its parent; a failed one is discarded. Only the outermost
//! frame commits.
//!
//! Commit takes one lock per touched key kind, in `KeyKind` order, and
//! calls the store once per attempt under a bounded retry policy.
//! Hooks registered with `after_commit` travel with their frame and run
//! once the outermost frame has been persisted.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    config::KeyStoreConfig,
    error::KeyStoreError,
    kind::{KeyKind, KeyValues, MutationSet},
    locks::NamedLocks,
    retry::{RetryPolicy, SharedClock, TokioClock},
    sender_queue::{QueuedMessage, SenderKeyQueue},
    store::SignalStore,
};

static NEXT_STORE_ID: AtomicUsize = AtomicUsize::new(1);

tokio::task_local! {
    static ACTIVE: Arc<TxnContext>;
}

type CommitHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Frame {
    cache: HashMap<KeyKind, HashMap<String, Option<Vec<u8>>>>,
    mutations: MutationSet,
    queries: usize,
    after_commit: Vec<CommitHook>,
}

impl Frame {
    fn absorb(&mut self, child: Frame) {
        for (kind, ids) in child.cache {
            self.cache.entry(kind).or_default().extend(ids);
        }
        self.mutations.merge(child.mutations);
        self.queries += child.queries;
        self.after_commit.extend(child.after_commit);
    }
}

struct TxnContext {
    store_id: usize,
    frames: Mutex<Vec<Frame>>,
}

/// `Some(None)` means known absent.
fn lookup(frames: &[Frame], kind: KeyKind, id: &str) -> Option<Option<Vec<u8>>> {
    frames
        .iter()
        .rev()
        .find_map(|frame| frame.cache.get(&kind)?.get(id).cloned())
}

struct Inner {
    id: usize,
    store: Arc<dyn SignalStore>,
    kind_locks: BTreeMap<KeyKind, AsyncMutex<()>>,
    admission: AsyncMutex<()>,
    sender_key_locks: NamedLocks,
    session_locks: NamedLocks,
    queue: SenderKeyQueue,
    retry: RetryPolicy,
    clock: SharedClock,
}

/// Cheap to clone; clones share locks, queue and backing store.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<Inner>,
}

impl KeyStore {
    pub fn new(store: Arc<dyn SignalStore>, config: &KeyStoreConfig) -> Self {
        Self::with_clock(store, config, Arc::new(TokioClock))
    }

    pub fn with_clock(store: Arc<dyn SignalStore>, config: &KeyStoreConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
                store,
                kind_locks: KeyKind::ALL
                    .into_iter()
                    .map(|k| (k, AsyncMutex::new(())))
                    .collect(),
                admission: AsyncMutex::new(()),
                sender_key_locks: NamedLocks::new(),
                session_locks: NamedLocks::new(),
                queue: SenderKeyQueue::new(clock.clone(), config.queue_timeout()),
                retry: config.retry_policy(),
                clock,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn SignalStore> {
        &self.inner.store
    }

    fn context(&self) -> Option<Arc<TxnContext>> {
        ACTIVE
            .try_with(|ctx| ctx.clone())
            .ok()
            .filter(|ctx| ctx.store_id == self.inner.id)
    }

    pub fn is_in_transaction(&self) -> bool {
        self.context().is_some()
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<KeyValues, KeyStoreError> {
        let Some(ctx) = self.context() else {
            return self.inner.store.get(kind, ids).await;
        };

        let mut out = KeyValues::with_capacity(ids.len());
        let mut missing: Vec<String> = Vec::new();
        {
            let frames = ctx.frames.lock();
            for id in ids {
                match lookup(&frames, kind, id) {
                    Some(Some(value)) => {
                        out.insert(id.clone(), value);
                    }
                    Some(None) => {}
                    None if !missing.contains(id) => missing.push(id.clone()),
                    None => {}
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        let fetched = self.inner.store.get(kind, &missing).await?;
        tracing::trace!(kind = %kind, fetched = missing.len(), "transaction cache miss");

        let mut frames = ctx.frames.lock();
        if let Some(frame) = frames.last_mut() {
            frame.queries += 1;
            let cache = frame.cache.entry(kind).or_default();
            for id in missing {
                let fetched_value = fetched.get(&id).cloned();
                // A write made while the fetch was in flight wins.
                if let Some(value) = cache.entry(id.clone()).or_insert(fetched_value) {
                    out.insert(id, value.clone());
                }
            }
        }
        Ok(out)
    }

    pub async fn get_one(&self, kind: KeyKind, id: &str) -> Result<Option<Vec<u8>>, KeyStoreError> {
        let id = id.to_string();
        Ok(self.get(kind, std::slice::from_ref(&id)).await?.remove(&id))
    }

    // ── Writes ───────────────────────────────────────────────────────────

    /// Inside a transaction the mutations are staged in the innermost
    /// frame; outside they are committed immediately.
    pub async fn set(&self, mutations: MutationSet) -> Result<(), KeyStoreError> {
        let mutations = self.drop_unknown_pre_key_deletions(mutations).await?;
        if mutations.is_empty() {
            return Ok(());
        }

        match self.context() {
            Some(ctx) => {
                let mut frames = ctx.frames.lock();
                if let Some(frame) = frames.last_mut() {
                    for (kind, id, value) in mutations.iter() {
                        frame
                            .cache
                            .entry(kind)
                            .or_default()
                            .insert(id.clone(), value.clone());
                    }
                    frame.mutations.merge(mutations);
                }
                Ok(())
            }
            None => self.commit(mutations).await,
        }
    }

    /// Run `hook` once the current transaction has been persisted. Outside
    /// a transaction it runs immediately. Hooks of a failed frame are
    /// dropped with it.
    pub fn after_commit(&self, hook: impl FnOnce() + Send + 'static) {
        let Some(ctx) = self.context() else {
            hook();
            return;
        };
        let mut frames = ctx.frames.lock();
        match frames.last_mut() {
            Some(frame) => frame.after_commit.push(Box::new(hook)),
            None => {
                drop(frames);
                hook();
            }
        }
    }

    /// Pre-key tombstones are honoured only for keys known to exist.
    async fn drop_unknown_pre_key_deletions(
        &self,
        mut mutations: MutationSet,
    ) -> Result<MutationSet, KeyStoreError> {
        for kind in KeyKind::ALL.into_iter().filter(|kind| kind.is_pre_key()) {
            let doomed: Vec<String> = mutations
                .entries(kind)
                .filter(|(_, value)| value.is_none())
                .map(|(id, _)| id.clone())
                .collect();
            if doomed.is_empty() {
                continue;
            }
            let existing = self.get(kind, &doomed).await?;
            for id in doomed.iter().filter(|id| !existing.contains_key(*id)) {
                tracing::warn!(kind = %kind, id = %id, "ignoring deletion of unknown pre-key");
                mutations.remove(kind, id);
            }
        }
        Ok(mutations)
    }

    async fn commit(&self, mutations: MutationSet) -> Result<(), KeyStoreError> {
        let policy = self.inner.retry;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = {
                let mut guards = Vec::new();
                for kind in mutations.kinds() {
                    if let Some(lock) = self.inner.kind_locks.get(&kind) {
                        guards.push(lock.lock().await);
                    }
                }
                self.inner.store.set(&mutations).await
            };

            match result {
                Ok(()) => break,
                Err(err) => match policy.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            attempt,
                            max_attempts = policy.max_attempts,
                            error = %err,
                            "commit failed; retrying"
                        );
                        self.inner.clock.sleep(delay).await;
                    }
                    None => {
                        tracing::error!(attempts = attempt, error = %err, "commit retries exhausted");
                        return Err(KeyStoreError::CommitExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                },
            }
        }

        tracing::debug!(mutations = mutations.len(), attempt, "committed key store mutations");
        for (name, value) in mutations.entries(KeyKind::SenderKey) {
            if value.is_some() {
                self.inner.queue.notify_stored(name);
            }
        }
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────────

    /// Run `work` in a transaction. Nested calls push a frame onto the
    /// caller's transaction instead of opening a new one.
    ///
    /// If `work` fails nothing it wrote is persisted; if the outermost
    /// commit exhausts its retries the error is `CommitExhausted`.
    pub async fn transaction<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<KeyStoreError>,
    {
        if let Some(ctx) = self.context() {
            ctx.frames.lock().push(Frame::default());
            let result = work().await;
            let frame = ctx.frames.lock().pop();
            return match result {
                Ok(value) => {
                    let mut frames = ctx.frames.lock();
                    if let (Some(frame), Some(parent)) = (frame, frames.last_mut()) {
                        parent.absorb(frame);
                    }
                    Ok(value)
                }
                Err(err) => {
                    tracing::debug!("nested transaction failed; discarding its frame");
                    Err(err)
                }
            };
        }

        let ctx = {
            let _admission = self.inner.admission.lock().await;
            Arc::new(TxnContext {
                store_id: self.inner.id,
                frames: Mutex::new(vec![Frame::default()]),
            })
        };

        let result = ACTIVE.scope(ctx.clone(), async move { work().await }).await;
        let root = ctx.frames.lock().pop().unwrap_or_default();
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(staged = root.mutations.len(), "transaction failed; discarding mutations");
                return Err(err);
            }
        };

        let Frame {
            mutations,
            queries,
            after_commit,
            ..
        } = root;
        if !mutations.is_empty() {
            self.commit(mutations).await?;
        }
        for hook in after_commit {
            hook();
        }
        tracing::trace!(queries, "transaction finished");
        Ok(value)
    }

    // ── Named locks ──────────────────────────────────────────────────────

    /// Serialize all work on one sender-key name.
    pub async fn with_sender_key_lock<T, F, Fut>(&self, name: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.sender_key_locks.lock(name).await;
        work().await
    }

    /// Serialize read-modify-write of the session records at `addresses`.
    /// Locks are taken in sorted order.
    pub async fn with_session_locks<T, F, Fut>(&self, addresses: &[String], work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guards = self.inner.session_locks.lock_all(addresses).await;
        work().await
    }

    // ── Sender-key queue ─────────────────────────────────────────────────

    /// Park a group message until `sender_key_name` is stored. The entry is
    /// registered before this returns; await the handle for the result.
    pub fn enqueue_group_message<F, Fut, E>(
        &self,
        sender_key_name: &str,
        ciphertext: Vec<u8>,
        decrypt: F,
    ) -> QueuedMessage<E>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
        E: From<KeyStoreError> + Send + 'static,
    {
        self.inner.queue.enqueue(sender_key_name, ciphertext, decrypt)
    }

    pub async fn queue_group_message<F, Fut, E>(
        &self,
        sender_key_name: &str,
        ciphertext: Vec<u8>,
        decrypt: F,
    ) -> Result<Vec<u8>, E>
    where
        F: FnOnce(Vec<u8>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send + 'static,
        E: From<KeyStoreError> + Send + 'static,
    {
        self.enqueue_group_message(sender_key_name, ciphertext, decrypt)
            .wait()
            .await
    }

    pub fn pending_group_messages(&self, sender_key_name: &str) -> usize {
        self.inner.queue.pending(sender_key_name)
    }

    /// Reject queued group messages with `QueueClosed`.
    pub fn close_queue(&self) {
        self.inner.queue.close();
    }

    pub async fn clear(&self) -> Result<(), KeyStoreError> {
        self.inner.store.clear().await
    }
}
