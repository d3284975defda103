//! Concurrency and atomicity behaviour of the transactional key store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use dl_keystore::{
    Clock, KeyKind, KeyStore, KeyStoreConfig, KeyStoreError, KeyValues, MemoryStore, MutationSet,
    SignalStore,
};

/// Memory store that records concurrent `set` calls per kind and can hold
/// session writes until released.
struct ObservedStore {
    inner: MemoryStore,
    gate_sessions: bool,
    gate: Semaphore,
    in_flight: Mutex<HashMap<KeyKind, usize>>,
    max_in_flight: Mutex<HashMap<KeyKind, usize>>,
    committed: Mutex<Vec<MutationSet>>,
}

impl ObservedStore {
    fn new(gate_sessions: bool) -> Self {
        Self {
            inner: MemoryStore::new(),
            gate_sessions,
            gate: Semaphore::new(0),
            in_flight: Mutex::default(),
            max_in_flight: Mutex::default(),
            committed: Mutex::default(),
        }
    }

    fn in_flight(&self, kind: KeyKind) -> usize {
        self.in_flight.lock().get(&kind).copied().unwrap_or(0)
    }

    fn max_in_flight(&self, kind: KeyKind) -> usize {
        self.max_in_flight.lock().get(&kind).copied().unwrap_or(0)
    }

    fn committed(&self) -> Vec<MutationSet> {
        self.committed.lock().clone()
    }
}

#[async_trait]
impl SignalStore for ObservedStore {
    async fn get(&self, kind: KeyKind, ids: &[String]) -> Result<KeyValues, KeyStoreError> {
        self.inner.get(kind, ids).await
    }

    async fn set(&self, mutations: &MutationSet) -> Result<(), KeyStoreError> {
        let kinds: Vec<KeyKind> = mutations.kinds().collect();
        for kind in &kinds {
            let mut in_flight = self.in_flight.lock();
            let n = in_flight.entry(*kind).or_default();
            *n += 1;
            let mut max = self.max_in_flight.lock();
            let m = max.entry(*kind).or_default();
            *m = (*m).max(*n);
        }

        if self.gate_sessions && kinds.contains(&KeyKind::Session) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        let result = self.inner.set(mutations).await;
        if result.is_ok() {
            self.committed.lock().push(mutations.clone());
        }

        for kind in &kinds {
            if let Some(n) = self.in_flight.lock().get_mut(kind) {
                *n -= 1;
            }
        }
        result
    }
}

/// Clock whose sleeps complete immediately and are recorded.
#[derive(Default)]
struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl Clock for RecordingClock {
    fn now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.sleeps.lock().push(duration);
        Box::pin(async {})
    }
}

fn config(attempts: u32) -> KeyStoreConfig {
    KeyStoreConfig {
        max_commit_attempts: attempts,
        commit_retry_delay_ms: 250,
        sender_key_queue_timeout_ms: 5_000,
    }
}

#[tokio::test]
async fn disjoint_kinds_do_not_block_each_other() {
    let store = Arc::new(ObservedStore::new(true));
    let ks = KeyStore::new(store.clone(), &config(1));

    let blocked = {
        let ks = ks.clone();
        tokio::spawn(async move {
            ks.set(MutationSet::new().with(KeyKind::Session, "alice.0", vec![1]))
                .await
        })
    };
    while store.in_flight(KeyKind::Session) == 0 {
        tokio::task::yield_now().await;
    }

    tokio::time::timeout(
        Duration::from_secs(5),
        ks.set(MutationSet::new().with(KeyKind::PreKey, "1", vec![2])),
    )
    .await
    .expect("pre-key write must not wait for the session write")
    .unwrap();
    assert!(!blocked.is_finished());

    store.gate.add_permits(1);
    blocked.await.unwrap().unwrap();
    assert!(store.inner.contains(KeyKind::Session, "alice.0"));
}

#[tokio::test]
async fn same_kind_writes_are_serialized_without_lost_updates() {
    let store = Arc::new(ObservedStore::new(false));
    let ks = KeyStore::new(store.clone(), &config(1));

    let writers: Vec<_> = (0..10)
        .map(|i| {
            let ks = ks.clone();
            tokio::spawn(async move {
                ks.set(MutationSet::new().with(KeyKind::Session, format!("peer.{i}"), vec![i as u8]))
                    .await
            })
        })
        .collect();
    for w in writers {
        w.await.unwrap().unwrap();
    }

    assert_eq!(store.max_in_flight(KeyKind::Session), 1);
    assert_eq!(store.inner.snapshot(KeyKind::Session).len(), 10);
}

#[tokio::test]
async fn failed_work_persists_nothing() {
    let mem = Arc::new(MemoryStore::new());
    let ks = KeyStore::new(mem.clone(), &config(3));

    let result: Result<(), KeyStoreError> = ks
        .transaction(|| async {
            ks.set(MutationSet::new().with(KeyKind::Session, "a.0", vec![1])).await?;
            ks.set(MutationSet::new().with(KeyKind::IdentityMapping, "a.0", vec![2])).await?;
            Err(KeyStoreError::Backend("work failed".into()))
        })
        .await;

    assert!(result.is_err());
    assert_eq!(mem.set_calls(), 0);
    assert!(mem.snapshot(KeyKind::Session).is_empty());
}

#[tokio::test]
async fn nested_writes_commit_exactly_once() {
    let mem = Arc::new(MemoryStore::new());
    let ks = KeyStore::new(mem.clone(), &config(3));

    ks.transaction(|| async {
        ks.set(MutationSet::new().with(KeyKind::Session, "outer.0", vec![1])).await?;
        ks.transaction(|| async {
            ks.set(MutationSet::new().with(KeyKind::Session, "inner.0", vec![2])).await?;
            ks.transaction(|| async {
                let seen = ks.get_one(KeyKind::Session, "outer.0").await?;
                assert_eq!(seen, Some(vec![1]));
                ks.set(MutationSet::new().with(KeyKind::PreKey, "5", vec![3])).await
            })
            .await
        })
        .await?;
        assert_eq!(mem.set_calls(), 0);
        Ok::<_, KeyStoreError>(())
    })
    .await
    .unwrap();

    assert_eq!(mem.set_calls(), 1);
    assert_eq!(mem.snapshot(KeyKind::Session).len(), 2);
    assert!(mem.contains(KeyKind::PreKey, "5"));
}

#[tokio::test]
async fn failed_nested_frame_is_discarded_only() {
    let mem = Arc::new(MemoryStore::new());
    let ks = KeyStore::new(mem.clone(), &config(3));

    ks.transaction(|| async {
        ks.set(MutationSet::new().with(KeyKind::Session, "keep.0", vec![1])).await?;
        let inner: Result<(), KeyStoreError> = ks
            .transaction(|| async {
                ks.set(MutationSet::new().with(KeyKind::Session, "drop.0", vec![2])).await?;
                Err(KeyStoreError::Backend("inner failed".into()))
            })
            .await;
        assert!(inner.is_err());
        assert_eq!(ks.get_one(KeyKind::Session, "drop.0").await?, None);
        Ok::<_, KeyStoreError>(())
    })
    .await
    .unwrap();

    assert!(mem.contains(KeyKind::Session, "keep.0"));
    assert!(!mem.contains(KeyKind::Session, "drop.0"));
}

#[tokio::test]
async fn pre_key_tombstones_inside_a_transaction_follow_the_frames() {
    let store = Arc::new(ObservedStore::new(false));
    let ks = KeyStore::new(store.clone(), &config(1));

    // Staged in a nested frame, deleted by its parent: the key is known, so
    // the tombstone is kept.
    ks.transaction(|| async {
        ks.transaction(|| async {
            ks.set(MutationSet::new().with(KeyKind::PreKey, "5", vec![5])).await?;
            ks.set(MutationSet::new().with(KeyKind::SignedPreKey, "2", vec![2])).await?;
            Ok::<_, KeyStoreError>(())
        })
        .await?;
        ks.set(MutationSet::new().without(KeyKind::PreKey, "5").without(KeyKind::SignedPreKey, "2"))
            .await?;
        Ok::<_, KeyStoreError>(())
    })
    .await
    .unwrap();

    let committed = store.committed();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].lookup(KeyKind::PreKey, "5"), Some(&None));
    assert_eq!(committed[0].lookup(KeyKind::SignedPreKey, "2"), Some(&None));

    // Never stored, or staged only by a frame that failed: the deletion is
    // dropped and only the session write commits.
    ks.transaction(|| async {
        let _ = ks
            .transaction(|| async {
                ks.set(MutationSet::new().with(KeyKind::PreKey, "8", vec![8])).await?;
                Err::<(), _>(KeyStoreError::Backend("abandoned".into()))
            })
            .await;
        ks.set(
            MutationSet::new()
                .without(KeyKind::PreKey, "77")
                .without(KeyKind::PreKey, "8")
                .with(KeyKind::Session, "alice.0", vec![1]),
        )
        .await?;
        Ok::<_, KeyStoreError>(())
    })
    .await
    .unwrap();

    let committed = store.committed();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[1], MutationSet::new().with(KeyKind::Session, "alice.0", vec![1]));
}

#[tokio::test]
async fn commit_retries_then_succeeds() {
    let mem = Arc::new(MemoryStore::new());
    let clock = Arc::new(RecordingClock::default());
    let ks = KeyStore::with_clock(mem.clone(), &config(3), clock.clone());
    mem.fail_next_sets(2);

    ks.transaction(|| async {
        ks.set(MutationSet::new().with(KeyKind::Session, "a.0", vec![1])).await
    })
    .await
    .unwrap();

    assert_eq!(mem.set_calls(), 3);
    assert_eq!(*clock.sleeps.lock(), vec![Duration::from_millis(250); 2]);
    assert!(mem.contains(KeyKind::Session, "a.0"));
}

#[tokio::test]
async fn commit_exhaustion_aborts_the_transaction() {
    let mem = Arc::new(MemoryStore::new());
    let clock = Arc::new(RecordingClock::default());
    let ks = KeyStore::with_clock(mem.clone(), &config(3), clock.clone());
    mem.fail_next_sets(10);

    let err = ks
        .transaction(|| async {
            ks.set(MutationSet::new().with(KeyKind::Session, "a.0", vec![1])).await
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KeyStoreError::CommitExhausted { attempts: 3, .. }));
    assert_eq!(mem.set_calls(), 3);
    assert_eq!(clock.sleeps.lock().len(), 2);
    assert!(!mem.contains(KeyKind::Session, "a.0"));
}

#[tokio::test(start_paused = true)]
async fn queued_group_message_resolves_when_key_is_stored() {
    let mem = Arc::new(MemoryStore::new());
    let ks = KeyStore::new(mem.clone(), &config(3));
    let name = "family::alice::0";

    let waiter = {
        let ks2 = ks.clone();
        ks.enqueue_group_message::<_, _, KeyStoreError>(name, b"cipher".to_vec(), move |ct| async move {
            let key = ks2
                .get_one(KeyKind::SenderKey, "family::alice::0")
                .await?
                .ok_or(KeyStoreError::Backend("key missing on replay".into()))?;
            Ok([key, ct].concat())
        })
    };
    assert_eq!(ks.pending_group_messages(name), 1);

    ks.set(MutationSet::new().with(KeyKind::SenderKey, name, b"K:".to_vec()))
        .await
        .unwrap();
    assert_eq!(waiter.wait().await.unwrap(), b"K:cipher");
}

#[tokio::test(start_paused = true)]
async fn queued_group_message_times_out() {
    let mem = Arc::new(MemoryStore::new());
    let ks = KeyStore::new(mem, &config(3));
    let err = ks
        .queue_group_message::<_, _, KeyStoreError>("family::bob::0", vec![1], |ct| async move { Ok(ct) })
        .await
        .unwrap_err();
    assert!(matches!(err, KeyStoreError::QueueTimeout { .. }));
    assert_eq!(ks.pending_group_messages("family::bob::0"), 0);
}
