//! In-memory [`LeaseClient`] for tests and single-process deployments.
//!
//! Behaves like a single-node, linearizable store: one global revision
//! counter, TTL expiry that emits `Expired` events, a bounded event history
//! that watches replay from, and knobs to simulate partitions and flaky
//! requests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, watch, Mutex},
    time::Instant,
};
use tracing::trace;

use crate::{
    error::StoreError,
    interface::store::{EventKind, Expect, KeyValue, LeaseClient, WatchEvent, WatchStream},
};

mod feed;

use feed::WatchFeed;

const DEFAULT_HISTORY_LIMIT: usize = 1024;
const EVENT_BUFFER: usize = 1024;

struct Entry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

struct StoreState {
    revision: u64,
    entries: HashMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest revision no longer replayable from `history`.
    compacted: u64,
}

impl StoreState {
    fn commit(
        &mut self,
        events: &broadcast::Sender<WatchEvent>,
        key: &str,
        kind: EventKind,
        value: Option<String>,
    ) -> u64 {
        self.revision += 1;
        let event = WatchEvent {
            key: key.to_string(),
            version: self.revision,
            kind,
            value,
        };
        self.history.push_back(event.clone());
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.version;
            }
        }
        // No receivers is fine.
        let _ = events.send(event);
        self.revision
    }

    fn expire_due(&mut self, events: &broadcast::Sender<WatchEvent>, key: &str, now: Instant) {
        let due = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if due {
            self.entries.remove(key);
            let version = self.commit(events, key, EventKind::Expired, None);
            trace!(key, version, "key expired");
        }
    }

    fn compact_through(&mut self, revision: u64) {
        let revision = revision.min(self.revision);
        while matches!(self.history.front(), Some(event) if event.version <= revision) {
            self.history.pop_front();
        }
        self.compacted = self.compacted.max(revision);
    }
}

struct Shared {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    partition: watch::Sender<bool>,
    failures: AtomicUsize,
}

impl Shared {
    async fn expire(&self, key: &str, version: u64) {
        let mut state = self.state.lock().await;
        let current = state.entries.get(key).map(|entry| entry.version);
        if current == Some(version) {
            state.expire_due(&self.events, key, Instant::now());
        }
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keeps at most `limit` events for watches to replay.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (partition, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    revision: 0,
                    entries: HashMap::new(),
                    history: VecDeque::new(),
                    history_limit: limit.max(1),
                    compacted: 0,
                }),
                events,
                partition,
                failures: AtomicUsize::new(0),
            }),
        }
    }

    /// While partitioned every request fails as unavailable and open watch
    /// streams are severed. TTLs keep running.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.shared.partition.send_replace(partitioned);
    }

    /// Fails the next `count` requests as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.shared.failures.store(count, Ordering::SeqCst);
    }

    /// Current value of `key`, bypassing partitions and injected failures.
    pub async fn peek(&self, key: &str) -> Option<String> {
        let mut state = self.shared.state.lock().await;
        state.expire_due(&self.shared.events, key, Instant::now());
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Drops all replayable history up to the current revision.
    pub async fn compact(&self) {
        let mut state = self.shared.state.lock().await;
        let revision = state.revision;
        state.compact_through(revision);
    }

    /// Unconditional delete, as done by an operator revoking a lease.
    pub async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        let mut state = self.shared.state.lock().await;
        state.expire_due(&self.shared.events, key, Instant::now());
        if state.entries.remove(key).is_none() {
            return Err(not_found(key));
        }
        Ok(state.commit(&self.shared.events, key, EventKind::Deleted, None))
    }

    /// Unconditional write, bypassing every precondition.
    pub async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        state.expire_due(&self.shared.events, key, now);
        let kind = if state.entries.contains_key(key) {
            EventKind::Updated
        } else {
            EventKind::Created
        };
        let version = self.write(&mut state, key, value, ttl, kind, now);
        Ok(version)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if *self.shared.partition.borrow() {
            return Err(StoreError::Unavailable("store partitioned".to_string()));
        }
        let injected = self
            .shared
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn write(
        &self,
        state: &mut StoreState,
        key: &str,
        value: &str,
        ttl: Duration,
        kind: EventKind,
        now: Instant,
    ) -> u64 {
        let version = state.commit(&self.shared.events, key, kind, Some(value.to_string()));
        let expires_at = now + ttl;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                version,
                expires_at: Some(expires_at),
            },
        );
        self.schedule_expiry(key, version, expires_at);
        version
    }

    fn schedule_expiry(&self, key: &str, version: u64, at: Instant) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            if let Some(shared) = shared.upgrade() {
                shared.expire(&key, version).await;
            }
        });
    }
}

fn not_found(key: &str) -> StoreError {
    StoreError::NotFound {
        key: key.to_string(),
    }
}

#[async_trait]
impl LeaseClient for MemoryStore {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        state.expire_due(&self.shared.events, key, now);
        if let Some(entry) = state.entries.get(key) {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                current: Some(entry.value.clone()),
            });
        }
        Ok(self.write(&mut state, key, value, ttl, EventKind::Created, now))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        expect: Expect,
    ) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        state.expire_due(&self.shared.events, key, now);
        let entry = state.entries.get(key).ok_or_else(|| not_found(key))?;
        let matches = match &expect {
            Expect::Version(version) => entry.version == *version,
            Expect::Value(expected) => entry.value == *expected,
        };
        if !matches {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                current: Some(entry.value.clone()),
            });
        }
        Ok(self.write(&mut state, key, value, ttl, EventKind::Updated, now))
    }

    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<u64, StoreError> {
        self.check_reachable()?;
        let mut state = self.shared.state.lock().await;
        state.expire_due(&self.shared.events, key, Instant::now());
        let entry = state.entries.get(key).ok_or_else(|| not_found(key))?;
        if entry.value != expected_value {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                current: Some(entry.value.clone()),
            });
        }
        state.entries.remove(key);
        Ok(state.commit(&self.shared.events, key, EventKind::Deleted, None))
    }

    async fn get(&self, key: &str) -> Result<KeyValue, StoreError> {
        self.check_reachable()?;
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        state.expire_due(&self.shared.events, key, now);
        let entry = state.entries.get(key).ok_or_else(|| not_found(key))?;
        Ok(KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            version: entry.version,
            revision: state.revision,
            ttl_remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
        })
    }

    async fn watch(&self, key: &str, from_version: u64) -> Result<WatchStream, StoreError> {
        self.check_reachable()?;
        let state = self.shared.state.lock().await;
        let from_version = if from_version == 0 {
            state.revision + 1
        } else {
            from_version
        };
        if from_version <= state.compacted {
            return Err(StoreError::Compacted {
                requested: from_version,
                oldest: state.compacted + 1,
            });
        }

        let backlog = state
            .history
            .iter()
            .filter(|event| event.key == key && event.version >= from_version)
            .cloned()
            .collect();
        // Subscribing under the lock leaves no gap between backlog and live events.
        let events = self.shared.events.subscribe();
        let partition = self.shared.partition.subscribe();
        drop(state);

        Ok(WatchFeed::new(key.to_string(), from_version, backlog, events, partition).into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn create_is_exclusive() {
        let store = MemoryStore::new();
        let version = assert_ok!(store.create_if_absent("leader", "node-a", TTL).await);
        assert_eq!(version, 1);

        let err = assert_err!(store.create_if_absent("leader", "node-b", TTL).await);
        assert_eq!(
            err,
            StoreError::Conflict {
                key: "leader".to_string(),
                current: Some("node-a".to_string()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn compare_and_swap_checks_precondition() {
        let store = MemoryStore::new();
        let created = store.create_if_absent("leader", "node-a", TTL).await.unwrap();

        let renewed = assert_ok!(
            store
                .compare_and_swap("leader", "node-a", TTL, Expect::Version(created))
                .await
        );
        assert!(renewed > created);

        assert_err!(
            store
                .compare_and_swap("leader", "node-b", TTL, Expect::Version(created))
                .await
        );
        assert_err!(
            store
                .compare_and_swap("leader", "node-b", TTL, Expect::Value("node-b".to_string()))
                .await
        );
        assert_eq!(
            store
                .compare_and_swap("missing", "node-a", TTL, Expect::Value("node-a".to_string()))
                .await,
            Err(StoreError::NotFound {
                key: "missing".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_with_an_event() {
        let store = MemoryStore::new();
        store.create_if_absent("leader", "node-a", TTL).await.unwrap();
        let mut events = store.watch("leader", 2).await.unwrap();

        tokio::time::sleep(TTL).await;

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Expired);
        assert_eq!(event.version, 2);
        assert_eq!(store.peek("leader").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_pushes_expiry_out() {
        let store = MemoryStore::new();
        store.create_if_absent("leader", "node-a", TTL).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        store
            .compare_and_swap("leader", "node-a", TTL, Expect::Value("node-a".to_string()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let current = store.get("leader").await.unwrap();
        assert_eq!(current.value, "node-a");
        assert_eq!(current.ttl_remaining, Some(Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_replays_history_then_follows() {
        let store = MemoryStore::new();
        let created = store.create_if_absent("leader", "node-a", TTL).await.unwrap();
        store.create_if_absent("other", "x", TTL).await.unwrap();

        let mut events = store.watch("leader", created).await.unwrap();
        store.compare_and_delete("leader", "node-a").await.unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert_eq!((first.kind, first.version), (EventKind::Created, 1));
        let second = events.next().await.unwrap().unwrap();
        assert_eq!((second.kind, second.version), (EventKind::Deleted, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn compacted_resume_is_rejected() {
        let store = MemoryStore::with_history_limit(2);
        store.create_if_absent("leader", "node-a", TTL).await.unwrap();
        for _ in 0..3 {
            store
                .compare_and_swap("leader", "node-a", TTL, Expect::Value("node-a".to_string()))
                .await
                .unwrap();
        }

        let err = match store.watch("leader", 1).await {
            Err(e) => e,
            Ok(_) => panic!("watch from compacted revision succeeded"),
        };
        assert_eq!(
            err,
            StoreError::Compacted {
                requested: 1,
                oldest: 3
            }
        );
        assert!(store.watch("leader", 3).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn partition_fails_requests_and_severs_watches() {
        let store = MemoryStore::new();
        store.create_if_absent("leader", "node-a", TTL).await.unwrap();
        let mut events = store.watch("leader", 2).await.unwrap();

        store.set_partitioned(true);
        assert!(store.get("leader").await.unwrap_err().is_transient());
        assert!(events.next().await.unwrap().unwrap_err().is_transient());
        assert!(events.next().await.is_none());

        store.set_partitioned(false);
        assert!(store.get("leader").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn feed_opened_during_partition_is_severed() {
        let (events, _) = broadcast::channel(8);
        let (partition, _) = watch::channel(false);
        partition.send_replace(true);
        // Subscribing after the flip marks it as already seen.
        let mut feed = WatchFeed::new(
            "leader".to_string(),
            1,
            VecDeque::new(),
            events.subscribe(),
            partition.subscribe(),
        )
        .into_stream();

        assert!(feed.next().await.unwrap().unwrap_err().is_transient());
        assert!(feed.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.create_if_absent("leader", "node-a", TTL).await.is_err());
        assert!(store.create_if_absent("leader", "node-a", TTL).await.is_err());
        assert!(store.create_if_absent("leader", "node-a", TTL).await.is_ok());
    }
}
