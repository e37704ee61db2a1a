//! Leader election driven by `LeaderElector`.

mod common;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_test::assert_ok;

use common::{holder, init_tracing, KEY};
use kv_leaser::{LeaderCallbacks, LeaderElector, LeaderState, LeaseError, MemoryStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Started,
    Stopped(LeaseError),
}

#[derive(Default)]
struct Recorder {
    transitions: Mutex<Vec<Transition>>,
}

impl Recorder {
    async fn transitions(&self) -> Vec<Transition> {
        self.transitions.lock().await.clone()
    }
}

#[async_trait]
impl LeaderCallbacks for Recorder {
    async fn started_leading(&self) {
        self.transitions.lock().await.push(Transition::Started);
    }

    async fn stopped_leading(&self, reason: &LeaseError) {
        self.transitions
            .lock()
            .await
            .push(Transition::Stopped(reason.clone()));
    }
}

fn elector(store: &MemoryStore, name: &str) -> Arc<LeaderElector> {
    Arc::new(LeaderElector::new(holder(store, name)).with_retry_period(Duration::from_millis(200)))
}

#[tokio::test(start_paused = true)]
async fn leadership_moves_when_leader_stops() {
    init_tracing();
    let store = MemoryStore::new();
    let node_a = elector(&store, "node-a");
    let recorder_a = Arc::new(Recorder::default());
    let run_a = {
        let node_a = node_a.clone();
        let callbacks = recorder_a.clone();
        tokio::spawn(async move { node_a.run(callbacks).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node_a.state(), LeaderState::Leader);

    let node_b = elector(&store, "node-b");
    let recorder_b = Arc::new(Recorder::default());
    let run_b = {
        let node_b = node_b.clone();
        let callbacks = recorder_b.clone();
        tokio::spawn(async move { node_b.run(callbacks).await })
    };

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(node_a.state(), LeaderState::Leader);
    assert_eq!(node_b.state(), LeaderState::Follower);
    assert!(recorder_b.transitions().await.is_empty());

    assert_ok!(node_a.stop().await);
    assert_ok!(run_a.await.unwrap());
    assert_eq!(node_a.state(), LeaderState::Stopped);
    assert_eq!(
        recorder_a.transitions().await,
        vec![
            Transition::Started,
            Transition::Stopped(LeaseError::Released {
                key: KEY.to_string()
            }),
        ]
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node_b.state(), LeaderState::Leader);
    assert_eq!(recorder_b.transitions().await, vec![Transition::Started]);
    assert_eq!(store.peek(KEY).await.as_deref(), Some("node-b"));

    assert_ok!(node_b.stop().await);
    assert_ok!(run_b.await.unwrap());
    assert_eq!(store.peek(KEY).await, None);
}

#[tokio::test(start_paused = true)]
async fn follower_stops_cleanly() {
    init_tracing();
    let store = MemoryStore::new();
    store
        .put(KEY, "someone-else", Duration::from_secs(3600))
        .await
        .unwrap();

    let node_a = elector(&store, "node-a");
    let recorder = Arc::new(Recorder::default());
    let run = {
        let node_a = node_a.clone();
        let callbacks = recorder.clone();
        tokio::spawn(async move { node_a.run(callbacks).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(node_a.state(), LeaderState::Follower);

    assert_ok!(node_a.stop().await);
    assert_ok!(run.await.unwrap());
    assert_eq!(node_a.state(), LeaderState::Stopped);
    assert!(recorder.transitions().await.is_empty());
    assert_eq!(store.peek(KEY).await.as_deref(), Some("someone-else"));
}

#[tokio::test(start_paused = true)]
async fn leader_reacquires_after_revocation() {
    init_tracing();
    let store = MemoryStore::new();
    let node_a = elector(&store, "node-a");
    let recorder = Arc::new(Recorder::default());
    let run = {
        let node_a = node_a.clone();
        let callbacks = recorder.clone();
        tokio::spawn(async move { node_a.run(callbacks).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    store.delete(KEY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(node_a.state(), LeaderState::Leader);
    assert_eq!(
        recorder.transitions().await,
        vec![
            Transition::Started,
            Transition::Stopped(LeaseError::Deleted {
                key: KEY.to_string()
            }),
            Transition::Started,
        ]
    );

    assert_ok!(node_a.stop().await);
    assert_ok!(run.await.unwrap());
}
