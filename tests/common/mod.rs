//! Shared helpers for the lease integration tests.
//!
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use kv_leaser::{LeaseConfig, LeaseError, LeaseHolder, MemoryStore};
use tokio::{sync::mpsc, task::JoinHandle};

pub const KEY: &str = "leader";
pub const TTL: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(holder_value: &str) -> LeaseConfig {
    LeaseConfig::new(KEY, holder_value, TTL)
}

pub fn holder(store: &MemoryStore, holder_value: &str) -> Arc<LeaseHolder> {
    Arc::new(LeaseHolder::new(Arc::new(store.clone()), config(holder_value)).expect("valid config"))
}

/// A running `acquire_and_hold` call and the receiving end of its channel.
pub struct Candidate {
    pub holder: Arc<LeaseHolder>,
    pub updates: mpsc::UnboundedReceiver<Result<(), LeaseError>>,
    pub task: JoinHandle<Result<(), LeaseError>>,
}

pub fn spawn_candidate(holder: Arc<LeaseHolder>) -> Candidate {
    let (notify, updates) = mpsc::unbounded_channel();
    let running = holder.clone();
    let task = tokio::spawn(async move { running.acquire_and_hold(notify).await });
    Candidate {
        holder,
        updates,
        task,
    }
}
