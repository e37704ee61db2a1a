//! Distributed leases over a versioned, watchable key-value store.
//!
//! A [`LeaseHolder`] competes for a single key with create-if-absent writes,
//! keeps it alive with compare-and-swap renewals, and watches it so that
//! involuntary loss is noticed before the TTL runs out. The store is any
//! [`LeaseClient`]; [`MemoryStore`] is an in-process implementation.
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use kv_leaser::{LeaseConfig, LeaseHolder, MemoryStore};
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> Result<(), kv_leaser::LeaseError> {
//! let store = Arc::new(MemoryStore::new());
//! let holder = LeaseHolder::new(
//!     store,
//!     LeaseConfig::new("control-plane-leader", "node-a", Duration::from_secs(10)),
//! )?;
//!
//! let (notify, mut updates) = mpsc::unbounded_channel();
//! tokio::spawn(async move { holder.acquire_and_hold(notify).await });
//!
//! if let Some(Ok(())) = updates.recv().await {
//!     // leader-only work, until the next message arrives
//! }
//! # Ok(())
//! # }
//! ```

pub mod election;
pub mod error;
pub mod interface;
pub mod lease;
pub mod memory;

mod util;

pub use election::{create_identity, LeaderElector, LeaderState};
pub use error::{LeaseError, StoreError};
pub use interface::{
    callbacks::LeaderCallbacks,
    store::{EventKind, Expect, KeyValue, LeaseClient, WatchEvent, WatchStream},
};
pub use lease::{holder::LeaseNotifier, HolderPhase, LeaseConfig, LeaseHolder, LeaseState};
pub use memory::MemoryStore;
