use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Ordered stream of changes to a single key.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Precondition for a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    Version(u64),
    Value(String),
}

/// Result of a point read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was last written.
    pub version: u64,
    /// Store revision at the time of the read. Watching from `revision + 1`
    /// observes every later change to the key.
    pub revision: u64,
    pub ttl_remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub version: u64,
    pub kind: EventKind,
    /// New value for created/updated events, `None` for removals.
    pub value: Option<String>,
}

impl WatchEvent {
    pub fn is_removal(&self) -> bool {
        matches!(self.kind, EventKind::Deleted | EventKind::Expired)
    }
}

/// The contract a lease needs from a linearizable, watchable key-value store.
///
/// Versions are store revisions: every successful write returns the revision
/// it was committed at, and revisions only ever grow.
#[async_trait]
pub trait LeaseClient: Send + Sync + 'static {
    /// Writes `key = value` with the given TTL only if `key` is absent.
    async fn create_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<u64, StoreError>;

    /// Overwrites `key` and refreshes its TTL only if `expect` holds.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        expect: Expect,
    ) -> Result<u64, StoreError>;

    /// Deletes `key` only if it still stores `expected_value`.
    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<KeyValue, StoreError>;

    /// Streams changes to `key` with `version >= from_version`.
    ///
    /// A `from_version` of `0` means "from now": only changes committed
    /// after the call are delivered.
    ///
    /// Fails with [`StoreError::Compacted`] when the store no longer has
    /// history reaching back to `from_version`.
    async fn watch(&self, key: &str, from_version: u64) -> Result<WatchStream, StoreError>;

    /// Keeps endpoint membership healthy until `cancel` fires.
    ///
    /// Failures are reported to the caller, which logs them and tries again.
    async fn maintain_connectivity(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        cancel.cancelled().await;
        Ok(())
    }
}
