use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{
    error::{LeaseError, StoreError},
    interface::store::{EventKind, WatchEvent, WatchStream},
};

use super::{broker::LeaseBroker, WatchCursor};

enum Interruption {
    Lost(LeaseError),
    Failed(StoreError),
}

/// Watches a held lease and reports the first sign that it is gone.
pub(crate) struct ExpirationWatcher {
    broker: Arc<LeaseBroker>,
    backoff: Duration,
    cursor: WatchCursor,
}

impl ExpirationWatcher {
    /// `version` is the last write of the lease this process has confirmed.
    pub(crate) fn new(broker: Arc<LeaseBroker>, backoff: Duration, version: u64) -> Self {
        Self {
            broker,
            backoff,
            cursor: WatchCursor::starting_after(version),
        }
    }

    pub(crate) async fn run(mut self, lost: mpsc::Sender<LeaseError>) {
        let reason = self.watch_until_lost().await;
        // The hold loop only needs the first report.
        let _ = lost.try_send(reason);
    }

    pub(crate) async fn watch_until_lost(&mut self) -> LeaseError {
        loop {
            let interruption = match self.broker.watch(self.cursor.next()).await {
                Ok(events) => self.follow(events).await,
                Err(e) => Interruption::Failed(e),
            };

            match interruption {
                Interruption::Lost(reason) => return reason,
                Interruption::Failed(StoreError::Compacted { requested, oldest }) => {
                    debug!(
                        key = %self.broker.key(),
                        requested,
                        oldest,
                        "watch resume point compacted, resynchronising"
                    );
                    match self.resync().await {
                        Ok(None) => continue,
                        Ok(Some(reason)) => return reason,
                        Err(e) => {
                            warn!(key = %self.broker.key(), error = %e, "failed to resynchronise lease watch");
                        }
                    }
                }
                Interruption::Failed(e) => {
                    warn!(
                        key = %self.broker.key(),
                        next = self.cursor.next(),
                        error = %e,
                        "lease watch interrupted, re-watching"
                    );
                }
            }

            tokio::time::sleep(self.backoff).await;
        }
    }

    async fn follow(&mut self, mut events: WatchStream) -> Interruption {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    if let Some(reason) = self.observe(event) {
                        return Interruption::Lost(reason);
                    }
                }
                Err(e) => return Interruption::Failed(e),
            }
        }
        Interruption::Failed(StoreError::Unavailable("watch stream closed".to_string()))
    }

    fn observe(&mut self, event: WatchEvent) -> Option<LeaseError> {
        if !self.cursor.advance(event.version) {
            trace!(key = %self.broker.key(), version = event.version, "skipping replayed event");
            return None;
        }

        let key = self.broker.key().to_string();
        match event.kind {
            EventKind::Deleted => Some(LeaseError::Deleted { key }),
            EventKind::Expired => Some(LeaseError::Expired { key }),
            EventKind::Created | EventKind::Updated => match event.value {
                Some(value) if self.broker.is_ours(&value) => {
                    trace!(key = %key, version = event.version, "observed own write");
                    None
                }
                holder => Some(LeaseError::Overwritten { key, holder }),
            },
        }
    }

    /// Re-reads the key after the watch history was compacted away.
    async fn resync(&mut self) -> Result<Option<LeaseError>, StoreError> {
        match self.broker.read().await {
            Ok(current) if self.broker.is_ours(&current.value) => {
                self.cursor.advance(current.revision);
                Ok(None)
            }
            Ok(current) => Ok(Some(LeaseError::Overwritten {
                key: self.broker.key().to_string(),
                holder: Some(current.value),
            })),
            Err(StoreError::NotFound { .. }) => Ok(Some(LeaseError::Expired {
                key: self.broker.key().to_string(),
            })),
            Err(e) => Err(e),
        }
    }
}
