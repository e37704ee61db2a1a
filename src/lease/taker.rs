use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{LeaseError, StoreError};

use super::{broker::LeaseBroker, LeaseConfig, LeaseState};

enum Vacancy {
    /// The incumbent's key was deleted or expired.
    Vacated,
    /// Retry the create right away.
    Retry,
    /// Retry the create after the acquire pause.
    Backoff(StoreError),
}

/// Acquires a lease, retrying for as long as it takes.
pub(crate) struct LeaseTaker<'a> {
    broker: &'a LeaseBroker,
    config: &'a LeaseConfig,
}

impl<'a> LeaseTaker<'a> {
    pub(crate) fn new(broker: &'a LeaseBroker, config: &'a LeaseConfig) -> Self {
        Self { broker, config }
    }

    /// Returns once the lease is ours. The only error is cancellation.
    pub(crate) async fn take(&self, cancel: &CancellationToken) -> Result<LeaseState, LeaseError> {
        loop {
            let sent_at = Instant::now();
            let created = tokio::select! {
                _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
                created = self.broker.create() => created,
            };

            match created {
                Ok(version) => {
                    info!(key = %self.broker.key(), version, "acquired lease");
                    return Ok(self.state(version, sent_at));
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => {
                    warn!(key = %self.broker.key(), error = %e, "failed to create lease, retrying");
                    self.pause(cancel).await?;
                    continue;
                }
            }

            let read_at = Instant::now();
            let current = tokio::select! {
                _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
                current = self.broker.read() => current,
            };
            let current = match current {
                Ok(current) => current,
                Err(StoreError::NotFound { .. }) => {
                    debug!(key = %self.broker.key(), "lease vanished before it could be read");
                    continue;
                }
                Err(e) => {
                    warn!(key = %self.broker.key(), error = %e, "failed to read lease, retrying");
                    self.pause(cancel).await?;
                    continue;
                }
            };

            if self.broker.is_ours(&current.value) {
                // The store's expiry is no earlier than read_at + remaining;
                // backdate the renewal clock to match it.
                let renewed_at = current
                    .ttl_remaining
                    .and_then(|remaining| (read_at + remaining).checked_sub(self.config.ttl))
                    .unwrap_or(read_at);
                info!(
                    key = %self.broker.key(),
                    version = current.version,
                    "lease already held by this holder"
                );
                return Ok(self.state(current.version, renewed_at));
            }

            debug!(
                key = %self.broker.key(),
                holder = %current.value,
                "lease held elsewhere, waiting for it to be vacated"
            );
            match self.wait_for_vacancy(current.revision + 1, cancel).await? {
                Vacancy::Vacated | Vacancy::Retry => {}
                Vacancy::Backoff(e) => {
                    warn!(key = %self.broker.key(), error = %e, "watch on held lease failed, retrying");
                    self.pause(cancel).await?;
                }
            }
        }
    }

    fn state(&self, version: u64, renewed_at: Instant) -> LeaseState {
        LeaseState::new(
            self.broker.holder_value().to_string(),
            version,
            renewed_at,
            self.config.ttl,
        )
    }

    async fn wait_for_vacancy(
        &self,
        from_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Vacancy, LeaseError> {
        let watched = tokio::select! {
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
            watched = self.broker.watch(from_version) => watched,
        };
        let mut events = match watched {
            Ok(events) => events,
            Err(StoreError::Compacted { .. }) => return Ok(Vacancy::Retry),
            Err(e) => return Ok(Vacancy::Backoff(e)),
        };

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
                item = events.next() => item,
            };
            match item {
                Some(Ok(event)) if event.is_removal() => {
                    debug!(key = %self.broker.key(), version = event.version, "lease vacated");
                    return Ok(Vacancy::Vacated);
                }
                Some(Ok(event)) => {
                    trace!(key = %self.broker.key(), version = event.version, "incumbent still holds lease");
                }
                Some(Err(StoreError::Compacted { .. })) => return Ok(Vacancy::Retry),
                Some(Err(e)) => return Ok(Vacancy::Backoff(e)),
                None => {
                    return Ok(Vacancy::Backoff(StoreError::Unavailable(
                        "watch stream closed".to_string(),
                    )))
                }
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), LeaseError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LeaseError::Cancelled),
            _ = tokio::time::sleep(self.config.retry_pause) => Ok(()),
        }
    }
}
