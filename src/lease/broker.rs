use std::{sync::Arc, time::Duration};

use tracing::trace;

use crate::{
    error::{LeaseError, StoreError},
    interface::store::{Expect, KeyValue, LeaseClient, WatchStream},
};

use super::LeaseConfig;

/// Binds one key and holder value to a store client.
///
/// Every store request the holder makes goes through here, so the lease's
/// write discipline (create-if-absent, CAS on our own value, delete only our
/// own value) lives in one place.
pub(crate) struct LeaseBroker {
    client: Arc<dyn LeaseClient>,
    key: String,
    holder_value: String,
    ttl: Duration,
}

impl LeaseBroker {
    pub(crate) fn new(client: Arc<dyn LeaseClient>, config: &LeaseConfig) -> Self {
        Self {
            client,
            key: config.key.clone(),
            holder_value: config.holder_value.clone(),
            ttl: config.ttl,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn holder_value(&self) -> &str {
        &self.holder_value
    }

    pub(crate) fn client(&self) -> Arc<dyn LeaseClient> {
        self.client.clone()
    }

    pub(crate) fn is_ours(&self, value: &str) -> bool {
        value == self.holder_value
    }

    pub(crate) async fn create(&self) -> Result<u64, StoreError> {
        trace!(key = %self.key, "creating lease");
        self.client
            .create_if_absent(&self.key, &self.holder_value, self.ttl)
            .await
    }

    /// Refreshes the TTL, conditional on the key still holding our value.
    ///
    /// Conditioning on the value rather than the version keeps a renewal
    /// whose response was lost from looking like a conflict on retry.
    pub(crate) async fn renew(&self) -> Result<u64, StoreError> {
        trace!(key = %self.key, "renewing lease");
        self.client
            .compare_and_swap(
                &self.key,
                &self.holder_value,
                self.ttl,
                Expect::Value(self.holder_value.clone()),
            )
            .await
    }

    pub(crate) async fn delete(&self) -> Result<u64, StoreError> {
        trace!(key = %self.key, "deleting lease");
        self.client
            .compare_and_delete(&self.key, &self.holder_value)
            .await
    }

    pub(crate) async fn read(&self) -> Result<KeyValue, StoreError> {
        self.client.get(&self.key).await
    }

    pub(crate) async fn watch(&self, from_version: u64) -> Result<WatchStream, StoreError> {
        trace!(key = %self.key, from_version, "watching lease");
        self.client.watch(&self.key, from_version).await
    }

    /// Maps a failed write on a held lease to the reason the hold ends.
    pub(crate) fn loss(&self, e: StoreError) -> LeaseError {
        match e {
            StoreError::Conflict { current, .. } => LeaseError::Overwritten {
                key: self.key.clone(),
                holder: current,
            },
            StoreError::NotFound { .. } => LeaseError::Expired {
                key: self.key.clone(),
            },
            other => LeaseError::Store(other),
        }
    }
}
