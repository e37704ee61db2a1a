use async_trait::async_trait;

use crate::error::LeaseError;

/// Leader-only work driven by a [`LeaderElector`](crate::election::LeaderElector).
#[async_trait]
pub trait LeaderCallbacks: Send + Sync {
    async fn started_leading(&self);

    /// Called once per term. Leader-only side effects must stop before this
    /// returns.
    async fn stopped_leading(&self, reason: &LeaseError);
}
