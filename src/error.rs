use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed store request.
///
/// Every conditional write either succeeds with a version or fails with one
/// of these variants, so callers can match instead of inspecting messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The write precondition did not hold: the key exists (create) or holds
    /// a different value/version (compare-and-swap, compare-and-delete).
    #[error("conditional write on {key} failed")]
    Conflict {
        key: String,
        /// Value currently stored, when the store reports it.
        current: Option<String>,
    },

    #[error("key {key} not found")]
    NotFound { key: String },

    /// The requested watch resume point is older than the retained history.
    #[error("version {requested} has been compacted; oldest available is {oldest}")]
    Compacted { requested: u64, oldest: u64 },

    /// Network failure, timeout or disconnect. Always safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Why a hold on a lease ended, or why a holder refused to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("lease {key} was deleted")]
    Deleted { key: String },

    #[error("lease {key} expired")]
    Expired { key: String },

    #[error("lease {key} was overwritten by another holder")]
    Overwritten {
        key: String,
        holder: Option<String>,
    },

    /// Renewal could not be confirmed before the lease would have expired.
    #[error("renewal of lease {key} did not complete within {margin:?}")]
    RenewalTimeout { key: String, margin: Duration },

    #[error("lease {key} was released")]
    Released { key: String },

    #[error("lease holder was stopped")]
    Cancelled,

    #[error("acquire_and_hold is already running on this holder")]
    AlreadyRunning,

    #[error("invalid lease configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LeaseError {
    /// True for the errors that end a hold because ownership is gone.
    pub fn is_loss(&self) -> bool {
        matches!(
            self,
            LeaseError::Deleted { .. }
                | LeaseError::Expired { .. }
                | LeaseError::Overwritten { .. }
                | LeaseError::RenewalTimeout { .. }
        )
    }
}
