use std::time::Duration;

use tokio::time::Instant;

pub(crate) mod broker;
pub mod config;
pub mod holder;
mod renewer;
mod taker;
mod watcher;

pub use config::LeaseConfig;
pub use holder::LeaseHolder;

/// What this process last confirmed about the lease it holds.
///
/// Owned by the hold loop; workers report changes as messages and never
/// mutate a shared copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseState {
    pub holder_value: String,
    /// Store version of the last confirmed write of `holder_value`.
    pub version: u64,
    /// When the last confirmed write was sent, so `renewed_at + ttl` is never
    /// later than the store-side expiry.
    pub renewed_at: Instant,
    pub ttl: Duration,
}

impl LeaseState {
    pub(crate) fn new(holder_value: String, version: u64, renewed_at: Instant, ttl: Duration) -> Self {
        Self {
            holder_value,
            version,
            renewed_at,
            ttl,
        }
    }

    /// Instant past which ownership may no longer be assumed.
    pub fn expires_at(&self) -> Instant {
        self.renewed_at + self.ttl
    }

    pub(crate) fn renew_at(&self, after: Duration) -> Instant {
        self.renewed_at + after
    }

    pub(crate) fn renewed(&self, version: u64, at: Instant) -> Self {
        Self {
            holder_value: self.holder_value.clone(),
            version: version.max(self.version),
            renewed_at: at,
            ttl: self.ttl,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderPhase {
    Idle,
    Acquiring,
    Held,
    Renewing,
    Lost,
    Released,
}

impl HolderPhase {
    pub fn is_held(self) -> bool {
        matches!(self, HolderPhase::Held | HolderPhase::Renewing)
    }
}

/// Resume point for a watch: one past the last consumed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchCursor {
    next: u64,
}

impl WatchCursor {
    pub(crate) fn starting_after(version: u64) -> Self {
        Self { next: version + 1 }
    }

    pub(crate) fn next(&self) -> u64 {
        self.next
    }

    /// Records that everything up to and including `version` has been seen.
    /// Returns `false` for an event at or behind the cursor, which must be
    /// skipped.
    pub(crate) fn advance(&mut self, version: u64) -> bool {
        if version < self.next {
            return false;
        }
        self.next = version + 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_monotonic() {
        let mut cursor = WatchCursor::starting_after(4);
        assert_eq!(cursor.next(), 5);

        assert!(cursor.advance(7));
        assert_eq!(cursor.next(), 8);

        assert!(!cursor.advance(6));
        assert!(!cursor.advance(7));
        assert_eq!(cursor.next(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_state_keeps_highest_version() {
        let start = Instant::now();
        let state = LeaseState::new("node-a".to_string(), 12, start, Duration::from_secs(10));
        assert_eq!(state.expires_at(), start + Duration::from_secs(10));

        let later = start + Duration::from_secs(7);
        let renewed = state.renewed(15, later);
        assert_eq!(renewed.version, 15);
        assert_eq!(renewed.expires_at(), later + Duration::from_secs(10));

        assert_eq!(renewed.renewed(3, later).version, 15);
    }

    #[test]
    fn held_phases() {
        assert!(HolderPhase::Held.is_held());
        assert!(HolderPhase::Renewing.is_held());
        assert!(!HolderPhase::Acquiring.is_held());
        assert!(!HolderPhase::Lost.is_held());
    }
}
