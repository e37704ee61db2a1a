use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LeaseError;

/// A renewal window must leave room for at least this many CAS attempts
/// spaced `min_retry_interval` apart.
pub const MIN_RENEW_ATTEMPTS: u32 = 2;

/// Configuration of a single lease and the holder competing for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Key of the protected resource (e.g. "control-plane-leader").
    pub key: String,

    /// Value identifying this candidate, stored at `key` while held.
    pub holder_value: String,

    /// Time after which the store expires the key absent renewal.
    pub ttl: Duration,

    /// Fraction of `ttl` after which renewal starts.
    pub fraction_before_renew: f64,

    /// Upper bound on renewal attempts within one renewal window.
    pub max_renew_retries: u32,

    /// Floor on the spacing between renewal attempts.
    pub min_retry_interval: Duration,

    /// Pause after a transient error while acquiring.
    pub retry_pause: Duration,

    /// Pause before re-issuing a failed watch.
    pub watch_backoff: Duration,

    /// Attempts made by `release` before giving up on transient errors.
    pub release_retries: u32,

    /// Pause between runs of the store's connectivity maintenance.
    pub connectivity_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            holder_value: String::new(),
            ttl: Duration::from_secs(10),
            fraction_before_renew: 0.66,
            max_renew_retries: 10,
            min_retry_interval: Duration::from_millis(100),
            retry_pause: Duration::from_secs(1),
            watch_backoff: Duration::from_millis(500),
            release_retries: 3,
            connectivity_delay: Duration::from_secs(5),
        }
    }
}

impl LeaseConfig {
    pub fn new(key: impl Into<String>, holder_value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder_value: holder_value.into(),
            ttl,
            ..Self::default()
        }
    }

    pub fn with_fraction_before_renew(mut self, fraction: f64) -> Self {
        self.fraction_before_renew = fraction;
        self
    }

    pub fn with_max_renew_retries(mut self, retries: u32) -> Self {
        self.max_renew_retries = retries;
        self
    }

    pub fn with_min_retry_interval(mut self, interval: Duration) -> Self {
        self.min_retry_interval = interval;
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn with_watch_backoff(mut self, backoff: Duration) -> Self {
        self.watch_backoff = backoff;
        self
    }

    pub fn with_release_retries(mut self, retries: u32) -> Self {
        self.release_retries = retries;
        self
    }

    pub fn with_connectivity_delay(mut self, delay: Duration) -> Self {
        self.connectivity_delay = delay;
        self
    }

    /// Time after the last confirmed write at which renewal begins.
    pub fn renew_after(&self) -> Duration {
        self.ttl.mul_f64(self.fraction_before_renew)
    }

    /// Time left for renewal before the lease would lapse.
    pub fn renew_margin(&self) -> Duration {
        self.ttl.saturating_sub(self.renew_after())
    }

    /// Spacing between renewal attempts.
    pub fn renew_interval(&self) -> Duration {
        let spread = self.renew_margin() / self.max_renew_retries.max(1);
        spread.max(self.min_retry_interval)
    }

    pub fn validate(&self) -> Result<(), LeaseError> {
        if self.key.is_empty() {
            return Err(invalid("key must not be empty"));
        }
        if self.holder_value.is_empty() {
            return Err(invalid("holder_value must not be empty"));
        }
        if !(self.fraction_before_renew > 0.0 && self.fraction_before_renew < 1.0) {
            return Err(invalid(format!(
                "fraction_before_renew must be within (0, 1), got {}",
                self.fraction_before_renew
            )));
        }
        if self.max_renew_retries == 0 {
            return Err(invalid("max_renew_retries must be at least 1"));
        }
        if self.min_retry_interval.is_zero() {
            return Err(invalid("min_retry_interval must be positive"));
        }
        if self.retry_pause.is_zero() {
            return Err(invalid("retry_pause must be positive"));
        }
        if self.watch_backoff.is_zero() {
            return Err(invalid("watch_backoff must be positive"));
        }

        let needed = self.min_retry_interval * MIN_RENEW_ATTEMPTS;
        if self.renew_margin() < needed {
            return Err(invalid(format!(
                "ttl {:?} leaves a renewal margin of {:?}, need at least {:?}",
                self.ttl,
                self.renew_margin(),
                needed
            )));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> LeaseError {
    LeaseError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn leader() -> LeaseConfig {
        LeaseConfig::new("leader", "node-a", Duration::from_secs(10))
    }

    #[test]
    fn renewal_schedule() {
        let config = leader();
        let after = config.renew_after();
        assert!(after > Duration::from_millis(6599) && after < Duration::from_millis(6601));
        assert!(config.renew_margin() > Duration::from_millis(3399));
        assert_eq!(config.renew_interval(), config.renew_margin() / 10);
    }

    #[test]
    fn renew_interval_is_floored() {
        let config = LeaseConfig::new("leader", "node-a", Duration::from_secs(1))
            .with_max_renew_retries(100)
            .with_min_retry_interval(Duration::from_millis(50));
        assert_eq!(config.renew_interval(), Duration::from_millis(50));
    }

    #[test]
    fn defaults_are_valid() {
        assert!(leader().validate().is_ok());
    }

    #[test]
    fn rejects_bad_fraction() {
        assert_err!(leader().with_fraction_before_renew(1.0).validate());
        assert_err!(leader().with_fraction_before_renew(0.0).validate());
        assert_err!(leader().with_fraction_before_renew(f64::NAN).validate());
    }

    #[test]
    fn rejects_empty_identity() {
        let config = LeaseConfig::new("leader", "", Duration::from_secs(10));
        assert_eq!(
            config.validate(),
            Err(LeaseError::InvalidConfig(
                "holder_value must not be empty".to_string()
            ))
        );
    }

    #[test]
    fn rejects_ttl_too_short_for_retries() {
        let config = LeaseConfig::new("leader", "node-a", Duration::from_millis(300))
            .with_min_retry_interval(Duration::from_millis(100));
        assert!(matches!(
            config.validate(),
            Err(LeaseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: LeaseConfig = serde_json::from_str(
            r#"{
                "key": "control-plane-leader",
                "holder_value": "node-b",
                "ttl": { "secs": 30, "nanos": 0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.key, "control-plane-leader");
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.max_renew_retries, 10);
        assert!(config.validate().is_ok());
    }
}
