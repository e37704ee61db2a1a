use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use tokio::time::Instant;

use crate::error::StoreError;

/// Retries transient store errors a fixed number of times with a fixed delay.
pub(crate) struct FixedCountWithDelayStrategy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedCountWithDelayStrategy {
    pub(crate) fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl ErrorHandler<StoreError> for FixedCountWithDelayStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(e);
        }

        if e.is_transient() {
            RetryPolicy::WaitRetry(self.delay)
        } else {
            RetryPolicy::ForwardError(e)
        }
    }
}

/// Like [`FixedCountWithDelayStrategy`], but also gives up once the next
/// attempt could not start before `deadline`.
pub(crate) struct DeadlineStrategy {
    max_attempts: usize,
    interval: Duration,
    deadline: Instant,
}

impl DeadlineStrategy {
    pub(crate) fn new(max_attempts: usize, interval: Duration, deadline: Instant) -> Self {
        Self {
            max_attempts,
            interval,
            deadline,
        }
    }
}

impl ErrorHandler<StoreError> for DeadlineStrategy {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, e: StoreError) -> RetryPolicy<StoreError> {
        if !e.is_transient() || attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(e);
        }
        if Instant::now() + self.interval >= self.deadline {
            return RetryPolicy::ForwardError(e);
        }
        RetryPolicy::WaitRetry(self.interval)
    }
}
