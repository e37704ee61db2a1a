//! Leader election on top of [`LeaseHolder`].
//!
//! [`LeaderElector`] keeps competing for the lease for as long as it runs and
//! turns each term of ownership into a pair of [`LeaderCallbacks`] calls.

use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::LeaseError, interface::callbacks::LeaderCallbacks, lease::LeaseHolder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Leader,
    Follower,
    Stopped,
}

pub struct LeaderElector {
    holder: Arc<LeaseHolder>,
    retry_period: Duration,
    state: watch::Sender<LeaderState>,
    cancel: CancellationToken,
}

impl LeaderElector {
    pub fn new(holder: Arc<LeaseHolder>) -> Self {
        let (state, _) = watch::channel(LeaderState::Follower);
        Self {
            retry_period: holder.config().retry_pause,
            holder,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Pause between the end of one term and the next attempt to acquire.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    pub fn holder(&self) -> &Arc<LeaseHolder> {
        &self.holder
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Competes for leadership until [`stop`](Self::stop) is called.
    ///
    /// Callbacks run inline on this loop; `started_leading` should hand long
    /// running work off to a task so loss is noticed promptly.
    pub async fn run(&self, callbacks: Arc<dyn LeaderCallbacks>) -> Result<(), LeaseError> {
        info!(
            key = %self.holder.config().key,
            identity = %self.holder.config().holder_value,
            "starting leader election"
        );

        while !self.cancel.is_cancelled() {
            let (notify, mut updates) = mpsc::unbounded_channel();
            let holder = self.holder.clone();
            let session = tokio::spawn(async move { holder.acquire_and_hold(notify).await });

            let mut leading = false;
            let mut stopping = false;
            loop {
                let update = tokio::select! {
                    update = updates.recv() => update,
                    _ = self.cancel.cancelled(), if !stopping => {
                        stopping = true;
                        self.holder.stop().await;
                        continue;
                    }
                };
                let update = match update {
                    Some(update) => update,
                    None => break,
                };

                match update {
                    Ok(()) => {
                        leading = true;
                        self.state.send_replace(LeaderState::Leader);
                        info!(key = %self.holder.config().key, "started leading");
                        callbacks.started_leading().await;
                    }
                    Err(reason) if leading => {
                        leading = false;
                        self.state.send_replace(LeaderState::Follower);
                        if reason.is_loss() {
                            warn!(key = %self.holder.config().key, reason = %reason, "lost leadership");
                        } else {
                            info!(key = %self.holder.config().key, reason = %reason, "stopped leading");
                        }
                        callbacks.stopped_leading(&reason).await;
                    }
                    Err(reason) => {
                        debug!(reason = %reason, "election attempt ended before acquiring");
                    }
                }
            }

            match session.await {
                Ok(result) => result?,
                Err(e) => warn!(error = %e, "lease session task failed"),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }

        self.state.send_replace(LeaderState::Stopped);
        info!(key = %self.holder.config().key, "leader election stopped");
        Ok(())
    }

    /// Releases the lease and ends [`run`](Self::run).
    pub async fn stop(&self) -> Result<(), LeaseError> {
        let released = self.holder.release().await;
        self.cancel.cancel();
        released
    }
}

/// Builds a holder value unique to this process: `hostname_pid_random`.
pub fn create_identity() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let random: String = std::iter::repeat_with(rand::random::<u8>)
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();

    format!("{}_{}_{}", hostname, std::process::id(), random)
}
