use std::sync::Arc;

use futures_retry::FutureRetry;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

use crate::{error::LeaseError, util::retry::DeadlineStrategy};

use super::{broker::LeaseBroker, LeaseConfig, LeaseState};

#[derive(Debug)]
pub(crate) enum RenewerEvent {
    Renewing,
    Renewed(LeaseState),
}

/// Keeps a held lease alive with periodic compare-and-swap writes.
pub(crate) struct LeaseRenewer {
    broker: Arc<LeaseBroker>,
    config: Arc<LeaseConfig>,
    state: LeaseState,
}

impl LeaseRenewer {
    pub(crate) fn new(broker: Arc<LeaseBroker>, config: Arc<LeaseConfig>, state: LeaseState) -> Self {
        Self {
            broker,
            config,
            state,
        }
    }

    pub(crate) async fn run(
        mut self,
        progress: mpsc::UnboundedSender<RenewerEvent>,
        lost: mpsc::Sender<LeaseError>,
    ) {
        let reason = self.renew_until_lost(&progress).await;
        let _ = lost.try_send(reason);
    }

    pub(crate) async fn renew_until_lost(
        &mut self,
        progress: &mpsc::UnboundedSender<RenewerEvent>,
    ) -> LeaseError {
        loop {
            tokio::time::sleep_until(self.state.renew_at(self.config.renew_after())).await;
            let _ = progress.send(RenewerEvent::Renewing);

            match self.renew_once().await {
                Ok(state) => {
                    debug!(key = %self.broker.key(), version = state.version, "renewed lease");
                    self.state = state;
                    let _ = progress.send(RenewerEvent::Renewed(self.state.clone()));
                }
                Err(reason) => return reason,
            }
        }
    }

    /// One renewal window: retries until confirmed, refused, or out of time.
    async fn renew_once(&self) -> Result<LeaseState, LeaseError> {
        let deadline = self.state.expires_at();
        let strategy = DeadlineStrategy::new(
            self.config.max_renew_retries as usize,
            self.config.renew_interval(),
            deadline,
        );

        let broker = &*self.broker;
        let attempts = FutureRetry::new(
            move || {
                let sent_at = Instant::now();
                async move { broker.renew().await.map(|version| (version, sent_at)) }
            },
            strategy,
        );

        match tokio::time::timeout_at(deadline, attempts).await {
            Ok(Ok(((version, sent_at), attempts))) => {
                if attempts > 1 {
                    info!(key = %self.broker.key(), attempts, "renewed lease after retries");
                }
                Ok(self.state.renewed(version, sent_at))
            }
            Ok(Err((e, attempts))) if e.is_transient() => {
                warn!(key = %self.broker.key(), attempts, error = %e, "lease renewal retries exhausted");
                Err(self.timeout())
            }
            Ok(Err((e, _))) => {
                warn!(key = %self.broker.key(), error = %e, "lease renewal refused");
                Err(self.broker.loss(e))
            }
            Err(_) => {
                warn!(key = %self.broker.key(), "lease renewal hit its deadline");
                Err(self.timeout())
            }
        }
    }

    fn timeout(&self) -> LeaseError {
        LeaseError::RenewalTimeout {
            key: self.broker.key().to_string(),
            margin: self.config.renew_margin(),
        }
    }
}
