use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard,
};

use futures_retry::FutureRetry;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{LeaseError, StoreError},
    interface::store::LeaseClient,
    util::{
        retry::FixedCountWithDelayStrategy,
        runnable::{run_with_fixed_delay, Supervisor},
    },
};

use super::{
    broker::LeaseBroker,
    renewer::{LeaseRenewer, RenewerEvent},
    taker::LeaseTaker,
    watcher::ExpirationWatcher,
    HolderPhase, LeaseConfig, LeaseState,
};

/// Channel on which [`LeaseHolder::acquire_and_hold`] reports `Ok(())` once
/// the lease is acquired and then the error that ended the hold.
pub type LeaseNotifier = mpsc::UnboundedSender<Result<(), LeaseError>>;

/// Signals shared between one `acquire_and_hold` call and the methods that
/// may interrupt it.
#[derive(Clone)]
struct Session {
    cancel: CancellationToken,
    released: CancellationToken,
    releasing: Arc<AtomicBool>,
}

impl Session {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            released: CancellationToken::new(),
            releasing: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Resets the holder when an `acquire_and_hold` call ends, including when
/// its future is dropped mid-hold.
struct RunningGuard<'a>(&'a LeaseHolder);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.session_slot().take();
        self.0.lease.send_replace(None);
        self.0.phase.send_replace(HolderPhase::Idle);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// Competes for, holds and releases one lease.
pub struct LeaseHolder {
    broker: Arc<LeaseBroker>,
    config: Arc<LeaseConfig>,
    running: AtomicBool,
    session: Mutex<Option<Session>>,
    phase: watch::Sender<HolderPhase>,
    lease: watch::Sender<Option<LeaseState>>,
}

impl LeaseHolder {
    pub fn new(client: Arc<dyn LeaseClient>, config: LeaseConfig) -> Result<Self, LeaseError> {
        config.validate()?;
        let (phase, _) = watch::channel(HolderPhase::Idle);
        let (lease, _) = watch::channel(None);
        Ok(Self {
            broker: Arc::new(LeaseBroker::new(client, &config)),
            config: Arc::new(config),
            running: AtomicBool::new(false),
            session: Mutex::new(None),
            phase,
            lease,
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn phase(&self) -> HolderPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<HolderPhase> {
        self.phase.subscribe()
    }

    pub fn is_held(&self) -> bool {
        self.phase().is_held()
    }

    /// Last confirmed state of the lease while it is held.
    pub fn current_lease(&self) -> Option<LeaseState> {
        self.lease.borrow().clone()
    }

    /// Acquires the lease, waiting as long as it takes, then holds it until
    /// it is lost, released or [`stop`](Self::stop) is called.
    ///
    /// `notify` receives `Ok(())` when the lease is acquired and one `Err`
    /// when the hold ends, and is then closed. Receiving the `Err` means
    /// leader-only work must stop immediately. The only error returned
    /// directly is [`LeaseError::AlreadyRunning`].
    pub async fn acquire_and_hold(&self, notify: LeaseNotifier) -> Result<(), LeaseError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LeaseError::AlreadyRunning);
        }
        let _running = RunningGuard(self);

        let session = Session::new();
        *self.session_slot() = Some(session.clone());

        let reason = self.run_session(&session, &notify).await;

        self.session_slot().take();
        self.lease.send_replace(None);
        self.phase.send_replace(match reason {
            LeaseError::Released { .. } => HolderPhase::Released,
            _ => HolderPhase::Lost,
        });
        info!(key = %self.broker.key(), reason = %reason, "lease hold ended");

        let _ = notify.send(Err(reason));
        Ok(())
    }

    /// Gives up the lease if this holder owns it.
    ///
    /// Succeeds when the key is gone or held by someone else afterwards.
    /// Fails only when the store stayed unreachable for every attempt. A
    /// call that is still acquiring is not ended by a release; only a held
    /// lease is.
    pub async fn release(&self) -> Result<(), LeaseError> {
        let session = {
            let slot = self.session_slot();
            slot.clone().filter(|_| self.is_held())
        };
        if let Some(session) = &session {
            session.releasing.store(true, Ordering::SeqCst);
        }

        let strategy = FixedCountWithDelayStrategy::new(
            self.config.release_retries.max(1) as usize,
            self.config.retry_pause,
        );
        let broker = &*self.broker;
        match FutureRetry::new(move || broker.delete(), strategy).await {
            Ok((version, _)) => {
                info!(key = %self.broker.key(), version, "released lease");
                if let Some(session) = session {
                    session.released.cancel();
                }
                Ok(())
            }
            Err((StoreError::NotFound { .. }, _)) | Err((StoreError::Conflict { .. }, _)) => {
                if let Some(session) = session {
                    session.releasing.store(false, Ordering::SeqCst);
                }
                debug!(key = %self.broker.key(), "lease not held, nothing to release");
                Ok(())
            }
            Err((e, attempts)) => {
                if let Some(session) = session {
                    session.releasing.store(false, Ordering::SeqCst);
                }
                warn!(key = %self.broker.key(), attempts, error = %e, "failed to release lease");
                Err(e.into())
            }
        }
    }

    /// Ends a running `acquire_and_hold` with [`LeaseError::Cancelled`]
    /// without touching the store.
    pub async fn stop(&self) {
        if let Some(session) = self.session_slot().as_ref() {
            session.cancel.cancel();
        }
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_session(&self, session: &Session, notify: &LeaseNotifier) -> LeaseError {
        let mut background = Supervisor::new(&session.cancel);

        let client = self.broker.client();
        let token = background.token();
        background.spawn(
            "connectivity",
            run_with_fixed_delay(
                "connectivity",
                move |cancel| {
                    let client = client.clone();
                    async move { client.maintain_connectivity(cancel).await }
                },
                self.config.connectivity_delay,
                token,
            ),
        );

        self.phase.send_replace(HolderPhase::Acquiring);
        let taken = LeaseTaker::new(&self.broker, &self.config)
            .take(&session.cancel)
            .await;
        let state = match taken {
            Ok(state) => state,
            Err(reason) => {
                background.shutdown().await;
                return reason;
            }
        };

        self.phase.send_replace(HolderPhase::Held);
        self.lease.send_replace(Some(state.clone()));
        let _ = notify.send(Ok(()));

        let reason = self.hold(state, session, &mut background).await;
        background.shutdown().await;
        reason
    }

    async fn hold(
        &self,
        state: LeaseState,
        session: &Session,
        background: &mut Supervisor,
    ) -> LeaseError {
        // Each worker reports at most once; the first report wins.
        let (lost_tx, mut lost_rx) = mpsc::channel(2);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();

        let watcher = ExpirationWatcher::new(
            self.broker.clone(),
            self.config.watch_backoff,
            state.version,
        );
        background.spawn("expiration-watcher", watcher.run(lost_tx.clone()));

        let renewer = LeaseRenewer::new(self.broker.clone(), self.config.clone(), state);
        background.spawn("renewer", renewer.run(progress_tx, lost_tx));

        loop {
            tokio::select! {
                reason = lost_rx.recv() => {
                    let reason = reason.unwrap_or(LeaseError::Cancelled);
                    return match reason {
                        LeaseError::Deleted { key } if session.releasing.load(Ordering::SeqCst) => {
                            LeaseError::Released { key }
                        }
                        other => other,
                    };
                }
                Some(event) = progress_rx.recv() => match event {
                    RenewerEvent::Renewing => {
                        self.phase.send_replace(HolderPhase::Renewing);
                    }
                    RenewerEvent::Renewed(state) => {
                        self.phase.send_replace(HolderPhase::Held);
                        self.lease.send_replace(Some(state));
                    }
                },
                _ = session.released.cancelled() => {
                    return LeaseError::Released {
                        key: self.broker.key().to_string(),
                    };
                }
                _ = session.cancel.cancelled() => return LeaseError::Cancelled,
            }
        }
    }
}
