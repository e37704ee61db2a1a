use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Owns a set of background tasks that share one cancellation token.
///
/// Tasks never outlive the supervisor: dropping it cancels them and
/// [`Supervisor::shutdown`] also waits for them to unwind.
pub(crate) struct Supervisor {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            handles: Vec::new(),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(task = name, "background task cancelled"),
                _ = task => debug!(task = name, "background task finished"),
            }
        }));
    }

    pub(crate) async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "background task panicked");
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `task` repeatedly, pausing `delay` between runs, until `cancel` fires.
/// Failures are logged and never end the loop.
pub(crate) async fn run_with_fixed_delay<F, Fut>(
    name: &'static str,
    mut task: F,
    delay: Duration,
    cancel: CancellationToken,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = task(cancel.clone()) => result,
        };

        if let Err(e) = result {
            warn!(task = name, error = %e, "background task failed, retrying");
        }
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
