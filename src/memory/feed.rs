use std::collections::VecDeque;

use futures::{stream, StreamExt};
use tokio::sync::{broadcast, broadcast::error::RecvError, watch};

use crate::{
    error::StoreError,
    interface::store::{WatchEvent, WatchStream},
};

/// Per-watcher view of the store's event log: replayed history first, then
/// live events, filtered to one key.
pub(super) struct WatchFeed {
    key: String,
    next: u64,
    backlog: VecDeque<WatchEvent>,
    events: broadcast::Receiver<WatchEvent>,
    partition: watch::Receiver<bool>,
    done: bool,
}

impl WatchFeed {
    pub(super) fn new(
        key: String,
        next: u64,
        backlog: VecDeque<WatchEvent>,
        events: broadcast::Receiver<WatchEvent>,
        partition: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key,
            next,
            backlog,
            events,
            partition,
            done: false,
        }
    }

    pub(super) fn into_stream(self) -> WatchStream {
        stream::unfold(self, |mut feed| async move {
            let item = feed.next_item().await?;
            Some((item, feed))
        })
        .boxed()
    }

    async fn next_item(&mut self) -> Option<Result<WatchEvent, StoreError>> {
        if self.done {
            return None;
        }
        // A partition that began before this feed subscribed is already
        // marked seen, so `changed()` would never report it.
        if *self.partition.borrow_and_update() {
            self.done = true;
            return Some(Err(StoreError::Unavailable(
                "watch severed by partition".to_string(),
            )));
        }
        if let Some(event) = self.backlog.pop_front() {
            self.next = event.version + 1;
            return Some(Ok(event));
        }

        loop {
            tokio::select! {
                changed = self.partition.changed() => {
                    if changed.is_err() {
                        self.done = true;
                        return None;
                    }
                    if *self.partition.borrow() {
                        self.done = true;
                        return Some(Err(StoreError::Unavailable(
                            "watch severed by partition".to_string(),
                        )));
                    }
                }
                received = self.events.recv() => match received {
                    Ok(event) => {
                        if event.key == self.key && event.version >= self.next {
                            self.next = event.version + 1;
                            return Some(Ok(event));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        self.done = true;
                        return Some(Err(StoreError::Compacted {
                            requested: self.next,
                            oldest: self.next + skipped,
                        }));
                    }
                    Err(RecvError::Closed) => {
                        self.done = true;
                        return None;
                    }
                },
            }
        }
    }
}
