//! Background writer draining the bus persistence queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Event;
use crate::governor::Governor;
use crate::metrics;
use crate::store::{self, DurableStore, RetryPolicy, StoreError};

/// Events held back while the storage breaker is open.
pub const DEFERRED_CAPACITY: usize = 1_024;

/// How often held-back events are offered to the store again.
pub const DEFERRED_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the persistence worker.
///
/// Each queued event is written through the storage breaker with `retry`.
/// Events that meet an open breaker are held in order (up to
/// [`DEFERRED_CAPACITY`], oldest shed first) and written once the breaker
/// lets a trial through. When `shutdown` flips to `true` the queue is
/// closed and whatever is already buffered is drained before the task
/// exits.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<Event>,
    store: Arc<dyn DurableStore>,
    governor: Governor,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("event persistence worker started");
        let mut writer = Writer {
            store: &*store,
            governor: &governor,
            retry: &retry,
            deferred: VecDeque::new(),
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => writer.persist(event).await,
                    None => break,
                },
                _ = tokio::time::sleep(DEFERRED_RETRY_INTERVAL), if !writer.deferred.is_empty() => {
                    writer.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        rx.close();
                        let mut drained = 0usize;
                        while let Some(event) = rx.recv().await {
                            writer.persist(event).await;
                            drained += 1;
                        }
                        debug!(drained, "persistence queue drained");
                        break;
                    }
                }
            }
        }
        writer.flush().await;
        if !writer.deferred.is_empty() {
            warn!(
                dropped = writer.deferred.len(),
                "storage breaker still open at shutdown; held events dropped"
            );
        }
        info!("event persistence worker stopped");
    })
}

struct Writer<'a> {
    store: &'a dyn DurableStore,
    governor: &'a Governor,
    retry: &'a RetryPolicy,
    deferred: VecDeque<Event>,
}

impl Writer<'_> {
    async fn persist(&mut self, event: Event) {
        self.flush().await;
        if !self.deferred.is_empty() {
            self.hold(event);
            return;
        }
        let outcome = self.write(&event).await;
        if let Err(StoreError::Skipped { .. }) = outcome {
            self.hold(event);
        }
    }

    /// Write held events oldest first; stop at the first one the breaker
    /// turns away.
    async fn flush(&mut self) {
        while let Some(event) = self.deferred.pop_front() {
            let outcome = self.write(&event).await;
            if let Err(StoreError::Skipped { .. }) = outcome {
                self.deferred.push_front(event);
                return;
            }
        }
    }

    fn hold(&mut self, event: Event) {
        if self.deferred.len() >= DEFERRED_CAPACITY {
            self.deferred.pop_front();
            metrics::inc_persistence_failure("event_shed");
            warn!(capacity = DEFERRED_CAPACITY, "deferred event buffer full; oldest event shed");
        }
        self.deferred.push_back(event);
    }

    async fn write(&self, event: &Event) -> Result<(), StoreError> {
        // Failures are logged and counted inside guarded_write.
        store::guarded_write(self.governor, self.retry, "event", || {
            self.store.insert_event(event)
        })
        .await
    }
}
