//! # Durable Store
//!
//! ## Responsibility
//! Define the narrow persistence contract the kernel writes through, and
//! provide the in-process implementations used by tests and the demo.
//!
//! ## Guarantees
//! - Writes are append-only and safe to retry
//! - A failed write never changes in-memory kernel state
//! - Every guarded write is gated by the `"storage"` breaker and reports its
//!   outcome to it
//!
//! ## NOT Responsible For
//! - Choosing a database engine (callers supply their own [`DurableStore`])
//! - Scheduling background retries (see [`crate::bus`] and [`crate::evolution`])

pub mod retry;

pub use retry::{RetryPolicy, RetryStrategy};

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::bus::Event;
use crate::evolution::EvolutionRecord;
use crate::governor::{Governor, Violation};
use crate::metrics;

/// Breaker consulted before every durable write.
pub const STORAGE_BREAKER: &str = "storage";

/// Persistence failures. Always logged, never fatal to the kernel.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The backend rejected or failed the write.
    #[error("{kind} write failed: {reason}")]
    WriteFailed {
        /// What was being written (`event`, `evolution_record`, `violation`).
        kind: String,
        /// Backend-specific reason.
        reason: String,
    },

    /// The storage breaker is open, so the write was not attempted.
    #[error("storage breaker open; {kind} write skipped")]
    Skipped {
        /// What was being written.
        kind: String,
    },
}

/// Append-only persistence for kernel artefacts.
///
/// Implementations must tolerate concurrent writers; the kernel takes no
/// global write lock.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist a completed cycle's record.
    async fn insert_evolution_record(&self, record: &EvolutionRecord) -> Result<(), StoreError>;

    /// Persist a published event.
    async fn insert_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Persist a constitution violation.
    async fn insert_violation(&self, violation: &Violation) -> Result<(), StoreError>;
}

/// Run a write through the storage breaker and the retry policy.
///
/// The breaker sees one outcome per logical write, not one per attempt.
pub(crate) async fn guarded_write<F, Fut>(
    governor: &Governor,
    policy: &RetryPolicy,
    kind: &str,
    write: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    if governor.check_breaker(STORAGE_BREAKER).is_err() {
        metrics::inc_persistence_failure(kind);
        return Err(StoreError::Skipped {
            kind: kind.to_string(),
        });
    }

    match policy.retry(write).await {
        Ok(()) => {
            governor.record_success(STORAGE_BREAKER);
            Ok(())
        }
        Err(e) => {
            governor.record_failure(STORAGE_BREAKER);
            metrics::inc_persistence_failure(kind);
            warn!(kind, error = %e, "durable write failed after retries");
            Err(e)
        }
    }
}

// ── In-memory store ────────────────────────────────────────────────────────

/// In-process store backed by append-only vectors.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<EvolutionRecord>>,
    events: Mutex<Vec<Event>>,
    violations: Mutex<Vec<Violation>>,
    pending_failures: AtomicUsize,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes (of any kind) fail.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self, kind: &str) -> Result<(), StoreError> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::WriteFailed {
                kind: kind.to_string(),
                reason: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// All stored records, oldest first.
    pub fn records(&self) -> Vec<EvolutionRecord> {
        self.records.lock().clone()
    }

    /// All stored events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// All stored violations, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Up to `limit` records for `pod`, newest first.
    pub fn evolution_history(&self, pod: &str, limit: usize) -> Vec<EvolutionRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.pod_id == pod)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_evolution_record(&self, record: &EvolutionRecord) -> Result<(), StoreError> {
        self.take_failure("evolution_record")?;
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn insert_event(&self, event: &Event) -> Result<(), StoreError> {
        self.take_failure("event")?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<(), StoreError> {
        self.take_failure("violation")?;
        self.violations.lock().push(violation.clone());
        Ok(())
    }
}

/// Store that accepts and discards every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl DurableStore for NullStore {
    async fn insert_evolution_record(&self, _record: &EvolutionRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_event(&self, _event: &Event) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_violation(&self, _violation: &Violation) -> Result<(), StoreError> {
        Ok(())
    }
}
