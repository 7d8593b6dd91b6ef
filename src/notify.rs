//! # Notification sinks
//!
//! ## Responsibility
//! Deliver short operator alerts (constitution violations, breakers opening)
//! to wherever operators look.
//!
//! ## Guarantees
//! - Delivery is best-effort; callers spawn it and swallow the result
//! - The webhook sink never waits longer than its timeout
//!
//! ## NOT Responsible For
//! - Deciding what to alert on (see [`crate::governor`])

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

/// Delivery failure.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The sink could not deliver the message.
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Where operator alerts go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one message.
    async fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

/// Writes alerts to the tracing log at `INFO`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        info!(target: "kernel::alert", alert = message, "operator alert");
        Ok(())
    }
}

/// Keeps every delivered alert in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    messages: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    pending_failures: AtomicUsize,
}

impl MemoryNotifier {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    /// Make the next `n` deliveries fail; failed messages are not kept.
    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Deliveries attempted, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for MemoryNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NotifyError::Delivery("injected failure".to_string()));
        }
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

/// Posts `{"text": message}` to an incoming-webhook URL (Slack style).
#[cfg(feature = "webhook")]
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "webhook")]
impl WebhookNotifier {
    /// Per-request timeout.
    pub const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    /// Build a notifier for `url`.
    ///
    /// # Errors
    ///
    /// [`NotifyError::Delivery`] if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(())
    }
}
