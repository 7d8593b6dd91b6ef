//! # Model gateway boundary
//!
//! ## Responsibility
//! Define the contract for reaching a language model and wrap any
//! implementation so every call is gated by the `model_gateway` breaker and
//! the constitution.
//!
//! ## Guarantees
//! - A blocked prompt never reaches the inner gateway
//! - Every call that reaches the inner gateway reports its outcome to the breaker
//!
//! ## NOT Responsible For
//! - Provider selection, fallback ordering or caching (the inner gateway's job)

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::governor::{Governor, GovernorError, MODEL_GATEWAY_BREAKER};

/// Failures surfaced by a model gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Every configured provider failed or was unavailable.
    #[error("all model providers exhausted: {0}")]
    ProviderExhausted(String),

    /// The governor refused the call (breaker open or blocked prompt).
    #[error(transparent)]
    Governor(#[from] GovernorError),

    /// Any other call failure.
    #[error("model call failed: {0}")]
    Call(String),
}

/// Opaque access to a language model.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send `prompt` for a task of kind `task_type`; returns the model text.
    async fn call(&self, prompt: &str, task_type: &str) -> Result<String, GatewayError>;
}

/// A [`ModelGateway`] that consults the [`Governor`] around every call.
///
/// Fitness providers hold one of these to reach a model on behalf of their
/// pod; the pod id is used for constitution validation and rate limiting.
pub struct GovernedGateway {
    inner: Arc<dyn ModelGateway>,
    governor: Governor,
    pod: String,
}

impl GovernedGateway {
    /// Wrap `inner` for calls made on behalf of `pod`.
    pub fn new(inner: Arc<dyn ModelGateway>, governor: Governor, pod: impl Into<String>) -> Self {
        Self {
            inner,
            governor,
            pod: pod.into(),
        }
    }
}

#[async_trait]
impl ModelGateway for GovernedGateway {
    async fn call(&self, prompt: &str, task_type: &str) -> Result<String, GatewayError> {
        self.governor.check_breaker(MODEL_GATEWAY_BREAKER)?;
        self.governor.guard(prompt, &self.pod)?;

        match self.inner.call(prompt, task_type).await {
            Ok(text) => {
                self.governor.record_success(MODEL_GATEWAY_BREAKER);
                debug!(pod = %self.pod, task_type, "model call succeeded");
                Ok(text)
            }
            Err(e) => {
                self.governor.record_failure(MODEL_GATEWAY_BREAKER);
                warn!(pod = %self.pod, task_type, error = %e, "model call failed");
                Err(e)
            }
        }
    }
}
