//! # pod-evolution-kernel
//!
//! An autonomous improvement kernel for independent agent "pods". Each pod
//! evolves its own behavioural parameters through a genetic search, all pods
//! share one constitutional governor (content rules plus named circuit
//! breakers), and a lightweight event bus ties activity, evolution triggers
//! and cross-pod signals together.
//!
//! ## Architecture
//!
//! ```text
//! pod activity ─► EventBus::publish ─┬─► subscribers (sync, in order)
//!                                    ├─► TriggerScheduler (count, threshold)
//!                                    ├─► persistence queue (async, retried)
//!                                    └─► cross-pod routes (bounded hops)
//!
//! TriggerScheduler ─► EvolutionEngine::run_cycle ─► Governor breaker gate
//!                                 │
//!                                 ├─► FitnessProvider (per individual, timeout)
//!                                 ├─► DurableStore (best effort)
//!                                 └─► GeneSchema::decode ─► pod applies params
//! ```
//!
//! Every component is constructed explicitly and owned by a [`Kernel`];
//! there is no ambient global state.

// ── Lint policy ──────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod bus;
pub mod config;
pub mod evolution;
pub mod gateway;
pub mod genome;
pub mod governor;
pub mod kernel;
pub mod metrics;
pub mod notify;
pub mod scheduler;
pub mod store;

// Re-exports for convenience
pub use bus::{BusError, Event, EventBus, HandlerError, PublishReport, SubscriptionToken};
pub use config::{ConfigError, KernelConfig};
pub use evolution::{EvolutionConfig, EvolutionEngine, EvolutionError, EvolutionRecord};
pub use gateway::{GatewayError, GovernedGateway, ModelGateway};
pub use genome::{
    DecodedParams, FitnessError, FitnessProvider, FnFitness, GeneSchema, Genome, ParamValue,
    PodRegistry, RegistryError,
};
pub use governor::{BreakerState, Governor, GovernorError, Severity, ValidationOutcome};
pub use kernel::{Kernel, KernelHandles};
pub use notify::NotificationSink;
pub use scheduler::{SchedulerConfig, TriggerScheduler};
pub use store::{DurableStore, MemoryStore, NullStore, StoreError};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON lines for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`KernelError::Other`] if a global subscriber has already been
/// installed (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), KernelError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| KernelError::Other(format!("tracing init failed: {e}")))
}

/// Top-level kernel errors.
///
/// Every subsystem error converts into this type so the surrounding service
/// layer has a single surface to match on.
#[derive(Error, Debug)]
pub enum KernelError {
    /// Pod registration or lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An evolution cycle could not start or failed.
    #[error(transparent)]
    Evolution(#[from] EvolutionError),

    /// The governor refused a gated action.
    #[error(transparent)]
    Governor(#[from] GovernorError),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A subscription pattern was rejected.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A durable write failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A governed model call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl KernelError {
    /// `true` when the condition is transient and the caller should report
    /// "not now, try later" rather than a hard failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            KernelError::Evolution(e) => e.is_retryable(),
            KernelError::Governor(GovernorError::BreakerOpen { .. }) => true,
            KernelError::Gateway(GatewayError::Governor(GovernorError::BreakerOpen { .. })) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_breaker_open_is_retryable() {
        let err = KernelError::Governor(GovernorError::BreakerOpen {
            name: "model_gateway".to_string(),
            retry_after: Duration::from_secs(10),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_already_running_is_retryable() {
        let err = KernelError::Evolution(EvolutionError::AlreadyRunning {
            pod: "aurora".to_string(),
        });
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_pod_is_not_retryable() {
        let err = KernelError::Registry(RegistryError::UnknownPod {
            pod: "ghost".to_string(),
        });
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_bus_error_converts() {
        let err: KernelError = BusError::QueueFull.into();
        assert!(!err.is_retryable());
        assert!(matches!(err, KernelError::Bus(_)));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
