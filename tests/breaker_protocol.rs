//! # Circuit breaker protocol
//!
//! Drives a breaker configured with threshold 3 through
//! Closed → Open → HalfOpen → Closed and HalfOpen → Open, with tokio's
//! clock paused so the recovery timeout elapses instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pod_evolution_kernel::config::BreakerSettings;
use pod_evolution_kernel::gateway::GatewayError;
use pod_evolution_kernel::governor::MODEL_GATEWAY_BREAKER;
use pod_evolution_kernel::notify::MemoryNotifier;
use pod_evolution_kernel::{
    BreakerState, GovernorError, Kernel, KernelConfig, KernelError, MemoryStore, ModelGateway,
};

const DEP: &str = "crm_api";

fn kernel_with(notifier: Option<Arc<MemoryNotifier>>) -> Kernel {
    let mut config = KernelConfig::default();
    config.breakers.insert(
        DEP.to_string(),
        BreakerSettings {
            failure_threshold: 3,
            recovery_timeout_s: 30,
        },
    );
    config.breakers.insert(
        MODEL_GATEWAY_BREAKER.to_string(),
        BreakerSettings {
            failure_threshold: 2,
            recovery_timeout_s: 60,
        },
    );
    let notifier = notifier.map(|n| n as Arc<dyn pod_evolution_kernel::NotificationSink>);
    Kernel::new(config, Arc::new(MemoryStore::new()), notifier).unwrap()
}

fn state(kernel: &Kernel, name: &str) -> Option<BreakerState> {
    kernel.breaker_status(name).map(|s| s.state)
}

#[tokio::test(start_paused = true)]
async fn test_full_state_machine() {
    let kernel = kernel_with(None);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Closed));

    kernel.record_failure(DEP);
    kernel.record_failure(DEP);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Closed));
    kernel.record_failure(DEP);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Open));

    let err = kernel.check_breaker(DEP).unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        KernelError::Governor(GovernorError::BreakerOpen { .. })
    ));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(kernel.check_breaker(DEP).is_err());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(kernel.check_breaker(DEP).is_ok());
    assert_eq!(state(&kernel, DEP), Some(BreakerState::HalfOpen));

    kernel.record_success(DEP);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Closed));
    assert_eq!(kernel.breaker_status(DEP).map(|s| s.consecutive_failures), Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens_immediately() {
    let kernel = kernel_with(None);
    for _ in 0..3 {
        kernel.record_failure(DEP);
    }
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(kernel.check_breaker(DEP).is_ok());
    assert_eq!(state(&kernel, DEP), Some(BreakerState::HalfOpen));

    kernel.record_failure(DEP);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Open));
    assert!(kernel.check_breaker(DEP).is_err());
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let kernel = kernel_with(None);
    kernel.record_failure(DEP);
    kernel.record_failure(DEP);
    kernel.record_success(DEP);
    kernel.record_failure(DEP);
    kernel.record_failure(DEP);
    assert_eq!(state(&kernel, DEP), Some(BreakerState::Closed));
}

#[tokio::test]
async fn test_unknown_breakers_are_allowed() {
    let kernel = kernel_with(None);
    kernel.record_failure("nope");
    assert!(kernel.check_breaker("nope").is_ok());
    assert!(kernel.breaker_status("nope").is_none());
    assert_eq!(kernel.breaker_statuses().len(), 4);
}

struct Down;

#[async_trait]
impl ModelGateway for Down {
    async fn call(&self, _prompt: &str, _task_type: &str) -> Result<String, GatewayError> {
        Err(GatewayError::ProviderExhausted("all providers down".into()))
    }
}

#[tokio::test]
async fn test_governed_gateway_opens_breaker_and_alerts() {
    let notifier = Arc::new(MemoryNotifier::new());
    let kernel = kernel_with(Some(Arc::clone(&notifier)));
    let gateway = kernel.gateway(Arc::new(Down), "janus");

    for _ in 0..2 {
        assert!(matches!(
            gateway.call("summarise the call", "summary").await,
            Err(GatewayError::ProviderExhausted(_))
        ));
    }
    assert_eq!(state(&kernel, MODEL_GATEWAY_BREAKER), Some(BreakerState::Open));
    assert!(matches!(
        gateway.call("summarise the call", "summary").await,
        Err(GatewayError::Governor(GovernorError::BreakerOpen { .. }))
    ));

    for _ in 0..50 {
        if !notifier.messages().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(notifier
        .messages()
        .iter()
        .any(|m| m.contains("circuit_breaker:model_gateway")));
}
