//! Named circuit breakers.
//!
//! Prevents cascading failures by stopping calls to a failing dependency
//! until it is likely to have recovered.
//!
//! ## States
//! - **Closed**: Normal operation, calls flow through
//! - **Open**: Dependency failing, calls rejected until the recovery timeout
//! - **HalfOpen**: Recovery timeout elapsed; the next outcome decides
//!
//! Transitions are `Closed → Open → HalfOpen → {Closed | Open}`; no state is
//! skipped. Each breaker sits behind its own lock, so callers touching
//! different breakers never contend.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::GovernorError;

/// Breaker guarding the model gateway.
pub const MODEL_GATEWAY_BREAKER: &str = "model_gateway";
/// Breaker guarding evolution cycles.
pub const EVOLUTION_CYCLE_BREAKER: &str = "evolution_cycle";

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// One trial period: the next success closes, the next failure reopens.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Threshold and recovery timeout for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a trial call.
    pub recovery_timeout: Duration,
}

impl BreakerConfig {
    /// The kernel's standard breakers: `model_gateway` (5 / 60 s),
    /// `storage` (3 / 30 s) and `evolution_cycle` (2 / 300 s).
    pub fn defaults() -> HashMap<String, BreakerConfig> {
        [
            (MODEL_GATEWAY_BREAKER, 5, 60),
            (crate::store::STORAGE_BREAKER, 3, 30),
            (EVOLUTION_CYCLE_BREAKER, 2, 300),
        ]
        .into_iter()
        .map(|(name, threshold, secs)| {
            (
                name.to_string(),
                BreakerConfig {
                    failure_threshold: threshold,
                    recovery_timeout: Duration::from_secs(secs),
                },
            )
        })
        .collect()
    }
}

/// A state change caused by one call into the bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed or HalfOpen became Open.
    Opened {
        /// Consecutive failures at the moment of opening.
        failures: u32,
    },
    /// Open became HalfOpen.
    HalfOpened,
    /// HalfOpen (or a manual reset) became Closed.
    Closed,
}

impl Transition {
    /// State entered by this transition.
    pub fn to_state(self) -> BreakerState {
        match self {
            Transition::Opened { .. } => BreakerState::Open,
            Transition::HalfOpened => BreakerState::HalfOpen,
            Transition::Closed => BreakerState::Closed,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Configured recovery timeout.
    pub recovery_timeout: Duration,
    /// Wall-clock time the breaker last opened.
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_wall = Some(Utc::now());
    }
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Fixed table of named breakers, built once from configuration.
///
/// Unknown names are treated as always-closed: `check` allows them and
/// `record_*` ignores them.
#[derive(Debug)]
pub struct BreakerBank {
    breakers: HashMap<String, Breaker>,
}

impl BreakerBank {
    /// Build a bank with one closed breaker per configured name.
    pub fn new(configs: HashMap<String, BreakerConfig>) -> Self {
        let breakers = configs
            .into_iter()
            .map(|(name, config)| {
                (
                    name,
                    Breaker {
                        config,
                        inner: Mutex::new(BreakerInner {
                            state: BreakerState::Closed,
                            failures: 0,
                            opened_at: None,
                            opened_wall: None,
                        }),
                    },
                )
            })
            .collect();
        Self { breakers }
    }

    /// Gate a call on breaker `name`.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to HalfOpen
    /// and allows the call; the transition is returned so the caller can
    /// report it.
    ///
    /// # Errors
    ///
    /// [`GovernorError::BreakerOpen`] while the breaker is open and the
    /// recovery timeout has not elapsed.
    pub fn check(&self, name: &str) -> Result<Option<Transition>, GovernorError> {
        let Some(breaker) = self.breakers.get(name) else {
            return Ok(None);
        };
        let mut inner = breaker.inner.lock();

        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(None),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= breaker.config.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = name, "circuit breaker: transitioning to half-open");
                    Ok(Some(Transition::HalfOpened))
                } else {
                    debug!(breaker = name, "circuit breaker: call rejected (open)");
                    Err(GovernorError::BreakerOpen {
                        name: name.to_string(),
                        retry_after: breaker.config.recovery_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call: clears the failure count and closes a
    /// half-open breaker.
    pub fn record_success(&self, name: &str) -> Option<Transition> {
        let breaker = self.breakers.get(name)?;
        let mut inner = breaker.inner.lock();
        inner.failures = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            info!(breaker = name, "circuit breaker: closing (dependency recovered)");
            return Some(Transition::Closed);
        }
        None
    }

    /// Record a failed call: counts it, opens a closed breaker at the
    /// threshold, and reopens a half-open breaker immediately.
    pub fn record_failure(&self, name: &str) -> Option<Transition> {
        let breaker = self.breakers.get(name)?;
        let mut inner = breaker.inner.lock();
        inner.failures = inner.failures.saturating_add(1);

        warn!(
            breaker = name,
            state = %inner.state,
            failures = inner.failures,
            threshold = breaker.config.failure_threshold,
            "circuit breaker: failure recorded"
        );

        match inner.state {
            BreakerState::Closed if inner.failures >= breaker.config.failure_threshold => {
                inner.open();
                warn!(
                    breaker = name,
                    failures = inner.failures,
                    recovery_s = breaker.config.recovery_timeout.as_secs(),
                    "circuit breaker: opening (threshold reached)"
                );
                Some(Transition::Opened {
                    failures: inner.failures,
                })
            }
            BreakerState::HalfOpen => {
                inner.open();
                warn!(breaker = name, "circuit breaker: reopening (half-open trial failed)");
                Some(Transition::Opened {
                    failures: inner.failures,
                })
            }
            _ => None,
        }
    }

    /// Manually reset a breaker to Closed. Returns `false` for unknown names.
    pub fn reset(&self, name: &str) -> bool {
        let Some(breaker) = self.breakers.get(name) else {
            return false;
        };
        let mut inner = breaker.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        info!(breaker = name, "circuit breaker: manually reset to closed");
        true
    }

    /// Force a breaker open (maintenance, tests). Returns `false` for
    /// unknown names.
    pub fn trip(&self, name: &str) -> bool {
        let Some(breaker) = self.breakers.get(name) else {
            return false;
        };
        breaker.inner.lock().open();
        warn!(breaker = name, "circuit breaker: manually tripped to open");
        true
    }

    /// Recovery timeout of a configured breaker.
    pub fn recovery_timeout(&self, name: &str) -> Option<Duration> {
        self.breakers.get(name).map(|b| b.config.recovery_timeout)
    }

    /// Snapshot of one breaker, `None` for unknown names.
    pub fn status(&self, name: &str) -> Option<BreakerStatus> {
        let breaker = self.breakers.get(name)?;
        let inner = breaker.inner.lock();
        Some(BreakerStatus {
            name: name.to_string(),
            state: inner.state,
            consecutive_failures: inner.failures,
            failure_threshold: breaker.config.failure_threshold,
            recovery_timeout: breaker.config.recovery_timeout,
            opened_at: inner.opened_wall,
        })
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut names: Vec<&String> = self.breakers.keys().collect();
        names.sort();
        names.into_iter().filter_map(|n| self.status(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(threshold: u32, timeout: Duration) -> BreakerBank {
        let mut configs = HashMap::new();
        configs.insert(
            "dep".to_string(),
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: timeout,
            },
        );
        BreakerBank::new(configs)
    }

    fn state(bank: &BreakerBank) -> BreakerState {
        bank.status("dep").map(|s| s.state).unwrap()
    }

    #[test]
    fn test_circuit_opens_on_failures() {
        let bank = bank(3, Duration::from_secs(5));

        assert_eq!(bank.record_failure("dep"), None);
        assert_eq!(bank.record_failure("dep"), None);
        assert_eq!(
            bank.record_failure("dep"),
            Some(Transition::Opened { failures: 3 })
        );

        assert_eq!(state(&bank), BreakerState::Open);
        assert!(matches!(
            bank.check("dep"),
            Err(GovernorError::BreakerOpen { .. })
        ));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let bank = bank(3, Duration::from_secs(5));
        bank.record_failure("dep");
        bank.record_failure("dep");
        bank.record_success("dep");
        bank.record_failure("dep");
        assert_eq!(state(&bank), BreakerState::Closed);
        assert_eq!(bank.status("dep").unwrap().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes_on_success() {
        let bank = bank(2, Duration::from_secs(30));
        bank.record_failure("dep");
        bank.record_failure("dep");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(bank.check("dep").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bank.check("dep").unwrap(), Some(Transition::HalfOpened));
        assert_eq!(state(&bank), BreakerState::HalfOpen);

        // Still half-open: further checks are allowed without a new transition.
        assert_eq!(bank.check("dep").unwrap(), None);

        assert_eq!(bank.record_success("dep"), Some(Transition::Closed));
        assert_eq!(state(&bank), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_immediately() {
        let bank = bank(5, Duration::from_secs(10));
        assert!(bank.trip("dep"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(bank.check("dep").is_ok());

        assert!(matches!(
            bank.record_failure("dep"),
            Some(Transition::Opened { .. })
        ));
        assert_eq!(state(&bank), BreakerState::Open);
        assert!(bank.check("dep").is_err(), "reopen restarts the timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_reports_remaining_time() {
        let bank = bank(1, Duration::from_secs(60));
        bank.record_failure("dep");
        tokio::time::advance(Duration::from_secs(45)).await;
        match bank.check("dep") {
            Err(GovernorError::BreakerOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(15));
            }
            other => panic!("expected BreakerOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_success_while_open_does_not_close() {
        let bank = bank(1, Duration::from_secs(60));
        bank.record_failure("dep");
        assert_eq!(bank.record_success("dep"), None);
        assert_eq!(state(&bank), BreakerState::Open);
    }

    #[test]
    fn test_manual_reset() {
        let bank = bank(2, Duration::from_secs(60));
        bank.record_failure("dep");
        bank.record_failure("dep");
        assert_eq!(state(&bank), BreakerState::Open);

        assert!(bank.reset("dep"));
        assert_eq!(state(&bank), BreakerState::Closed);
        assert!(bank.check("dep").is_ok());
    }

    #[test]
    fn test_unknown_breaker_is_allowed_and_ignored() {
        let bank = bank(1, Duration::from_secs(1));
        assert!(bank.check("nope").is_ok());
        assert_eq!(bank.record_failure("nope"), None);
        assert_eq!(bank.record_success("nope"), None);
        assert!(bank.status("nope").is_none());
        assert!(!bank.reset("nope"));
        assert!(!bank.trip("nope"));
    }

    #[test]
    fn test_defaults_carry_standard_thresholds() {
        let defaults = BreakerConfig::defaults();
        assert_eq!(defaults["model_gateway"].failure_threshold, 5);
        assert_eq!(defaults["storage"].recovery_timeout, Duration::from_secs(30));
        assert_eq!(defaults["evolution_cycle"].failure_threshold, 2);
        assert_eq!(
            defaults["evolution_cycle"].recovery_timeout,
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_statuses_sorted_by_name() {
        let bank = BreakerBank::new(BreakerConfig::defaults());
        let names: Vec<String> = bank.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["evolution_cycle", "model_gateway", "storage"]);
    }
}
