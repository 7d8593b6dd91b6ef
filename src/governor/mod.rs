//! # Constitution Governor
//!
//! ## Responsibility
//! Validate text against the constitution (an ordered rule set) and own the
//! bank of named circuit breakers every other component consults before
//! touching a dependency.
//!
//! ## Guarantees
//! - First matching rule decides; `Block` outcomes must stop the caller
//! - Every non-allowed outcome is logged, counted, kept in a bounded
//!   in-memory log, persisted best-effort and sent to the notification sink
//! - Notification and persistence failures never reach the caller
//! - Breaker state is mutated under a per-breaker lock
//!
//! ## NOT Responsible For
//! - Performing the gated call (callers do, then report the outcome)
//! - Choosing breaker names (configuration does)

pub mod breaker;
pub mod rules;

pub use breaker::{
    BreakerBank, BreakerConfig, BreakerState, BreakerStatus, Transition,
    EVOLUTION_CYCLE_BREAKER, MODEL_GATEWAY_BREAKER,
};
pub use rules::{default_rules, estimate_tokens, RuleConfig, RuleKind, RuleSet, Severity};

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::notify::NotificationSink;
use crate::store::{self, DurableStore, RetryPolicy};

/// Characters of offending text kept in a violation.
pub const SNIPPET_CHARS: usize = 100;

/// Default bound on the in-memory violation log.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 1_000;

// ─── Errors ────────────────────────────────────────────────────────────────

/// Errors raised by the governor.
#[derive(Debug, Error)]
pub enum GovernorError {
    /// The named breaker is open; try again after `retry_after`.
    #[error("circuit breaker '{name}' is open; retry in {retry_after:?}")]
    BreakerOpen {
        /// Breaker name.
        name: String,
        /// Time left until the breaker allows a trial call.
        retry_after: Duration,
    },

    /// A block-severity rule refused the action.
    #[error("constitution rule '{rule_id}' blocked the action: {reason}")]
    Violation {
        /// Rule that fired.
        rule_id: String,
        /// Why it fired.
        reason: String,
    },

    /// A configured rule cannot be compiled.
    #[error("invalid constitution rule '{rule}': {reason}")]
    InvalidRule {
        /// Rule id.
        rule: String,
        /// What is wrong.
        reason: String,
    },
}

// ─── Public types ──────────────────────────────────────────────────────────

/// Result of validating a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// No rule fired.
    Allowed,
    /// A rule fired. At `Warn` severity the caller may still proceed.
    Blocked {
        /// Rule that fired.
        rule_id: String,
        /// Its severity.
        severity: Severity,
        /// Why it fired.
        reason: String,
    },
}

impl ValidationOutcome {
    /// `true` only when no rule fired.
    pub fn is_allowed(&self) -> bool {
        matches!(self, ValidationOutcome::Allowed)
    }

    /// `true` when the caller may proceed (allowed, or warn-only).
    pub fn permits(&self) -> bool {
        match self {
            ValidationOutcome::Allowed => true,
            ValidationOutcome::Blocked { severity, .. } => *severity == Severity::Warn,
        }
    }
}

/// One recorded rule hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule that fired.
    pub rule_id: String,
    /// Its severity.
    pub severity: Severity,
    /// Pod whose text was validated.
    pub pod: String,
    /// Why the rule fired.
    pub reason: String,
    /// First [`SNIPPET_CHARS`] characters of the text.
    pub snippet: String,
    /// When the violation was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    fn alert_text(&self) -> String {
        format!(
            "Constitution violation\nRule: `{}` ({})\nPod: `{}`\nSnippet: `{}`",
            self.rule_id,
            self.severity.as_str(),
            self.pod,
            self.snippet
        )
    }
}

// ─── Governor ──────────────────────────────────────────────────────────────

struct GovernorInner {
    rules: RuleSet,
    breakers: BreakerBank,
    violations: Mutex<VecDeque<Violation>>,
    violation_capacity: usize,
    store: Option<Arc<dyn DurableStore>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    retry: RetryPolicy,
}

/// Shared constitution validator and breaker bank.
///
/// Cheap to clone: all clones share the same state.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<GovernorInner>,
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("rules", &self.inner.rules.ids())
            .field("breakers", &self.inner.breakers.statuses().len())
            .field("violations", &self.inner.violations.lock().len())
            .finish_non_exhaustive()
    }
}

impl Governor {
    /// Start building a governor.
    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::default()
    }

    /// Validate `text` produced or consumed by `pod`.
    ///
    /// Every non-allowed outcome is recorded as a [`Violation`].
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn validate(&self, text: &str, pod: &str) -> ValidationOutcome {
        let Some(hit) = self.inner.rules.evaluate(text, pod) else {
            return ValidationOutcome::Allowed;
        };

        let rule_id = hit.rule.id().to_string();
        let severity = hit.rule.severity();
        match severity {
            Severity::Block => warn!(pod, rule = %rule_id, reason = %hit.reason, "constitution: blocked"),
            Severity::Warn => info!(pod, rule = %rule_id, reason = %hit.reason, "constitution: warning"),
        }
        metrics::inc_violation(&rule_id, severity.as_str());

        let violation = Violation {
            rule_id: rule_id.clone(),
            severity,
            pod: pod.to_string(),
            reason: hit.reason.clone(),
            snippet: text.chars().take(SNIPPET_CHARS).collect(),
            timestamp: Utc::now(),
        };
        self.record_violation(violation);

        ValidationOutcome::Blocked {
            rule_id,
            severity,
            reason: hit.reason,
        }
    }

    /// Validate and turn a block-severity hit into an error.
    ///
    /// # Errors
    ///
    /// [`GovernorError::Violation`] when a `Block` rule fires. Warn-level
    /// hits are returned as `Ok` so the caller can still see them.
    pub fn guard(&self, text: &str, pod: &str) -> Result<ValidationOutcome, GovernorError> {
        match self.validate(text, pod) {
            ValidationOutcome::Blocked {
                rule_id,
                severity: Severity::Block,
                reason,
            } => Err(GovernorError::Violation { rule_id, reason }),
            outcome => Ok(outcome),
        }
    }

    fn record_violation(&self, violation: Violation) {
        {
            let mut log = self.inner.violations.lock();
            log.push_back(violation.clone());
            while log.len() > self.inner.violation_capacity {
                log.pop_front();
            }
        }

        self.alert(violation.alert_text());

        if let Some(store) = &self.inner.store {
            let store = Arc::clone(store);
            let governor = self.clone();
            spawn_background(async move {
                let _ = store::guarded_write(&governor, &governor.inner.retry, "violation", || {
                    store.insert_violation(&violation)
                })
                .await;
            });
        }
    }

    fn alert(&self, message: String) {
        let Some(notifier) = &self.inner.notifier else {
            return;
        };
        let notifier = Arc::clone(notifier);
        spawn_background(async move {
            if let Err(e) = notifier.notify(&message).await {
                debug!(error = %e, "alert delivery failed (ignored)");
            }
        });
    }

    /// Recorded violations, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.inner.violations.lock().iter().cloned().collect()
    }

    /// Rule ids in priority order.
    pub fn rule_ids(&self) -> Vec<String> {
        self.inner.rules.ids().into_iter().map(str::to_string).collect()
    }

    // ── Breakers ───────────────────────────────────────────────────────────

    /// Gate a call on breaker `name`. Unknown names are always allowed.
    ///
    /// # Errors
    ///
    /// [`GovernorError::BreakerOpen`] while the breaker is open.
    pub fn check_breaker(&self, name: &str) -> Result<(), GovernorError> {
        if let Some(transition) = self.inner.breakers.check(name)? {
            self.on_transition(name, transition);
        }
        Ok(())
    }

    /// Report a successful gated call.
    pub fn record_success(&self, name: &str) {
        if let Some(transition) = self.inner.breakers.record_success(name) {
            self.on_transition(name, transition);
        }
    }

    /// Report a failed gated call.
    pub fn record_failure(&self, name: &str) {
        if let Some(transition) = self.inner.breakers.record_failure(name) {
            self.on_transition(name, transition);
        }
    }

    /// Force a breaker closed. Returns `false` for unknown names.
    pub fn reset_breaker(&self, name: &str) -> bool {
        let known = self.inner.breakers.reset(name);
        if known {
            metrics::inc_breaker_transition(name, BreakerState::Closed);
        }
        known
    }

    /// Force a breaker open. Returns `false` for unknown names.
    pub fn trip_breaker(&self, name: &str) -> bool {
        let known = self.inner.breakers.trip(name);
        if known {
            metrics::inc_breaker_transition(name, BreakerState::Open);
        }
        known
    }

    /// Snapshot of one breaker, `None` for unknown names.
    pub fn breaker_status(&self, name: &str) -> Option<BreakerStatus> {
        self.inner.breakers.status(name)
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.inner.breakers.statuses()
    }

    fn on_transition(&self, name: &str, transition: Transition) {
        metrics::inc_breaker_transition(name, transition.to_state());
        if let Transition::Opened { failures } = transition {
            let recovery = self
                .inner
                .breakers
                .recovery_timeout(name)
                .unwrap_or_default();
            self.alert(format!(
                "Rule: `circuit_breaker:{name}`\nPod: `kernel`\nBreaker opened after {failures} failures. Recovery in {}s.",
                recovery.as_secs()
            ));
        }
    }
}

/// Run a future on the current tokio runtime, or drop it when called from
/// outside one.
pub(crate) fn spawn_background<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
        }
        Err(_) => debug!("no tokio runtime; background task skipped"),
    }
}

// ─── Builder ───────────────────────────────────────────────────────────────

/// Builder for [`Governor`].
pub struct GovernorBuilder {
    rules: Option<RuleSet>,
    breakers: HashMap<String, BreakerConfig>,
    violation_capacity: usize,
    store: Option<Arc<dyn DurableStore>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    retry: RetryPolicy,
}

impl Default for GovernorBuilder {
    fn default() -> Self {
        Self {
            rules: None,
            breakers: BreakerConfig::defaults(),
            violation_capacity: DEFAULT_VIOLATION_CAPACITY,
            store: None,
            notifier: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl GovernorBuilder {
    /// Use a compiled rule set instead of the built-in one.
    pub fn rules(mut self, rules: RuleSet) -> Self {
        self.rules = Some(rules);
        self
    }

    /// Replace the breaker table.
    pub fn breakers(mut self, breakers: HashMap<String, BreakerConfig>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Bound on the in-memory violation log.
    pub fn violation_capacity(mut self, capacity: usize) -> Self {
        self.violation_capacity = capacity.max(1);
        self
    }

    /// Persist violations to this store.
    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Send alerts to this sink.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Retry policy for violation writes.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Finish building.
    pub fn build(self) -> Governor {
        let rules = self.rules.unwrap_or_else(|| {
            RuleSet::defaults().unwrap_or_else(|e| {
                error!(error = %e, "built-in constitution failed to compile; running without rules");
                RuleSet::default()
            })
        });
        info!(
            rules = rules.len(),
            breakers = self.breakers.len(),
            "constitution loaded"
        );
        Governor {
            inner: Arc::new(GovernorInner {
                rules,
                breakers: BreakerBank::new(self.breakers),
                violations: Mutex::new(VecDeque::new()),
                violation_capacity: self.violation_capacity,
                store: self.store,
                notifier: self.notifier,
                retry: self.retry,
            }),
        }
    }
}
