//! # Kernel Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML document that tunes the kernel: search
//! parameters, trigger policy, routing table, breaker thresholds and the
//! constitution.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `KernelConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete: every field has a documented default, so an empty document is
//!   a valid configuration
//!
//! ## NOT Responsible For
//! - Building components from the config (see [`crate::kernel`])
//!
//! # Example
//!
//! ```toml
//! [evolution]
//! population_size = 30
//! generations = 8
//!
//! [scheduler]
//! event_threshold = 25
//!
//! [breakers.model_gateway]
//! failure_threshold = 5
//! recovery_timeout_s = 60
//!
//! [[bus.routes]]
//! source = "aurora.booking_failed"
//! target_pod = "syntropy"
//! target_action = "generate_resource"
//!
//! [[constitution.rules]]
//! id = "no_pii_storage"
//! severity = "block"
//! type = "content"
//! patterns = ['\b[\w.+-]+@[\w-]+\.[\w.-]+\b']
//! ```

pub mod loader;
pub mod validation;

pub use loader::{load_from_file, load_from_str};
pub use validation::{validate, ConfigError};

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{default_routes, CrossPodRoute, DEFAULT_MAX_DEPTH, DEFAULT_PERSIST_CAPACITY};
use crate::evolution::EvolutionConfig;
use crate::governor::{
    BreakerConfig, GovernorError, RuleConfig, RuleSet, DEFAULT_VIOLATION_CAPACITY,
};
use crate::scheduler::SchedulerConfig;
use crate::store::RetryPolicy;

// ── Default value functions ──────────────────────────────────────────────

fn default_max_depth() -> u8 {
    DEFAULT_MAX_DEPTH
}

/// Default persistence queue capacity: 1024 events.
fn default_persist_capacity() -> usize {
    DEFAULT_PERSIST_CAPACITY
}

fn default_violation_capacity() -> usize {
    DEFAULT_VIOLATION_CAPACITY
}

/// Default write attempts: 3.
fn default_retry_attempts() -> usize {
    3
}

/// Default initial retry delay: 100ms.
fn default_retry_base_ms() -> u64 {
    100
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a kernel instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Genetic search parameters.
    #[serde(default)]
    pub evolution: EvolutionConfig,
    /// Trigger policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Event bus settings and route table.
    #[serde(default)]
    pub bus: BusConfig,
    /// Per-breaker overrides, keyed by breaker name.
    #[serde(default)]
    pub breakers: BTreeMap<String, BreakerSettings>,
    /// Constitution rules and violation log size.
    #[serde(default)]
    pub constitution: ConstitutionConfig,
    /// Durable write retries.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl KernelConfig {
    /// The breaker table: built-in defaults overlaid with configured entries.
    pub fn breaker_table(&self) -> HashMap<String, BreakerConfig> {
        let mut table = BreakerConfig::defaults();
        for (name, settings) in &self.breakers {
            table.insert(name.clone(), settings.to_breaker_config());
        }
        table
    }
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum cross-pod hops; 0 disables routing.
    #[serde(default = "default_max_depth")]
    pub max_depth: u8,
    /// Bound on the persistence queue.
    #[serde(default = "default_persist_capacity")]
    pub persist_capacity: usize,
    /// Route table. Omit to use the built-in routes; an empty list
    /// disables routing.
    #[serde(default = "default_routes")]
    pub routes: Vec<CrossPodRoute>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            persist_capacity: default_persist_capacity(),
            routes: default_routes(),
        }
    }
}

/// Threshold and recovery timeout for one named breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Seconds an open breaker waits before a trial call.
    pub recovery_timeout_s: u64,
}

impl BreakerSettings {
    /// Runtime form.
    pub fn to_breaker_config(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_s),
        }
    }
}

/// Constitution section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstitutionConfig {
    /// Rules in priority order. Empty means the built-in rule set.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Bound on the in-memory violation log.
    #[serde(default = "default_violation_capacity")]
    pub violation_capacity: usize,
}

impl Default for ConstitutionConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            violation_capacity: default_violation_capacity(),
        }
    }
}

impl ConstitutionConfig {
    /// Compile the configured rules, or the built-in set when none are given.
    ///
    /// # Errors
    ///
    /// [`GovernorError::InvalidRule`] for the first rule that fails to compile.
    pub fn rule_set(&self) -> Result<RuleSet, GovernorError> {
        if self.rules.is_empty() {
            RuleSet::defaults()
        } else {
            RuleSet::compile(&self.rules)
        }
    }
}

/// Retry policy for durable writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Attempts per write, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    /// Delay after the first failure; doubles each attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl PersistenceConfig {
    /// Runtime form.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_attempts, Duration::from_millis(self.retry_base_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STORAGE_BREAKER;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let cfg: KernelConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, KernelConfig::default());
        assert_eq!(cfg.scheduler.event_threshold, 25);
        assert_eq!(cfg.bus.routes.len(), 5);
        assert_eq!(cfg.bus.max_depth, 1);
        assert_eq!(cfg.persistence.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_breaker_overrides_merge_with_defaults() {
        let cfg: KernelConfig = toml::from_str(
            r#"
            [breakers.storage]
            failure_threshold = 7
            recovery_timeout_s = 5

            [breakers.vapi]
            failure_threshold = 2
            recovery_timeout_s = 10
            "#,
        )
        .unwrap();
        let table = cfg.breaker_table();
        assert_eq!(table.len(), 4);
        assert_eq!(table[STORAGE_BREAKER].failure_threshold, 7);
        assert_eq!(table["model_gateway"].failure_threshold, 5);
        assert_eq!(table["vapi"].recovery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_explicit_empty_routes_disable_routing() {
        let cfg: KernelConfig = toml::from_str("[bus]\nroutes = []").unwrap();
        assert!(cfg.bus.routes.is_empty());
    }

    #[test]
    fn test_rule_set_falls_back_to_builtin() {
        let cfg = KernelConfig::default();
        let rules = cfg.constitution.rule_set().unwrap();
        assert_eq!(rules.ids()[0], "no_pii_storage");
    }

    #[test]
    fn test_config_serializes_back_to_toml() {
        let cfg = KernelConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: KernelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, cfg);
    }
}
