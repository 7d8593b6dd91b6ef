//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`KernelConfig`] that cannot
//! be expressed through the type system alone (range checks, duplicate ids,
//! rules that do not compile).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use std::collections::HashSet;

use super::KernelConfig;
use crate::governor::RuleSet;

/// Largest accepted `bus.max_depth`.
pub const MAX_ROUTE_DEPTH: u8 = 8;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "scheduler.event_threshold").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate all semantic constraints on a [`KernelConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &KernelConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors: Vec<ConfigError> = config
        .evolution
        .problems()
        .into_iter()
        .map(|p| invalid(format!("evolution.{}", p.field), p.value, &p.reason))
        .collect();

    // ── Scheduler ─────────────────────────────────────────────────────────
    if config.scheduler.event_threshold == 0 {
        errors.push(invalid("scheduler.event_threshold", 0, "must be at least 1"));
    }
    if config.scheduler.sweep_enabled && config.scheduler.sweep_interval_secs == 0 {
        errors.push(invalid(
            "scheduler.sweep_interval_secs",
            0,
            "must be at least 1 when the sweep is enabled",
        ));
    }

    // ── Bus ───────────────────────────────────────────────────────────────
    if config.bus.persist_capacity == 0 {
        errors.push(invalid("bus.persist_capacity", 0, "must be at least 1"));
    }
    if config.bus.max_depth > MAX_ROUTE_DEPTH {
        errors.push(invalid(
            "bus.max_depth",
            config.bus.max_depth,
            "must be at most 8",
        ));
    }
    for (i, route) in config.bus.routes.iter().enumerate() {
        if route.target_pod.trim().is_empty() {
            errors.push(invalid(format!("bus.routes[{i}].target_pod"), "\"\"", "must not be empty"));
        }
        if route.target_action.trim().is_empty() {
            errors.push(invalid(
                format!("bus.routes[{i}].target_action"),
                "\"\"",
                "must not be empty",
            ));
        }
    }

    // ── Breakers ──────────────────────────────────────────────────────────
    for (name, settings) in &config.breakers {
        if settings.failure_threshold == 0 {
            errors.push(invalid(
                format!("breakers.{name}.failure_threshold"),
                0,
                "must be at least 1",
            ));
        }
        if settings.recovery_timeout_s == 0 {
            errors.push(invalid(
                format!("breakers.{name}.recovery_timeout_s"),
                0,
                "must be at least 1",
            ));
        }
    }

    // ── Constitution ──────────────────────────────────────────────────────
    if config.constitution.violation_capacity == 0 {
        errors.push(invalid("constitution.violation_capacity", 0, "must be at least 1"));
    }
    let mut seen = HashSet::new();
    for rule in &config.constitution.rules {
        if rule.id.trim().is_empty() {
            errors.push(invalid("constitution.rules.id", "\"\"", "must not be empty"));
        } else if !seen.insert(rule.id.as_str()) {
            errors.push(invalid("constitution.rules.id", &rule.id, "duplicate rule id"));
        }
        if let Err(e) = RuleSet::compile(std::slice::from_ref(rule)) {
            errors.push(invalid(
                format!("constitution.rules.{}", rule.id),
                &rule.id,
                &e.to_string(),
            ));
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────
    if config.persistence.retry_attempts == 0 {
        errors.push(invalid("persistence.retry_attempts", 0, "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
