//! Prometheus metrics for the evolution kernel.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_cycle`, `inc_event_published`, …) are no-ops if `init_metrics` was
//! never called, so the kernel is always safe to run and observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `kernel_cycles_total` | Counter | `pod`, `outcome` |
//! | `kernel_cycle_duration_seconds` | Histogram | `pod` |
//! | `kernel_best_fitness` | Gauge | `pod` |
//! | `kernel_events_published_total` | Counter | `event_type` |
//! | `kernel_persistence_failures_total` | Counter | `kind` |
//! | `kernel_breaker_transitions_total` | Counter | `breaker`, `to` |
//! | `kernel_violations_total` | Counter | `rule`, `severity` |

use std::sync::OnceLock;

use prometheus::core::Collector;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::governor::BreakerState;
use crate::KernelError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All kernel metrics, bundled so they can live in a single [`OnceLock`].
pub struct Metrics {
    /// Registry that owns every descriptor below.
    pub registry: Registry,
    /// Cycle attempts by pod and outcome.
    pub cycles_total: CounterVec,
    /// Wall-clock duration of started cycles.
    pub cycle_duration: HistogramVec,
    /// Best score of the latest completed cycle.
    pub best_fitness: GaugeVec,
    /// Events published, by qualified type.
    pub events_published: CounterVec,
    /// Durable writes that failed or were skipped.
    pub persistence_failures: CounterVec,
    /// Breaker state changes.
    pub breaker_transitions: CounterVec,
    /// Constitution rule hits.
    pub violations_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: Result<C, prometheus::Error>) -> Result<C, KernelError>
where
    C: Collector + Clone + 'static,
{
    let collector =
        collector.map_err(|e| KernelError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| KernelError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(prefix: &str) -> Result<Metrics, KernelError> {
    let registry = Registry::new();
    let name = |n: &str| format!("{prefix}_{n}");

    let cycles_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("cycles_total"), "Evolution cycle attempts by outcome"),
            &["pod", "outcome"],
        ),
    )?;
    let cycle_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(name("cycle_duration_seconds"), "Evolution cycle duration")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["pod"],
        ),
    )?;
    let best_fitness = register(
        &registry,
        GaugeVec::new(
            Opts::new(name("best_fitness"), "Best score of the latest completed cycle"),
            &["pod"],
        ),
    )?;
    let events_published = register(
        &registry,
        CounterVec::new(
            Opts::new(name("events_published_total"), "Events published on the bus"),
            &["event_type"],
        ),
    )?;
    let persistence_failures = register(
        &registry,
        CounterVec::new(
            Opts::new(
                name("persistence_failures_total"),
                "Durable writes that failed, were skipped or were shed",
            ),
            &["kind"],
        ),
    )?;
    let breaker_transitions = register(
        &registry,
        CounterVec::new(
            Opts::new(name("breaker_transitions_total"), "Circuit breaker state changes"),
            &["breaker", "to"],
        ),
    )?;
    let violations_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("violations_total"), "Constitution rule hits"),
            &["rule", "severity"],
        ),
    )?;

    Ok(Metrics {
        registry,
        cycles_total,
        cycle_duration,
        best_fitness,
        events_published,
        persistence_failures,
        breaker_transitions,
        violations_total,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all kernel metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`KernelError::Other`] if metric construction or registration
/// fails.
pub fn init_metrics() -> Result<(), KernelError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = build("kernel")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(metrics);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one cycle attempt. `outcome` is `completed`, `failed`,
/// `breaker_open` or `already_running`.
pub fn inc_cycle(pod: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.cycles_total.get_metric_with_label_values(&[pod, outcome]) {
            c.inc();
        }
    }
}

/// Record how long a started cycle took.
pub fn observe_cycle_duration(pod: &str, seconds: f64) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.cycle_duration.get_metric_with_label_values(&[pod]) {
            h.observe(seconds);
        }
    }
}

/// Publish the best score of a completed cycle.
pub fn set_best_fitness(pod: &str, score: f64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.best_fitness.get_metric_with_label_values(&[pod]) {
            g.set(score);
        }
    }
}

/// Count one published event.
pub fn inc_event_published(event_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.events_published.get_metric_with_label_values(&[event_type]) {
            c.inc();
        }
    }
}

/// Count one durable write that did not land.
pub fn inc_persistence_failure(kind: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.persistence_failures.get_metric_with_label_values(&[kind]) {
            c.inc();
        }
    }
}

/// Count one breaker state change.
pub fn inc_breaker_transition(breaker: &str, to: BreakerState) {
    if let Some(m) = metrics() {
        let to = to.to_string();
        if let Ok(c) = m
            .breaker_transitions
            .get_metric_with_label_values(&[breaker, to.as_str()])
        {
            c.inc();
        }
    }
}

/// Count one constitution rule hit.
pub fn inc_violation(rule: &str, severity: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.violations_total.get_metric_with_label_values(&[rule, severity]) {
            c.inc();
        }
    }
}

/// Gather all registered metric families. Empty before init.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Encode every metric in the Prometheus text exposition format.
///
/// Returns an empty string before init or if encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
