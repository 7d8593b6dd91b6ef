//! # Trigger Scheduler
//!
//! ## Responsibility
//! Decide when a pod's evolution cycle runs: once its event counter reaches
//! the threshold, and for every pod on a periodic sweep.
//!
//! ## Guarantees
//! - Counting happens synchronously inside `publish`
//! - A trigger attempt takes the pod's cycle lock before spawning the cycle,
//!   so one threshold crossing starts at most one cycle
//! - The counter resets only when the lock is taken; attempts skipped
//!   because a cycle is in flight or the evolution breaker is open leave it
//!   untouched, so the next event retries
//! - Skips are silent (debug log), never errors
//! - Events the engine publishes about its own cycles are not counted
//!
//! ## NOT Responsible For
//! - Running the cycle (see [`crate::evolution`])

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{BusError, Event, EventBus, SubscriptionToken};
use crate::evolution::{EvolutionEngine, EvolutionError, EvolutionRecord, LIFECYCLE_EVENTS};
use crate::genome::PodRegistry;

fn default_event_threshold() -> u64 {
    25
}

/// Default sweep interval: one hour.
fn default_sweep_interval_secs() -> u64 {
    3_600
}

fn default_true() -> bool {
    true
}

/// When cycles are triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Events per pod before a cycle is attempted.
    #[serde(default = "default_event_threshold")]
    pub event_threshold: u64,
    /// Seconds between periodic sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Whether the periodic sweep runs at all.
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_threshold: default_event_threshold(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Counts events and starts cycles.
#[derive(Debug)]
pub struct TriggerScheduler {
    engine: Arc<EvolutionEngine>,
    registry: Arc<PodRegistry>,
    config: SchedulerConfig,
}

impl TriggerScheduler {
    /// Build a scheduler.
    pub fn new(
        engine: Arc<EvolutionEngine>,
        registry: Arc<PodRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe to every event on `bus` so publishes feed the counters.
    ///
    /// The subscription holds only a weak reference; dropping the scheduler
    /// turns it into a no-op.
    ///
    /// # Errors
    ///
    /// Propagates [`BusError`] from `subscribe`.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Result<SubscriptionToken, BusError> {
        let weak: Weak<Self> = Arc::downgrade(self);
        bus.subscribe("*", move |event| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.on_event(event);
            }
            Ok(())
        })
    }

    /// Count one event. Returns `true` if it started a cycle.
    ///
    /// The engine's own lifecycle events are not counted.
    pub fn on_event(&self, event: &Event) -> bool {
        if LIFECYCLE_EVENTS.contains(&event.event_type.as_str()) {
            return false;
        }
        let Ok(registration) = self.registry.get(&event.pod) else {
            return false;
        };
        let count = registration.increment_events();
        if count < self.config.event_threshold {
            return false;
        }
        debug!(pod = %event.pod, count, "event threshold reached");
        self.try_trigger(&event.pod)
    }

    /// Attempt to start a cycle for `pod_id` in the background.
    ///
    /// Returns `true` if a cycle was started; `false` if it was skipped.
    pub fn try_trigger(&self, pod_id: &str) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!(pod = pod_id, "no tokio runtime; cycle trigger skipped");
            return false;
        };
        match self.engine.begin_cycle(pod_id) {
            Ok(guard) => {
                let engine = Arc::clone(&self.engine);
                handle.spawn(async move {
                    // Outcome is logged, counted and published by the engine.
                    let _ = engine.run_with_guard(guard).await;
                });
                info!(pod = pod_id, "evolution cycle triggered");
                true
            }
            Err(e) if e.is_retryable() => {
                debug!(pod = pod_id, reason = %e, "cycle trigger skipped");
                false
            }
            Err(e) => {
                warn!(pod = pod_id, error = %e, "cycle trigger failed");
                false
            }
        }
    }

    /// Attempt a cycle for every registered pod. Returns how many started.
    pub fn sweep(&self) -> usize {
        let pods = self.registry.pod_ids();
        let started = pods.iter().filter(|pod| self.try_trigger(pod)).count();
        info!(pods = pods.len(), started, "periodic sweep");
        started
    }

    /// Run every registered pod's cycle now and wait for the results.
    pub async fn trigger_all(&self) -> Vec<(String, Result<EvolutionRecord, EvolutionError>)> {
        self.engine.run_all().await
    }

    /// Spawn the periodic sweep. The first sweep happens one interval after
    /// start. Returns `None` when the sweep is disabled.
    pub fn spawn_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.sweep_enabled {
            info!("periodic sweep disabled");
            return None;
        }
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "periodic sweep started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("periodic sweep stopped");
        }))
    }
}
