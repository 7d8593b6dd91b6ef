//! # Kernel Context
//!
//! ## Responsibility
//! Own one instance of every component (registry, governor, bus, engine,
//! scheduler), wire them from a [`KernelConfig`], and expose the operations
//! surrounding service code calls.
//!
//! ## Guarantees
//! - Construction is explicit: no global state, two kernels never share
//!   counters or breakers
//! - Background tasks exist only between [`Kernel::start`] and
//!   [`Kernel::shutdown`]
//! - Shutdown drains events already queued for persistence
//!
//! ## NOT Responsible For
//! - Serving HTTP or any other outer surface
//! - Choosing the store or notification backend (injected)

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::bus::{persist, Event, EventBus, HandlerError, PublishReport, SubscriptionToken};
use crate::config::{self, ConfigError, KernelConfig};
use crate::evolution::{EvolutionEngine, EvolutionError, EvolutionRecord};
use crate::gateway::{GovernedGateway, ModelGateway};
use crate::genome::{DecodedParams, FitnessProvider, GeneSchema, Genome, PodRegistry, PodStatus};
use crate::governor::{BreakerStatus, Governor, ValidationOutcome, Violation};
use crate::notify::NotificationSink;
use crate::scheduler::TriggerScheduler;
use crate::store::DurableStore;
use crate::KernelError;

/// Join handles for the background tasks started by [`Kernel::start`].
#[derive(Debug, Default)]
pub struct KernelHandles {
    /// Event persistence worker. `None` if already started elsewhere.
    pub persistence: Option<JoinHandle<()>>,
    /// Periodic sweep. `None` when the sweep is disabled.
    pub sweep: Option<JoinHandle<()>>,
}

impl KernelHandles {
    /// Wait for every background task to exit.
    pub async fn join(self) {
        for handle in [self.persistence, self.sweep].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

/// The evolution kernel.
pub struct Kernel {
    config: KernelConfig,
    registry: Arc<PodRegistry>,
    governor: Governor,
    bus: Arc<EventBus>,
    engine: Arc<EvolutionEngine>,
    scheduler: Arc<TriggerScheduler>,
    store: Arc<dyn DurableStore>,
    persist_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("pods", &self.registry.len())
            .field("bus", &self.bus)
            .field("scheduler", &self.scheduler.config())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Validate `config` and build every component.
    ///
    /// # Errors
    ///
    /// - [`KernelError::Config`] if the configuration fails validation
    /// - [`KernelError::Governor`] if a constitution rule does not compile
    /// - [`KernelError::Evolution`] if the search parameters are unusable
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn DurableStore>,
        notifier: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Self, KernelError> {
        config::validate(&config).map_err(|errors| {
            ConfigError::Validation(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        })?;

        let retry = config.persistence.retry_policy();
        let mut builder = Governor::builder()
            .rules(config.constitution.rule_set()?)
            .breakers(config.breaker_table())
            .violation_capacity(config.constitution.violation_capacity)
            .store(Arc::clone(&store))
            .retry_policy(retry.clone());
        if let Some(notifier) = notifier {
            builder = builder.notifier(notifier);
        }
        let governor = builder.build();

        let registry = Arc::new(PodRegistry::new());
        let (bus, persist_rx) = EventBus::new(config.bus.routes.clone(), config.bus.max_depth)
            .with_persistence(config.bus.persist_capacity);
        let bus = Arc::new(bus);

        let engine = Arc::new(
            EvolutionEngine::new(
                Arc::clone(&registry),
                governor.clone(),
                Arc::clone(&bus),
                Arc::clone(&store),
                config.evolution.clone(),
            )?
            .with_retry_policy(retry),
        );
        let scheduler = Arc::new(TriggerScheduler::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.scheduler.clone(),
        ));
        scheduler.attach(&bus)?;

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            routes = config.bus.routes.len(),
            threshold = config.scheduler.event_threshold,
            "kernel constructed"
        );
        Ok(Self {
            config,
            registry,
            governor,
            bus,
            engine,
            scheduler,
            store,
            persist_rx: Mutex::new(Some(persist_rx)),
            shutdown_tx,
        })
    }

    /// Sign the improvement proof of every later cycle with `signer`.
    /// Returns `false` if a signer was already installed.
    #[cfg(feature = "signing")]
    pub fn set_proof_signer(&self, signer: crate::evolution::ProofSigner) -> bool {
        self.engine.set_signer(signer)
    }

    /// Spawn the persistence worker and the periodic sweep.
    ///
    /// Must be called from inside a tokio runtime. A second call starts
    /// nothing new.
    pub fn start(&self) -> KernelHandles {
        let persistence = self.persist_rx.lock().take().map(|rx| {
            persist::spawn_worker(
                rx,
                Arc::clone(&self.store),
                self.governor.clone(),
                self.config.persistence.retry_policy(),
                self.shutdown_tx.subscribe(),
            )
        });
        let sweep = if persistence.is_some() {
            Arc::clone(&self.scheduler).spawn_sweep(self.shutdown_tx.subscribe())
        } else {
            warn!("kernel already started");
            None
        };
        info!(
            persistence = persistence.is_some(),
            sweep = sweep.is_some(),
            "kernel started"
        );
        KernelHandles { persistence, sweep }
    }

    /// Signal background tasks to stop. Queued events are still written.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        info!("kernel shutdown requested");
    }

    /// The configuration the kernel was built from.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Shared governor handle, for components outside the kernel.
    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    // ── Pods ───────────────────────────────────────────────────────────────

    /// Register a pod with its built-in gene schema.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registry`] on a duplicate id or zero gene count.
    pub fn register_pod(
        &self,
        pod_id: &str,
        gene_count: usize,
        provider: Arc<dyn FitnessProvider>,
    ) -> Result<(), KernelError> {
        self.registry.register(pod_id, gene_count, provider)?;
        Ok(())
    }

    /// Register a pod with its own gene schema.
    ///
    /// # Errors
    ///
    /// As [`Kernel::register_pod`].
    pub fn register_pod_with_schema(
        &self,
        pod_id: &str,
        gene_count: usize,
        provider: Arc<dyn FitnessProvider>,
        schema: GeneSchema,
    ) -> Result<(), KernelError> {
        self.registry
            .register_with_schema(pod_id, gene_count, provider, schema)?;
        Ok(())
    }

    /// Registered pod ids, sorted.
    pub fn registered_pods(&self) -> Vec<String> {
        self.registry.pod_ids()
    }

    /// Snapshot of one pod.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registry`] if the pod is unknown.
    pub fn pod_status(&self, pod_id: &str) -> Result<PodStatus, KernelError> {
        Ok(self.registry.get(pod_id)?.status())
    }

    /// Decode `genome` into `pod_id`'s named parameters.
    ///
    /// # Errors
    ///
    /// [`KernelError::Registry`] if the pod is unknown.
    pub fn decode(&self, pod_id: &str, genome: &Genome) -> Result<DecodedParams, KernelError> {
        Ok(self.registry.decode(pod_id, genome)?)
    }

    /// Wrap a model gateway so calls made for `pod_id` are governed.
    pub fn gateway(&self, inner: Arc<dyn ModelGateway>, pod_id: &str) -> GovernedGateway {
        GovernedGateway::new(inner, self.governor.clone(), pod_id)
    }

    // ── Evolution ──────────────────────────────────────────────────────────

    /// Run one cycle for `pod_id` and wait for its record.
    ///
    /// # Errors
    ///
    /// [`KernelError::Evolution`]; check [`KernelError::is_retryable`] to
    /// tell "try later" apart from hard failures.
    #[instrument(skip(self))]
    pub async fn trigger_cycle(&self, pod_id: &str) -> Result<EvolutionRecord, KernelError> {
        Ok(self.engine.run_cycle(pod_id).await?)
    }

    /// Run every registered pod's cycle concurrently.
    pub async fn trigger_all(&self) -> Vec<(String, Result<EvolutionRecord, EvolutionError>)> {
        self.scheduler.trigger_all().await
    }

    /// Up to `limit` completed records for `pod_id`, newest first.
    pub fn evolution_history(&self, pod_id: &str, limit: usize) -> Vec<EvolutionRecord> {
        self.engine.history(pod_id, limit)
    }

    // ── Bus ────────────────────────────────────────────────────────────────

    /// Publish an event. Never blocks on storage.
    pub fn publish(&self, event: Event) -> PublishReport {
        self.bus.publish(event)
    }

    /// Subscribe `handler` to events matching `pattern`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Bus`] if the pattern is malformed.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionToken, KernelError>
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Ok(self.bus.subscribe(pattern, handler)?)
    }

    /// Remove a subscription. Returns `false` for an unknown token.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.bus.unsubscribe(token)
    }

    // ── Governor ───────────────────────────────────────────────────────────

    /// Validate `text` against the constitution.
    pub fn validate(&self, text: &str, pod_id: &str) -> ValidationOutcome {
        self.governor.validate(text, pod_id)
    }

    /// Gate a call on breaker `name`.
    ///
    /// # Errors
    ///
    /// [`KernelError::Governor`] while the breaker is open.
    pub fn check_breaker(&self, name: &str) -> Result<(), KernelError> {
        Ok(self.governor.check_breaker(name)?)
    }

    /// Report a successful gated call.
    pub fn record_success(&self, name: &str) {
        self.governor.record_success(name);
    }

    /// Report a failed gated call.
    pub fn record_failure(&self, name: &str) {
        self.governor.record_failure(name);
    }

    /// Snapshot of breaker `name`; `None` if it is not configured.
    pub fn breaker_status(&self, name: &str) -> Option<BreakerStatus> {
        self.governor.breaker_status(name)
    }

    /// Snapshot of every configured breaker.
    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.governor.breaker_statuses()
    }

    /// Recorded constitution violations, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.governor.violations()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
