//! Per-pod registrations and the fitness capability contract.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::decoder::{DecodedParams, GeneSchema};
use super::Genome;
use crate::evolution::EvolutionRecord;
use crate::gateway::GatewayError;

// ─── Errors ────────────────────────────────────────────────────────────────

/// Errors raised by the pod registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A pod with this id is already registered.
    #[error("pod '{pod}' is already registered")]
    DuplicateRegistration {
        /// Pod id.
        pod: String,
    },

    /// No pod with this id is registered.
    #[error("unknown pod '{pod}'")]
    UnknownPod {
        /// Pod id.
        pod: String,
    },

    /// Pod ids must be non-empty and free of `.`, `*` and whitespace,
    /// since they form the first half of a qualified event type.
    #[error("invalid pod id '{pod}': {reason}")]
    InvalidPodId {
        /// Rejected id.
        pod: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A pod must carry at least one gene.
    #[error("pod '{pod}' declared invalid gene count {gene_count}")]
    InvalidGeneCount {
        /// Pod id.
        pod: String,
        /// Rejected count.
        gene_count: usize,
    },
}

/// Why a single fitness evaluation produced no usable score.
///
/// The engine absorbs every variant into a zero score for that individual.
#[derive(Debug, Error)]
pub enum FitnessError {
    /// The evaluation exceeded the per-call timeout.
    #[error("fitness evaluation timed out after {0:?}")]
    Timeout(Duration),

    /// The model gateway refused or failed (including provider exhaustion).
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The provider panicked; the panic was contained.
    #[error("fitness provider panicked")]
    Panicked,

    /// The provider returned NaN or an infinity.
    #[error("fitness provider returned non-finite score {0}")]
    NonFinite(f64),

    /// Any other provider failure.
    #[error("fitness evaluation failed: {0}")]
    Failed(String),
}

// ─── Fitness capability ────────────────────────────────────────────────────

/// A pod's fitness capability.
///
/// `evaluate` scores one genome; higher is better. Implementations should
/// finish promptly but do not need to enforce a timeout themselves: the
/// engine wraps every call in one.
#[async_trait]
pub trait FitnessProvider: Send + Sync {
    /// Score a genome.
    async fn evaluate(&self, genome: &Genome) -> Result<f64, FitnessError>;

    /// Apply freshly decoded parameters to the live pod.
    ///
    /// Called once after a successful cycle. The default does nothing.
    async fn apply(&self, _params: &DecodedParams) -> Result<(), FitnessError> {
        Ok(())
    }
}

/// Adapts a plain synchronous scoring function into a [`FitnessProvider`].
pub struct FnFitness<F> {
    score: F,
}

impl<F> FnFitness<F>
where
    F: Fn(&Genome) -> f64 + Send + Sync,
{
    /// Wrap a scoring function.
    pub fn new(score: F) -> Self {
        Self { score }
    }
}

#[async_trait]
impl<F> FitnessProvider for FnFitness<F>
where
    F: Fn(&Genome) -> f64 + Send + Sync,
{
    async fn evaluate(&self, genome: &Genome) -> Result<f64, FitnessError> {
        Ok((self.score)(genome))
    }
}

// ─── Registration ──────────────────────────────────────────────────────────

/// Everything the kernel knows about one pod.
pub struct PodRegistration {
    pod_id: String,
    gene_count: usize,
    schema: GeneSchema,
    provider: Arc<dyn FitnessProvider>,
    event_counter: AtomicU64,
    cycle_in_flight: AtomicBool,
    last_cycle_at: Mutex<Option<DateTime<Utc>>>,
    last_record: Mutex<Option<EvolutionRecord>>,
    applied_params: Mutex<Option<DecodedParams>>,
}

impl fmt::Debug for PodRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodRegistration")
            .field("pod_id", &self.pod_id)
            .field("gene_count", &self.gene_count)
            .field("event_counter", &self.event_count())
            .field("cycle_in_flight", &self.is_cycle_in_flight())
            .finish_non_exhaustive()
    }
}

impl PodRegistration {
    /// Pod id.
    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }

    /// Declared gene count.
    pub fn gene_count(&self) -> usize {
        self.gene_count
    }

    /// Gene schema used for decoding.
    pub fn schema(&self) -> &GeneSchema {
        &self.schema
    }

    /// Shared handle to the pod's fitness capability.
    pub fn provider(&self) -> Arc<dyn FitnessProvider> {
        Arc::clone(&self.provider)
    }

    /// Count one event; returns the new counter value.
    pub fn increment_events(&self) -> u64 {
        self.event_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Events counted since the last triggered cycle.
    pub fn event_count(&self) -> u64 {
        self.event_counter.load(Ordering::Acquire)
    }

    /// `true` while a cycle holds this pod's guard.
    pub fn is_cycle_in_flight(&self) -> bool {
        self.cycle_in_flight.load(Ordering::Acquire)
    }

    /// Try to take this pod's cycle lock without starting the cycle.
    ///
    /// The counter and timestamp are left alone until [`CycleGuard::start`]
    /// runs, so a caller can still back out by dropping the guard. Returns
    /// `None` if a cycle is already in flight.
    pub fn try_claim_cycle(self: &Arc<Self>) -> Option<CycleGuard> {
        self.cycle_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        debug!(pod = %self.pod_id, "cycle guard acquired");
        Some(CycleGuard {
            registration: Arc::clone(self),
        })
    }

    /// Take this pod's cycle lock and start the cycle.
    ///
    /// On success the event counter is reset to zero and the cycle timestamp
    /// is stamped; the returned guard releases the lock when dropped, on
    /// every exit path. Returns `None` if a cycle is already in flight, in
    /// which case nothing is modified.
    pub fn try_begin_cycle(self: &Arc<Self>) -> Option<CycleGuard> {
        let guard = self.try_claim_cycle()?;
        guard.start();
        Some(guard)
    }

    /// Remember a completed cycle's record.
    pub fn store_record(&self, record: EvolutionRecord) {
        *self.last_record.lock() = Some(record);
    }

    /// Remember the parameters most recently applied to the pod.
    pub fn store_applied(&self, params: DecodedParams) {
        *self.applied_params.lock() = Some(params);
    }

    /// Last completed record, if any.
    pub fn last_record(&self) -> Option<EvolutionRecord> {
        self.last_record.lock().clone()
    }

    /// Decode a genome with this pod's schema.
    pub fn decode(&self, genome: &Genome) -> DecodedParams {
        self.schema.decode(genome.genes())
    }

    /// Point-in-time snapshot.
    pub fn status(&self) -> PodStatus {
        PodStatus {
            pod_id: self.pod_id.clone(),
            gene_count: self.gene_count,
            event_count: self.event_count(),
            cycle_in_flight: self.is_cycle_in_flight(),
            last_cycle_at: *self.last_cycle_at.lock(),
            last_best_score: self.last_record.lock().as_ref().map(|r| r.best_score),
            applied_params: self.applied_params.lock().clone(),
        }
    }
}

/// Exclusive hold on one pod's cycle slot. Dropping it frees the slot.
pub struct CycleGuard {
    registration: Arc<PodRegistration>,
}

impl CycleGuard {
    /// The guarded registration.
    pub fn registration(&self) -> &Arc<PodRegistration> {
        &self.registration
    }

    /// Mark the cycle as started: reset the event counter and stamp the
    /// cycle time.
    pub fn start(&self) {
        self.registration.event_counter.store(0, Ordering::Release);
        *self.registration.last_cycle_at.lock() = Some(Utc::now());
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.registration
            .cycle_in_flight
            .store(false, Ordering::Release);
        debug!(pod = %self.registration.pod_id, "cycle guard released");
    }
}

/// Serializable snapshot of one pod.
#[derive(Debug, Clone, Serialize)]
pub struct PodStatus {
    /// Pod id.
    pub pod_id: String,
    /// Declared gene count.
    pub gene_count: usize,
    /// Events counted since the last triggered cycle.
    pub event_count: u64,
    /// Whether a cycle is running now.
    pub cycle_in_flight: bool,
    /// When the last cycle started.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Best score of the last completed cycle.
    pub last_best_score: Option<f64>,
    /// Parameters most recently applied.
    pub applied_params: Option<DecodedParams>,
}

// ─── Registry ──────────────────────────────────────────────────────────────

/// All registered pods, keyed by id. Entries are never removed.
#[derive(Debug, Default)]
pub struct PodRegistry {
    pods: DashMap<String, Arc<PodRegistration>>,
}

impl PodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pod with its built-in gene schema.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidGeneCount`] if `gene_count` is zero.
    /// - [`RegistryError::DuplicateRegistration`] if the id is taken.
    pub fn register(
        &self,
        pod_id: &str,
        gene_count: usize,
        provider: Arc<dyn FitnessProvider>,
    ) -> Result<Arc<PodRegistration>, RegistryError> {
        self.register_with_schema(pod_id, gene_count, provider, GeneSchema::builtin(pod_id))
    }

    /// Register a pod with an explicit gene schema.
    ///
    /// # Errors
    ///
    /// Same as [`PodRegistry::register`].
    pub fn register_with_schema(
        &self,
        pod_id: &str,
        gene_count: usize,
        provider: Arc<dyn FitnessProvider>,
        schema: GeneSchema,
    ) -> Result<Arc<PodRegistration>, RegistryError> {
        check_pod_id(pod_id)?;
        if gene_count == 0 {
            return Err(RegistryError::InvalidGeneCount {
                pod: pod_id.to_string(),
                gene_count,
            });
        }

        match self.pods.entry(pod_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateRegistration {
                pod: pod_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let registration = Arc::new(PodRegistration {
                    pod_id: pod_id.to_string(),
                    gene_count,
                    schema,
                    provider,
                    event_counter: AtomicU64::new(0),
                    cycle_in_flight: AtomicBool::new(false),
                    last_cycle_at: Mutex::new(None),
                    last_record: Mutex::new(None),
                    applied_params: Mutex::new(None),
                });
                slot.insert(Arc::clone(&registration));
                info!(pod = %pod_id, gene_count, "pod registered");
                Ok(registration)
            }
        }
    }

    /// Look up a pod.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownPod`] if the id is not registered.
    pub fn get(&self, pod_id: &str) -> Result<Arc<PodRegistration>, RegistryError> {
        self.pods
            .get(pod_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::UnknownPod {
                pod: pod_id.to_string(),
            })
    }

    /// `true` if the pod is registered.
    pub fn contains(&self, pod_id: &str) -> bool {
        self.pods.contains_key(pod_id)
    }

    /// Registered pod ids, sorted.
    pub fn pod_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pods.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered pods.
    pub fn len(&self) -> usize {
        self.pods.len()
    }

    /// `true` if no pod is registered.
    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Decode a genome for a registered pod.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownPod`] if the id is not registered.
    pub fn decode(&self, pod_id: &str, genome: &Genome) -> Result<DecodedParams, RegistryError> {
        Ok(self.get(pod_id)?.decode(genome))
    }
}

fn check_pod_id(pod_id: &str) -> Result<(), RegistryError> {
    let reason = if pod_id.is_empty() {
        "must not be empty"
    } else if pod_id.contains('.') {
        "must not contain '.'"
    } else if pod_id.contains('*') {
        "must not contain '*'"
    } else if pod_id.chars().any(char::is_whitespace) {
        "must not contain whitespace"
    } else {
        return Ok(());
    };
    Err(RegistryError::InvalidPodId {
        pod: pod_id.to_string(),
        reason,
    })
}
