//! The evolution cycle.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::operators::{argmax, blend_crossover, gaussian_mutate, mean, tournament_select};
use super::{
    EvolutionConfig, EvolutionError, EvolutionRecord, ImprovementProof, EVOLUTION_COMPLETED,
    EVOLUTION_FAILED, GENOME_APPLIED,
};
use crate::bus::{Event, EventBus};
use crate::genome::{
    CycleGuard, FitnessError, FitnessProvider, Genome, PodRegistration, PodRegistry, RegistryError,
};
use crate::governor::{spawn_background, Governor, GovernorError, EVOLUTION_CYCLE_BREAKER};
use crate::metrics;
use crate::store::{self, DurableStore, RetryPolicy};

/// Records kept in the in-memory history log.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1_000;

/// Delay before the single background re-attempt of a failed record write.
pub const BACKGROUND_PERSIST_DELAY: Duration = Duration::from_secs(30);

/// Runs evolution cycles for registered pods.
pub struct EvolutionEngine {
    registry: Arc<PodRegistry>,
    governor: Governor,
    bus: Arc<EventBus>,
    store: Arc<dyn DurableStore>,
    config: EvolutionConfig,
    retry: RetryPolicy,
    history: Mutex<VecDeque<EvolutionRecord>>,
    #[cfg(feature = "signing")]
    signer: std::sync::OnceLock<super::ProofSigner>,
}

impl std::fmt::Debug for EvolutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvolutionEngine")
            .field("pods", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// One individual: genes plus a score once evaluated.
struct Candidate {
    genes: Vec<f64>,
    score: Option<f64>,
}

impl EvolutionEngine {
    /// Build an engine.
    ///
    /// # Errors
    ///
    /// [`EvolutionError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        registry: Arc<PodRegistry>,
        governor: Governor,
        bus: Arc<EventBus>,
        store: Arc<dyn DurableStore>,
        config: EvolutionConfig,
    ) -> Result<Self, EvolutionError> {
        config.validate()?;
        Ok(Self {
            registry,
            governor,
            bus,
            store,
            config,
            retry: RetryPolicy::default(),
            history: Mutex::new(VecDeque::new()),
            #[cfg(feature = "signing")]
            signer: std::sync::OnceLock::new(),
        })
    }

    /// Override the retry policy used for record writes.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sign every later record's proof with `signer`. Only the first
    /// signer installed sticks; returns `false` if one was already set.
    #[cfg(feature = "signing")]
    pub fn set_signer(&self, signer: super::ProofSigner) -> bool {
        self.signer.set(signer).is_ok()
    }

    #[cfg(feature = "signing")]
    fn seal(&self, mut record: EvolutionRecord) -> EvolutionRecord {
        if let Some(signer) = self.signer.get() {
            signer.sign(&mut record.proof);
        }
        record
    }

    #[cfg(not(feature = "signing"))]
    fn seal(&self, record: EvolutionRecord) -> EvolutionRecord {
        record
    }

    /// The engine configuration.
    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Run one full cycle for `pod_id`.
    ///
    /// # Errors
    ///
    /// - [`EvolutionError::UnknownPod`] if the pod is not registered
    /// - [`EvolutionError::BreakerOpen`] if the evolution breaker is open
    /// - [`EvolutionError::AlreadyRunning`] if a cycle is in flight
    /// - [`EvolutionError::Internal`] if the cycle fails after starting
    pub async fn run_cycle(&self, pod_id: &str) -> Result<EvolutionRecord, EvolutionError> {
        let guard = self.begin_cycle(pod_id)?;
        self.run_with_guard(guard).await
    }

    /// Check preconditions and take the pod's cycle lock.
    ///
    /// Acquiring the lock resets the pod's event counter. Nothing is
    /// modified when an error is returned.
    ///
    /// # Errors
    ///
    /// As [`EvolutionEngine::run_cycle`], minus `Internal`.
    pub fn begin_cycle(&self, pod_id: &str) -> Result<CycleGuard, EvolutionError> {
        let registration = self.registry.get(pod_id).map_err(|e| match e {
            RegistryError::UnknownPod { pod } => EvolutionError::UnknownPod { pod },
            other => EvolutionError::Internal(other.to_string()),
        })?;

        // Lock before the breaker check: a rejected duplicate must leave an
        // open breaker untouched.
        let guard = registration.try_claim_cycle().ok_or_else(|| {
            metrics::inc_cycle(pod_id, "already_running");
            EvolutionError::AlreadyRunning {
                pod: pod_id.to_string(),
            }
        })?;

        if let Err(e) = self.governor.check_breaker(EVOLUTION_CYCLE_BREAKER) {
            metrics::inc_cycle(pod_id, "breaker_open");
            return Err(match e {
                GovernorError::BreakerOpen { name, retry_after } => EvolutionError::BreakerOpen {
                    breaker: name,
                    retry_after,
                },
                other => EvolutionError::Internal(other.to_string()),
            });
        }

        guard.start();
        Ok(guard)
    }

    /// Run a cycle under an already-acquired guard. The guard is released
    /// when this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// [`EvolutionError::Internal`] if the search panicked.
    #[instrument(skip(self, guard), fields(pod = %guard.registration().pod_id()))]
    pub async fn run_with_guard(&self, guard: CycleGuard) -> Result<EvolutionRecord, EvolutionError> {
        let registration = Arc::clone(guard.registration());
        let pod_id = registration.pod_id().to_string();
        let started = Instant::now();
        info!(
            population = self.config.population_size,
            generations = self.config.generations,
            "evolution cycle started"
        );

        let outcome = match AssertUnwindSafe(self.search(&registration)).catch_unwind().await {
            Ok(record) => Ok(record),
            Err(_) => Err(EvolutionError::Internal("search panicked".to_string())),
        };
        metrics::observe_cycle_duration(&pod_id, started.elapsed().as_secs_f64());

        let result = match outcome {
            Ok(record) => {
                let record = self.seal(record);
                self.finish(&registration, record.clone()).await;
                self.governor.record_success(EVOLUTION_CYCLE_BREAKER);
                metrics::inc_cycle(&pod_id, "completed");
                Ok(record)
            }
            Err(e) => {
                self.governor.record_failure(EVOLUTION_CYCLE_BREAKER);
                metrics::inc_cycle(&pod_id, e.outcome_label());
                warn!(error = %e, "evolution cycle failed");
                self.bus.publish(
                    Event::new(&pod_id, EVOLUTION_FAILED).with("error", e.to_string()),
                );
                Err(e)
            }
        };
        drop(guard);
        result
    }

    /// Run every registered pod's cycle concurrently.
    pub async fn run_all(&self) -> Vec<(String, Result<EvolutionRecord, EvolutionError>)> {
        let pods = self.registry.pod_ids();
        let runs = pods.iter().map(|pod| self.run_cycle(pod));
        let results = join_all(runs).await;
        pods.into_iter().zip(results).collect()
    }

    /// Up to `limit` completed records for `pod_id`, newest first.
    pub fn history(&self, pod_id: &str, limit: usize) -> Vec<EvolutionRecord> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|r| r.pod_id == pod_id)
            .take(limit)
            .cloned()
            .collect()
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// The genetic search proper. Returns the record without side effects
    /// beyond fitness calls.
    async fn search(&self, registration: &PodRegistration) -> EvolutionRecord {
        let cfg = &self.config;
        let pod_id = registration.pod_id();
        let provider = registration.provider();
        let mut rng = self.rng();
        let mut n_calls = 0usize;

        let mut population: Vec<Candidate> = (0..cfg.population_size)
            .map(|_| Candidate {
                genes: Genome::random(registration.gene_count(), &mut rng).into_inner(),
                score: None,
            })
            .collect();
        n_calls += self.evaluate(&*provider, pod_id, &mut population).await;

        let initial_scores = scores(&population);
        let avg_before = mean(&initial_scores);
        let mut generation_best = vec![best_of(&initial_scores)];

        for generation in 1..=cfg.generations {
            let parent_scores = scores(&population);
            let elite_idx = argmax(&parent_scores).unwrap_or(0);

            let mut offspring: Vec<Candidate> = (0..cfg.population_size)
                .map(|_| {
                    let parent = &population[tournament_select(&parent_scores, cfg.tournament_size, &mut rng)];
                    Candidate {
                        genes: parent.genes.clone(),
                        score: parent.score,
                    }
                })
                .collect();

            for pair in offspring.chunks_exact_mut(2) {
                if rng.gen::<f64>() < cfg.crossover_rate {
                    let (left, right) = pair.split_at_mut(1);
                    blend_crossover(&mut left[0].genes, &mut right[0].genes, cfg.blend_alpha, &mut rng);
                    left[0].score = None;
                    right[0].score = None;
                }
            }

            for child in offspring.iter_mut() {
                if rng.gen::<f64>() < cfg.mutation_rate {
                    gaussian_mutate(&mut child.genes, cfg.mutation_sigma, cfg.gene_mutation_prob, &mut rng);
                    child.score = None;
                }
            }

            // The previous generation's best survives unchanged, score included.
            let elite = &population[elite_idx];
            offspring[0] = Candidate {
                genes: elite.genes.clone(),
                score: elite.score,
            };

            n_calls += self.evaluate(&*provider, pod_id, &mut offspring).await;
            population = offspring;

            let best = best_of(&scores(&population));
            debug!(generation, best, "generation evaluated");
            generation_best.push(best);
        }

        let final_scores = scores(&population);
        let best_idx = argmax(&final_scores).unwrap_or(0);
        let best_genome = Genome::clamped(population[best_idx].genes.clone());
        let best_score = final_scores.get(best_idx).copied().unwrap_or(0.0);
        let cycle_id = Uuid::new_v4();

        EvolutionRecord {
            cycle_id,
            pod_id: pod_id.to_string(),
            proof: ImprovementProof::new(
                pod_id,
                cycle_id,
                avg_before,
                mean(&final_scores),
                &best_genome,
                n_calls,
            ),
            best_genome,
            best_score,
            generations: cfg.generations,
            population_size: cfg.population_size,
            generation_best,
            timestamp: Utc::now(),
        }
    }

    /// Score every unscored candidate concurrently. Returns the number of
    /// fitness calls made.
    async fn evaluate(
        &self,
        provider: &dyn FitnessProvider,
        pod_id: &str,
        population: &mut [Candidate],
    ) -> usize {
        let timeout = self.config.fitness_timeout();
        let pending: Vec<usize> = population
            .iter()
            .enumerate()
            .filter(|(_, c)| c.score.is_none())
            .map(|(i, _)| i)
            .collect();

        let genomes: Vec<Genome> = pending
            .iter()
            .map(|&i| Genome::clamped(population[i].genes.clone()))
            .collect();
        let results = join_all(genomes.iter().map(|g| score_one(provider, g, timeout))).await;

        let mut failures = 0usize;
        for (&i, result) in pending.iter().zip(results) {
            let score = result.unwrap_or_else(|e| {
                failures += 1;
                debug!(pod = pod_id, error = %e, "fitness evaluation scored 0");
                0.0
            });
            population[i].score = Some(score);
        }
        if failures > 0 {
            warn!(pod = pod_id, failures, evaluated = pending.len(), "fitness failures absorbed");
        }
        pending.len()
    }

    /// Decode, apply, remember, persist and announce a completed record.
    async fn finish(&self, registration: &PodRegistration, record: EvolutionRecord) {
        let pod_id = registration.pod_id();
        let params = registration.decode(&record.best_genome);
        if let Err(e) = registration.provider().apply(&params).await {
            warn!(pod = pod_id, error = %e, "applying decoded parameters failed");
        }
        registration.store_applied(params.clone());
        registration.store_record(record.clone());
        self.remember(record.clone());
        metrics::set_best_fitness(pod_id, record.best_score);

        self.persist(&record).await;

        info!(
            pod = pod_id,
            cycle_id = %record.cycle_id,
            best_score = record.best_score,
            improved = record.proof.improved,
            "evolution cycle completed"
        );

        let params_json = serde_json::to_value(&params).unwrap_or(Value::Null);
        self.bus.publish(
            Event::new(pod_id, GENOME_APPLIED)
                .with("cycle_id", record.cycle_id.to_string())
                .with("params", params_json),
        );
        self.bus.publish(
            Event::new(pod_id, EVOLUTION_COMPLETED)
                .with("cycle_id", record.cycle_id.to_string())
                .with("best_score", record.best_score)
                .with("generations", record.generations)
                .with("population_size", record.population_size)
                .with("improved", record.proof.improved)
                .with("proof_hash", record.proof.proof_hash.clone())
                .with("best_genome", record.best_genome.genes().to_vec()),
        );
    }

    fn remember(&self, record: EvolutionRecord) {
        let mut history = self.history.lock();
        history.push_back(record);
        while history.len() > DEFAULT_HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    async fn persist(&self, record: &EvolutionRecord) {
        let store = Arc::clone(&self.store);
        let write = || store.insert_evolution_record(record);
        if store::guarded_write(&self.governor, &self.retry, "evolution_record", write)
            .await
            .is_ok()
        {
            return;
        }

        warn!(pod = %record.pod_id, cycle_id = %record.cycle_id, "record not persisted; retrying in background");
        let store = Arc::clone(&self.store);
        let governor = self.governor.clone();
        let retry = self.retry.clone();
        let record = record.clone();
        spawn_background(async move {
            tokio::time::sleep(BACKGROUND_PERSIST_DELAY).await;
            let outcome = store::guarded_write(&governor, &retry, "evolution_record", || {
                store.insert_evolution_record(&record)
            })
            .await;
            match outcome {
                Ok(()) => info!(cycle_id = %record.cycle_id, "record persisted on background retry"),
                Err(e) => warn!(cycle_id = %record.cycle_id, error = %e, "record dropped after background retry"),
            }
        });
    }
}

fn scores(population: &[Candidate]) -> Vec<f64> {
    population.iter().map(|c| c.score.unwrap_or(0.0)).collect()
}

fn best_of(scores: &[f64]) -> f64 {
    argmax(scores).map_or(0.0, |i| scores[i])
}

async fn score_one(
    provider: &dyn FitnessProvider,
    genome: &Genome,
    timeout: Duration,
) -> Result<f64, FitnessError> {
    let call = AssertUnwindSafe(provider.evaluate(genome)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(FitnessError::Timeout(timeout)),
        Ok(Err(_)) => Err(FitnessError::Panicked),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Ok(Ok(score))) if !score.is_finite() => Err(FitnessError::NonFinite(score)),
        Ok(Ok(Ok(score))) => Ok(score),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DEFAULT_MAX_DEPTH;
    use crate::genome::FnFitness;
    use crate::governor::BreakerState;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        registry: Arc<PodRegistry>,
        governor: Governor,
        bus: Arc<EventBus>,
        store: Arc<MemoryStore>,
        engine: EvolutionEngine,
    }

    fn small_config() -> EvolutionConfig {
        EvolutionConfig {
            population_size: 10,
            generations: 3,
            seed: Some(42),
            ..EvolutionConfig::default()
        }
    }

    fn harness(config: EvolutionConfig) -> Harness {
        let registry = Arc::new(PodRegistry::new());
        let governor = Governor::builder().build();
        let bus = Arc::new(EventBus::new(vec![], DEFAULT_MAX_DEPTH));
        let store = Arc::new(MemoryStore::new());
        let engine = EvolutionEngine::new(
            registry.clone(),
            governor.clone(),
            bus.clone(),
            store.clone(),
            config,
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::fixed(1, Duration::ZERO));
        Harness {
            registry,
            governor,
            bus,
            store,
            engine,
        }
    }

    fn sum_fitness() -> Arc<dyn FitnessProvider> {
        Arc::new(FnFitness::new(|g: &Genome| g.sum()))
    }

    #[tokio::test]
    async fn test_cycle_produces_monotonic_record() {
        let h = harness(small_config());
        h.registry.register("demo", 8, sum_fitness()).unwrap();

        let record = h.engine.run_cycle("demo").await.unwrap();

        assert_eq!(record.generation_best.len(), 4);
        for pair in record.generation_best.windows(2) {
            assert!(pair[1] >= pair[0], "best score regressed: {pair:?}");
        }
        assert!(record.best_score >= record.generation_best[0]);
        assert!(record.best_score <= 8.0);
        assert!((record.best_genome.sum() - record.best_score).abs() < 1e-9);
        assert!(super::super::verify_proof(&record.proof));
    }

    #[tokio::test]
    async fn test_cycle_side_effects() {
        let h = harness(small_config());
        h.registry.register("aurora", 8, sum_fitness()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.bus
            .subscribe("aurora.*", move |e| {
                sink.lock().push(e.event_type.clone());
                Ok(())
            })
            .unwrap();

        let record = h.engine.run_cycle("aurora").await.unwrap();

        assert_eq!(*seen.lock(), vec!["genome_applied", "evolution_completed"]);
        assert_eq!(h.store.records().len(), 1);
        assert_eq!(h.engine.history("aurora", 10), vec![record.clone()]);
        let status = h.registry.get("aurora").unwrap().status();
        assert!(!status.cycle_in_flight);
        assert_eq!(status.last_best_score, Some(record.best_score));
        assert!(status
            .applied_params
            .as_ref()
            .is_some_and(|p| p.contains_key("vapi_temperature")));
    }

    #[tokio::test]
    async fn test_unknown_pod() {
        let h = harness(small_config());
        assert!(matches!(
            h.engine.run_cycle("ghost").await,
            Err(EvolutionError::UnknownPod { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_aborts_before_population() {
        let h = harness(small_config());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        h.registry
            .register(
                "dan",
                4,
                Arc::new(FnFitness::new(move |_: &Genome| {
                    c.fetch_add(1, Ordering::SeqCst);
                    1.0
                })),
            )
            .unwrap();
        h.governor.trip_breaker(EVOLUTION_CYCLE_BREAKER);

        let err = h.engine.run_cycle("dan").await.unwrap_err();
        assert!(matches!(err, EvolutionError::BreakerOpen { .. }));
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!h.registry.get("dan").unwrap().is_cycle_in_flight());
    }

    #[tokio::test]
    async fn test_already_running_is_rejected() {
        let h = harness(small_config());
        h.registry.register("ralph", 8, sum_fitness()).unwrap();
        let guard = h.engine.begin_cycle("ralph").unwrap();

        assert!(matches!(
            h.engine.run_cycle("ralph").await,
            Err(EvolutionError::AlreadyRunning { .. })
        ));
        drop(guard);
        assert!(h.engine.run_cycle("ralph").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_rejection_leaves_open_breaker_alone() {
        let h = harness(small_config());
        h.registry.register("ralph", 8, sum_fitness()).unwrap();
        let guard = h.engine.begin_cycle("ralph").unwrap();

        h.governor.trip_breaker(EVOLUTION_CYCLE_BREAKER);
        tokio::time::advance(Duration::from_secs(301)).await;

        assert!(matches!(
            h.engine.begin_cycle("ralph"),
            Err(EvolutionError::AlreadyRunning { .. })
        ));
        assert_eq!(
            h.governor
                .breaker_status(EVOLUTION_CYCLE_BREAKER)
                .map(|s| s.state),
            Some(BreakerState::Open)
        );

        drop(guard);
        assert!(h.engine.begin_cycle("ralph").is_ok());
        assert_eq!(
            h.governor
                .breaker_status(EVOLUTION_CYCLE_BREAKER)
                .map(|s| s.state),
            Some(BreakerState::HalfOpen)
        );
    }

    #[tokio::test]
    async fn test_breaker_rejection_keeps_event_counter() {
        let h = harness(small_config());
        let reg = h.registry.register("dan", 8, sum_fitness()).unwrap();
        for _ in 0..5 {
            reg.increment_events();
        }
        h.governor.trip_breaker(EVOLUTION_CYCLE_BREAKER);

        assert!(matches!(
            h.engine.begin_cycle("dan"),
            Err(EvolutionError::BreakerOpen { .. })
        ));
        assert_eq!(reg.event_count(), 5);
        assert!(!reg.is_cycle_in_flight());
    }

    struct Flaky;

    #[allow(clippy::panic)]
    #[async_trait]
    impl FitnessProvider for Flaky {
        async fn evaluate(&self, genome: &Genome) -> Result<f64, FitnessError> {
            let first = genome.genes()[0];
            if first < 0.25 {
                Err(FitnessError::Failed("model said no".into()))
            } else if first < 0.5 {
                panic!("provider bug")
            } else if first < 0.75 {
                Ok(f64::NAN)
            } else {
                Ok(first)
            }
        }
    }

    #[tokio::test]
    async fn test_failing_providers_score_zero_without_aborting() {
        let h = harness(small_config());
        h.registry.register("janus", 8, Arc::new(Flaky)).unwrap();

        let record = h.engine.run_cycle("janus").await.unwrap();
        assert!(record.best_score == 0.0 || record.best_score >= 0.75);
        assert_eq!(
            h.governor
                .breaker_status(EVOLUTION_CYCLE_BREAKER)
                .map(|s| s.consecutive_failures),
            Some(0)
        );
    }

    struct Sleepy;

    #[async_trait]
    impl FitnessProvider for Sleepy {
        async fn evaluate(&self, _genome: &Genome) -> Result<f64, FitnessError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_score_zero() {
        let h = harness(EvolutionConfig {
            population_size: 4,
            generations: 1,
            fitness_timeout_ms: 50,
            seed: Some(1),
            ..EvolutionConfig::default()
        });
        h.registry.register("sentinel_prime", 8, Arc::new(Sleepy)).unwrap();

        let record = h.engine.run_cycle("sentinel_prime").await.unwrap();
        assert_eq!(record.best_score, 0.0);
        assert_eq!(record.generation_best, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_fail_cycle() {
        let h = harness(small_config());
        h.registry.register("viral_music", 8, sum_fitness()).unwrap();
        h.store.fail_next(1);

        let record = h.engine.run_cycle("viral_music").await;
        assert!(record.is_ok());
        assert!(h.store.records().is_empty());
        assert_eq!(h.engine.history("viral_music", 5).len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_cycles_are_reproducible() {
        let a = harness(small_config());
        let b = harness(small_config());
        a.registry.register("demo", 8, sum_fitness()).unwrap();
        b.registry.register("demo", 8, sum_fitness()).unwrap();

        let ra = a.engine.run_cycle("demo").await.unwrap();
        let rb = b.engine.run_cycle("demo").await.unwrap();
        assert_eq!(ra.best_genome, rb.best_genome);
        assert_eq!(ra.generation_best, rb.generation_best);
    }

    #[tokio::test]
    async fn test_run_all_covers_every_pod() {
        let h = harness(small_config());
        for pod in ["a", "b", "c"] {
            h.registry.register(pod, 4, sum_fitness()).unwrap();
        }
        let results = h.engine.run_all().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(h.store.records().len(), 3);
    }

    #[tokio::test]
    async fn test_breaker_stays_closed_across_successes() {
        let h = harness(small_config());
        h.registry.register("demo", 8, sum_fitness()).unwrap();
        h.engine.run_cycle("demo").await.unwrap();
        assert_eq!(
            h.governor.breaker_status(EVOLUTION_CYCLE_BREAKER).map(|s| s.state),
            Some(BreakerState::Closed)
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let registry = Arc::new(PodRegistry::new());
        let result = EvolutionEngine::new(
            registry,
            Governor::builder().build(),
            Arc::new(EventBus::new(vec![], DEFAULT_MAX_DEPTH)),
            Arc::new(MemoryStore::new()),
            EvolutionConfig {
                population_size: 0,
                ..EvolutionConfig::default()
            },
        );
        assert!(matches!(result, Err(EvolutionError::InvalidConfig(_))));
    }

    #[cfg(feature = "signing")]
    #[tokio::test]
    async fn test_installed_signer_signs_records() {
        let h = harness(small_config());
        h.registry.register("demo", 8, sum_fitness()).unwrap();
        let signer = super::super::ProofSigner::from_bytes(&[3u8; 32]);
        let public_key = signer.public_key_hex();
        assert!(h.engine.set_signer(signer));
        assert!(!h.engine.set_signer(super::super::ProofSigner::generate()));

        let record = h.engine.run_cycle("demo").await.unwrap();
        assert_eq!(record.proof.signer.as_deref(), Some(public_key.as_str()));
        assert!(super::super::proof::verify_signature(&record.proof));
    }
}
