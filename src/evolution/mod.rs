//! # Evolution Engine
//!
//! ## Responsibility
//! Run one genetic optimisation cycle for a pod: random initial population,
//! concurrent fitness evaluation, tournament selection, blend crossover,
//! Gaussian mutation and single-individual elitism, then decode, apply,
//! persist and announce the winner.
//!
//! ## Guarantees
//! - At most one cycle per pod is in flight (the registration's cycle guard)
//! - Every scored genome lies in [0, 1]
//! - Best score per generation is non-decreasing
//! - A failing, slow or panicking fitness call scores 0 and never aborts
//!   the cycle
//! - Persistence failures are logged and never roll back a completed cycle
//!
//! ## NOT Responsible For
//! - Deciding when a cycle runs (see [`crate::scheduler`])
//! - Pod-specific scoring (each pod's [`crate::genome::FitnessProvider`])
//!
//! ## Module map
//! - [`engine`]    -- the cycle itself
//! - [`operators`] -- selection, crossover and mutation
//! - [`proof`]     -- tamper-evident improvement proofs

pub mod engine;
pub mod operators;
pub mod proof;

pub use engine::EvolutionEngine;
pub use proof::{verify_proof, ImprovementProof};
#[cfg(feature = "signing")]
pub use proof::{verify_signature, ProofSigner};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::genome::Genome;

/// Published after a cycle's winning parameters are applied.
pub const GENOME_APPLIED: &str = "genome_applied";
/// Published when a cycle completes.
pub const EVOLUTION_COMPLETED: &str = "evolution_completed";
/// Published when a started cycle fails.
pub const EVOLUTION_FAILED: &str = "evolution_failed";

/// Event types the engine publishes itself. They never count toward a
/// pod's trigger threshold.
pub const LIFECYCLE_EVENTS: [&str; 3] = [GENOME_APPLIED, EVOLUTION_COMPLETED, EVOLUTION_FAILED];

// ── Default value functions ──────────────────────────────────────────────

fn default_population_size() -> usize {
    50
}

fn default_generations() -> usize {
    10
}

fn default_tournament_size() -> usize {
    3
}

fn default_crossover_rate() -> f64 {
    0.5
}

fn default_blend_alpha() -> f64 {
    0.5
}

fn default_mutation_rate() -> f64 {
    0.2
}

fn default_gene_mutation_prob() -> f64 {
    0.3
}

fn default_mutation_sigma() -> f64 {
    0.15
}

/// Default per-call fitness timeout: 5000ms.
fn default_fitness_timeout_ms() -> u64 {
    5_000
}

// ── Config ───────────────────────────────────────────────────────────────

/// Fixed parameters of the genetic search, shared by every pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Individuals per generation.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Generations after the initial population.
    #[serde(default = "default_generations")]
    pub generations: usize,
    /// Contestants per tournament.
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    /// Probability that a parent pair is blended.
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    /// Blend crossover alpha.
    #[serde(default = "default_blend_alpha")]
    pub blend_alpha: f64,
    /// Probability that an offspring is mutated at all.
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
    /// Per-gene mutation probability inside a mutated offspring.
    #[serde(default = "default_gene_mutation_prob")]
    pub gene_mutation_prob: f64,
    /// Standard deviation of the Gaussian mutation noise.
    #[serde(default = "default_mutation_sigma")]
    pub mutation_sigma: f64,
    /// Per-call fitness timeout in milliseconds.
    #[serde(default = "default_fitness_timeout_ms")]
    pub fitness_timeout_ms: u64,
    /// Fixed RNG seed for reproducible cycles. `None` seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            generations: default_generations(),
            tournament_size: default_tournament_size(),
            crossover_rate: default_crossover_rate(),
            blend_alpha: default_blend_alpha(),
            mutation_rate: default_mutation_rate(),
            gene_mutation_prob: default_gene_mutation_prob(),
            mutation_sigma: default_mutation_sigma(),
            fitness_timeout_ms: default_fitness_timeout_ms(),
            seed: None,
        }
    }
}

impl EvolutionConfig {
    /// Per-call fitness timeout.
    pub fn fitness_timeout(&self) -> Duration {
        Duration::from_millis(self.fitness_timeout_ms)
    }

    /// Check every field, returning one entry per problem.
    pub fn problems(&self) -> Vec<ConfigProblem> {
        let mut problems = Vec::new();
        let mut push = |field: &'static str, value: String, reason: &str| {
            problems.push(ConfigProblem {
                field,
                value,
                reason: reason.to_string(),
            })
        };
        if self.population_size < 2 {
            push("population_size", self.population_size.to_string(), "must be at least 2");
        }
        if self.tournament_size == 0 {
            push("tournament_size", "0".into(), "must be at least 1");
        }
        for (field, value) in [
            ("crossover_rate", self.crossover_rate),
            ("mutation_rate", self.mutation_rate),
            ("gene_mutation_prob", self.gene_mutation_prob),
        ] {
            if !(0.0..=1.0).contains(&value) {
                push(field, value.to_string(), "must be between 0.0 and 1.0");
            }
        }
        if !(self.blend_alpha.is_finite() && self.blend_alpha >= 0.0) {
            push("blend_alpha", self.blend_alpha.to_string(), "must be a finite value >= 0");
        }
        if !(self.mutation_sigma.is_finite() && self.mutation_sigma >= 0.0) {
            push("mutation_sigma", self.mutation_sigma.to_string(), "must be a finite value >= 0");
        }
        if self.fitness_timeout_ms == 0 {
            push("fitness_timeout_ms", "0".into(), "must be greater than 0");
        }
        problems
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`EvolutionError::InvalidConfig`] listing every problem found.
    pub fn validate(&self) -> Result<(), EvolutionError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            let joined: Vec<String> = problems.iter().map(ToString::to_string).collect();
            Err(EvolutionError::InvalidConfig(joined.join("; ")))
        }
    }
}

/// One invalid [`EvolutionConfig`] field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    /// Field name.
    pub field: &'static str,
    /// Offending value.
    pub value: String,
    /// Constraint it breaks.
    pub reason: String,
}

impl std::fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = {}: {}", self.field, self.value, self.reason)
    }
}

// ── Record ───────────────────────────────────────────────────────────────

/// Outcome of one completed cycle. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionRecord {
    /// Unique cycle id.
    pub cycle_id: Uuid,
    /// Pod the cycle ran for.
    pub pod_id: String,
    /// Winning genome.
    pub best_genome: Genome,
    /// Its fitness.
    pub best_score: f64,
    /// Generations run after the initial population.
    pub generations: usize,
    /// Individuals per generation.
    pub population_size: usize,
    /// Best score per generation; index 0 is the initial population.
    pub generation_best: Vec<f64>,
    /// Tamper-evident summary of the improvement.
    pub proof: ImprovementProof,
    /// Completion time.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
impl EvolutionRecord {
    pub(crate) fn for_test(pod: &str, score: f64) -> Self {
        let cycle_id = Uuid::new_v4();
        let genome = Genome::clamped(vec![0.5; 8]);
        Self {
            cycle_id,
            pod_id: pod.to_string(),
            proof: ImprovementProof::new(pod, cycle_id, 0.0, score, &genome, 1),
            best_genome: genome,
            best_score: score,
            generations: 1,
            population_size: 2,
            generation_best: vec![0.0, score],
            timestamp: Utc::now(),
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────

/// Why a cycle did not produce a record.
#[derive(Debug, Error)]
pub enum EvolutionError {
    /// The pod is not registered.
    #[error("unknown pod '{pod}'")]
    UnknownPod {
        /// Pod id.
        pod: String,
    },

    /// A cycle for this pod is already in flight.
    #[error("evolution cycle already running for pod '{pod}'")]
    AlreadyRunning {
        /// Pod id.
        pod: String,
    },

    /// The evolution breaker is open; no population was created.
    #[error("circuit breaker '{breaker}' is open; retry in {retry_after:?}")]
    BreakerOpen {
        /// Breaker name.
        breaker: String,
        /// Time left until a trial cycle is allowed.
        retry_after: Duration,
    },

    /// The engine configuration is unusable.
    #[error("invalid evolution config: {0}")]
    InvalidConfig(String),

    /// The cycle itself failed after starting.
    #[error("evolution cycle failed: {0}")]
    Internal(String),
}

impl EvolutionError {
    /// `true` when the caller should simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvolutionError::AlreadyRunning { .. } | EvolutionError::BreakerOpen { .. }
        )
    }

    /// Short label used for metrics and events.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            EvolutionError::UnknownPod { .. } => "unknown_pod",
            EvolutionError::AlreadyRunning { .. } => "already_running",
            EvolutionError::BreakerOpen { .. } => "breaker_open",
            EvolutionError::InvalidConfig(_) => "invalid_config",
            EvolutionError::Internal(_) => "failed",
        }
    }
}
