//! # Genome Registry & Decoder
//!
//! ## Responsibility
//! Hold, per pod, the fixed gene count, the pod's fitness capability and the
//! gene schema used to translate an abstract gene vector into named
//! parameters the pod can apply.
//!
//! ## Guarantees
//! - Every [`Genome`] built through its constructors has all genes in [0,1]
//! - Registration is unique per pod id; registrations are never removed
//! - Decoding is pure and deterministic
//!
//! ## NOT Responsible For
//! - Running the search (see [`crate::evolution`])
//! - Deciding when a cycle runs (see [`crate::scheduler`])

pub mod decoder;
pub mod registry;

pub use decoder::{DecodedParams, GeneSchema, GeneSpec, ParamKind, ParamValue, SchemaError};
pub use registry::{
    CycleGuard, FitnessError, FitnessProvider, FnFitness, PodRegistration, PodRegistry,
    PodStatus, RegistryError,
};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Clamp a gene into the closed unit interval.
///
/// `NaN` maps to the neutral midpoint `0.5`, so the result is always a
/// valid gene.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.5
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// An ordered, fixed-length vector of genes, each in [0,1].
///
/// The inner vector is private; every constructor clamps, so a `Genome`
/// can never hold an out-of-range gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f64>", into = "Vec<f64>")]
pub struct Genome(Vec<f64>);

impl Genome {
    /// Build a genome from raw values, clamping each into [0,1].
    pub fn clamped(genes: Vec<f64>) -> Self {
        Self(genes.into_iter().map(clamp_unit).collect())
    }

    /// Draw `len` genes uniformly from [0,1].
    pub fn random<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Self {
        Self((0..len).map(|_| rng.gen_range(0.0..=1.0)).collect())
    }

    /// Borrow the genes.
    pub fn genes(&self) -> &[f64] {
        &self.0
    }

    /// Number of genes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when the genome carries no genes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all genes. Handy as a toy fitness function.
    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }

    /// Consume the genome, returning the raw genes.
    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl From<Vec<f64>> for Genome {
    fn from(genes: Vec<f64>) -> Self {
        Self::clamped(genes)
    }
}

impl From<Genome> for Vec<f64> {
    fn from(genome: Genome) -> Self {
        genome.0
    }
}
