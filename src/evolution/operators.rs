//! Genetic operators over raw gene slices.
//!
//! Every operator that can move a gene clamps it back into [0, 1] before
//! returning, so callers never observe an out-of-range gene.

use std::f64::consts::PI;

use rand::Rng;

use crate::genome::clamp_unit;

/// Tournament selection with replacement.
///
/// Samples `size` indices uniformly and returns the one with the highest
/// score. Returns 0 for an empty population.
pub fn tournament_select<R: Rng + ?Sized>(scores: &[f64], size: usize, rng: &mut R) -> usize {
    if scores.is_empty() {
        return 0;
    }
    let mut best = rng.gen_range(0..scores.len());
    for _ in 1..size.max(1) {
        let candidate = rng.gen_range(0..scores.len());
        if scores[candidate] > scores[best] {
            best = candidate;
        }
    }
    best
}

/// Blend crossover (BLX-alpha) applied in place to two parents.
///
/// For each gene pair a mixing factor `gamma` is drawn from
/// `[-alpha, 1 + alpha]`, so children may land slightly outside the
/// parents' span; results are clamped.
pub fn blend_crossover<R: Rng + ?Sized>(a: &mut [f64], b: &mut [f64], alpha: f64, rng: &mut R) {
    for (x, y) in a.iter_mut().zip(b.iter_mut()) {
        let gamma = (1.0 + 2.0 * alpha) * rng.gen::<f64>() - alpha;
        let (x0, y0) = (*x, *y);
        *x = clamp_unit((1.0 - gamma) * x0 + gamma * y0);
        *y = clamp_unit(gamma * x0 + (1.0 - gamma) * y0);
    }
}

/// Gaussian mutation in place: each gene independently, with probability
/// `gene_prob`, receives `N(0, sigma)` noise. Results are clamped.
pub fn gaussian_mutate<R: Rng + ?Sized>(genes: &mut [f64], sigma: f64, gene_prob: f64, rng: &mut R) {
    for gene in genes.iter_mut() {
        if rng.gen::<f64>() < gene_prob {
            *gene = clamp_unit(*gene + sigma * standard_normal(rng));
        }
    }
}

/// One draw from the standard normal distribution (Box-Muller).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // 1 - u is in (0, 1], keeping ln finite.
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Index of the highest score. Ties resolve to the lowest index; NaN never
/// wins.
pub fn argmax(scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some(b) if scores[b] >= s => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}
