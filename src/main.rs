//! Demo binary for pod-evolution-kernel
//!
//! Registers three pods, drives one of them past its event threshold, fires a
//! cross-pod route and prints the resulting evolution record.
//!
//! ## Environment Variables
//!
//! - `KERNEL_CONFIG=path/to/kernel.toml`: load configuration from a file
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pod_evolution_kernel::config::load_from_file;
use pod_evolution_kernel::genome::ParamValue;
use pod_evolution_kernel::notify::LogNotifier;
use pod_evolution_kernel::{
    init_tracing, metrics, DecodedParams, Event, FitnessError, FitnessProvider, FnFitness,
    Genome, Kernel, KernelConfig, MemoryStore,
};
use tracing::{info, warn};

/// Scores a genome by closeness to a fixed "ideal" booking profile.
struct BookingFitness {
    target: [f64; 8],
}

#[async_trait]
impl FitnessProvider for BookingFitness {
    async fn evaluate(&self, genome: &Genome) -> Result<f64, FitnessError> {
        // Simulated call latency.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let distance: f64 = genome
            .genes()
            .iter()
            .zip(self.target.iter())
            .map(|(g, t)| (g - t).powi(2))
            .sum();
        Ok(10.0 - distance)
    }

    async fn apply(&self, params: &DecodedParams) -> Result<(), FitnessError> {
        if let Some(ParamValue::Label(style)) = params.get("opener_variant") {
            info!(pod = "aurora", opener_variant = %style, "applied new opener variant");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();
    metrics::init_metrics()?;

    let mut config = match std::env::var("KERNEL_CONFIG") {
        Ok(path) => load_from_file(Path::new(&path))?,
        Err(_) => KernelConfig::default(),
    };
    // Keep the demo quick.
    config.evolution.population_size = config.evolution.population_size.min(20);
    config.evolution.generations = config.evolution.generations.min(5);

    let threshold = config.scheduler.event_threshold;
    let kernel = Kernel::new(
        config,
        Arc::new(MemoryStore::new()),
        Some(Arc::new(LogNotifier)),
    )?;
    let handles = kernel.start();

    kernel.register_pod("demo", 8, Arc::new(FnFitness::new(|g: &Genome| g.sum())))?;
    kernel.register_pod(
        "aurora",
        8,
        Arc::new(BookingFitness {
            target: [0.3, 0.6, 0.5, 0.8, 0.4, 0.7, 0.5, 0.9],
        }),
    )?;
    kernel.register_pod("syntropy", 8, Arc::new(FnFitness::new(|g: &Genome| g.sum())))?;

    let completed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&completed);
    kernel.subscribe("evolution_completed", move |event| {
        seen.fetch_add(1, Ordering::SeqCst);
        info!(
            pod = %event.pod,
            best_score = ?event.payload.get("best_score"),
            "cycle completed"
        );
        Ok(())
    })?;
    kernel.subscribe("syntropy.generate_resource", |event| {
        info!(
            source = ?event.payload.get("source_pod"),
            "syntropy received routed signal"
        );
        Ok(())
    })?;

    info!(threshold, "publishing demo activity");
    for i in 0..threshold {
        kernel.publish(Event::new("demo", "call_completed").with("call", i));
    }

    let report = kernel.publish(Event::new("aurora", "booking_failed").with("lead", "L-42"));
    info!(routed = report.routed, "aurora booking failure published");

    match kernel.trigger_cycle("aurora").await {
        Ok(record) => info!(
            pod = %record.pod_id,
            best_score = record.best_score,
            improved = record.proof.improved,
            "aurora cycle finished"
        ),
        Err(e) if e.is_retryable() => warn!(error = %e, "aurora busy, try later"),
        Err(e) => return Err(e.into()),
    }

    for _ in 0..200 {
        if !kernel.evolution_history("demo", 1).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if let Some(record) = kernel.evolution_history("demo", 1).into_iter().next() {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&kernel.pod_status("aurora")?)?
    );
    info!(
        completed = completed.load(Ordering::SeqCst),
        "demo finished"
    );

    kernel.shutdown();
    handles.join().await;
    print!("{}", metrics::gather_metrics());
    Ok(())
}
