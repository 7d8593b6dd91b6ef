//! # End-to-end evolution cycle
//!
//! Registers the `demo` pod (`score = sum(genome)`), runs one cycle with a
//! population of 10 over 3 generations and checks the record, the proof,
//! the persisted copy and the lifecycle events.

use std::sync::Arc;

use parking_lot::Mutex;
use pod_evolution_kernel::evolution::verify_proof;
use pod_evolution_kernel::{Event, FnFitness, Genome, Kernel, KernelConfig, MemoryStore};

fn demo_kernel(store: Arc<MemoryStore>) -> Kernel {
    let mut config = KernelConfig::default();
    config.evolution.population_size = 10;
    config.evolution.generations = 3;
    config.scheduler.sweep_enabled = false;
    let kernel = Kernel::new(config, store, None).unwrap();
    kernel
        .register_pod("demo", 8, Arc::new(FnFitness::new(|g: &Genome| g.sum())))
        .unwrap();
    kernel
}

#[tokio::test]
async fn test_demo_cycle_improves_on_generation_zero() {
    let store = Arc::new(MemoryStore::new());
    let kernel = demo_kernel(Arc::clone(&store));

    let record = kernel.trigger_cycle("demo").await.unwrap();

    assert_eq!(record.pod_id, "demo");
    assert_eq!(record.population_size, 10);
    assert_eq!(record.generations, 3);
    assert_eq!(record.best_genome.len(), 8);
    assert!(record.best_genome.genes().iter().all(|g| (0.0..=1.0).contains(g)));
    assert!((record.best_score - record.best_genome.sum()).abs() < 1e-9);
    assert!(record.best_score <= 8.0);

    assert_eq!(record.generation_best.len(), 4);
    assert!(record.best_score >= record.generation_best[0]);
    for pair in record.generation_best.windows(2) {
        assert!(pair[1] >= pair[0], "elitism violated: {:?}", record.generation_best);
    }

    assert!(verify_proof(&record.proof));
    assert_eq!(store.records().len(), 1);
    assert_eq!(store.records()[0].cycle_id, record.cycle_id);
}

#[tokio::test]
async fn test_lifecycle_events_follow_the_cycle() {
    let kernel = demo_kernel(Arc::new(MemoryStore::new()));
    let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    kernel
        .subscribe("demo.*", move |event| {
            sink.lock().push(event.clone());
            Ok(())
        })
        .unwrap();

    let record = kernel.trigger_cycle("demo").await.unwrap();

    let events = seen.lock().clone();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["genome_applied", "evolution_completed"]);

    let completed = &events[1];
    assert_eq!(
        completed.payload["best_score"].as_f64(),
        Some(record.best_score)
    );
    assert_eq!(completed.payload["generations"].as_u64(), Some(3));
    assert_eq!(
        completed.payload["cycle_id"].as_str(),
        Some(record.cycle_id.to_string().as_str())
    );
}

#[tokio::test]
async fn test_applied_params_match_decode() {
    let kernel = demo_kernel(Arc::new(MemoryStore::new()));
    let record = kernel.trigger_cycle("demo").await.unwrap();

    let status = kernel.pod_status("demo").unwrap();
    let decoded = kernel.decode("demo", &record.best_genome).unwrap();
    assert_eq!(status.applied_params, Some(decoded));
    assert!(!status.cycle_in_flight);
}

#[tokio::test]
async fn test_persistence_failure_does_not_roll_back() {
    let store = Arc::new(MemoryStore::new());
    store.fail_next(10);
    let kernel = demo_kernel(Arc::clone(&store));

    let record = kernel.trigger_cycle("demo").await.unwrap();
    assert!(store.records().is_empty());
    assert_eq!(kernel.evolution_history("demo", 5)[0].cycle_id, record.cycle_id);
}

#[tokio::test]
async fn test_trigger_all_covers_every_pod() {
    let kernel = demo_kernel(Arc::new(MemoryStore::new()));
    kernel
        .register_pod("ralph", 4, Arc::new(FnFitness::new(|g: &Genome| g.sum())))
        .unwrap();

    let results = kernel.trigger_all().await;
    let pods: Vec<&str> = results.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(pods, vec!["demo", "ralph"]);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
}
