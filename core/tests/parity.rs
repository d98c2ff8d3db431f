//! Parity between execution strategies, and detection of divergent runs.

use workforce_core::{
    config::{ComputeEngine, SimConfig},
    error::SimError,
    orchestrator::{PipelineOrchestrator, RunOptions},
    parity::{dual_run, ParityValidator, RunArtifacts, Tolerance},
};

fn population(headcount: usize) -> SimConfig {
    SimConfig::default_test().with_headcount(headcount)
}

#[test]
fn thread_count_has_full_parity() {
    let result = dual_run(
        "threads",
        population(600).with_threads(1),
        population(600).with_threads(4),
        &ParityValidator::cross_strategy(),
        &Tolerance::default(),
    )
    .unwrap();
    assert!(result.passed, "{:?}", result.details);
    assert!(result.score >= 0.9999);
    assert_eq!(result.identity_mismatches, 0);
    assert!(result.compared > 0);
    assert_eq!(result.baseline_strategy, "in_memory/threads=1");
    assert_eq!(result.comparison_strategy, "in_memory/threads=4");
}

#[test]
fn sql_and_in_memory_engines_agree() {
    let result = dual_run(
        "engines",
        population(300).with_engine(ComputeEngine::InMemory),
        population(300).with_engine(ComputeEngine::Sql),
        &ParityValidator::cross_strategy(),
        &Tolerance::default(),
    )
    .unwrap();
    assert!(result.passed, "{:?}", result.details);
    assert_eq!(result.identity_mismatches, 0);
    assert_eq!(result.matched, result.compared);
}

#[test]
fn different_seeds_fail_parity_with_bounded_details() {
    let artifacts = |seed: u64| {
        let mut orch = PipelineOrchestrator::build_test(population(200).with_seed(seed)).unwrap();
        orch.run_all(&RunOptions::default()).unwrap();
        RunArtifacts::from_store(orch.store(), orch.run_id(), &format!("seed={seed}")).unwrap()
    };
    let a = artifacts(1);
    let b = artifacts(2);

    let validator = ParityValidator::determinism().with_max_details(5);
    let result = validator.compare("seeds", &a, &b, &Tolerance::exact());
    assert!(!result.passed);
    assert!(result.identity_mismatches > 0);
    assert!(result.score < 1.0);
    assert!(!result.details.is_empty());
    assert!(result.details.len() <= 5);
}

#[test]
fn parity_needs_a_shared_fingerprint() {
    let err = dual_run(
        "mismatch",
        population(50).with_seed(1),
        population(50).with_seed(2),
        &ParityValidator::cross_strategy(),
        &Tolerance::default(),
    )
    .unwrap_err();
    assert!(matches!(err, SimError::Configuration(_)), "got {err}");
}
