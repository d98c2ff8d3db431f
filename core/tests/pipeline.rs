//! Orchestrator behaviour: validation gates, continue-on-error, reports
//! and the execution plan.

mod common;

use common::OrphanContribution;
use std::sync::{Arc, Mutex};
use workforce_core::{
    config::SimConfig,
    error::SimError,
    generator::RuleBasedGenerator,
    optimizer::{AvailableResources, CoordinationOptimizer, ExecutionMode, Stage},
    orchestrator::{PipelineOrchestrator, RunOptions},
    report::{YearPhase, YearStatus},
    validation::{Severity, YearContext, YearValidator},
};


/// Fails every year from `from_year` on.
struct FailFrom {
    from_year: i32,
}

impl YearValidator for FailFrom {
    fn name(&self) -> &'static str {
        "fail_from"
    }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        (ctx.year >= self.from_year).then(|| format!("forced failure in {}", ctx.year))
    }
}

#[test]
fn error_severity_failure_halts_before_checkpoint() {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    orch.add_validator(Box::new(FailFrom { from_year: 2026 }));

    let err = orch.run_all(&RunOptions::default()).unwrap_err();
    match &err {
        SimError::ValidationGateFailure { year, check, stage, .. } => {
            assert_eq!(*year, 2026);
            assert_eq!(check, "fail_from");
            assert_eq!(*stage, "validate");
        }
        other => panic!("expected gate failure, got {other}"),
    }
    assert_eq!(err.exit_code(), 1);

    let run_id = orch.run_id().to_string();
    assert_eq!(orch.checkpoints().latest(&run_id).unwrap().unwrap().last_completed_year, 2025);
    assert_eq!(orch.store().event_count_for_year(&run_id, 2026).unwrap(), 0);
    assert!(orch.state_for_year(2026).unwrap().is_none());

    let report = orch.last_summary().unwrap().report(2026).unwrap();
    assert_eq!(report.status, YearStatus::Failed);
    assert_eq!(report.phase, YearPhase::Failed);
    assert_eq!(report.failed_stage.as_deref(), Some("validate"));
}

#[test]
fn warn_severity_failure_is_reported_not_fatal() {
    let mut config = SimConfig::default_test();
    config.validation.severities.insert("fail_from".into(), Severity::Warn);
    let mut orch = PipelineOrchestrator::build_test(config).unwrap();
    orch.add_validator(Box::new(FailFrom { from_year: 2025 }));

    let summary = orch.run_all(&RunOptions::default()).unwrap();
    assert!(summary.is_success());
    for y in &summary.years {
        let outcome = y.validations.iter().find(|v| v.check == "fail_from").unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.severity, Severity::Warn);
        assert_eq!(y.warnings(), 1);
    }
}

#[test]
fn gate_can_be_disabled() {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    orch.add_validator(Box::new(FailFrom { from_year: 2025 }));
    let options = RunOptions { fail_on_validation_error: false, ..RunOptions::default() };
    let summary = orch.run_all(&options).unwrap();
    assert_eq!(summary.clean_years(), 3);
}

#[test]
fn continue_on_error_skips_the_failed_year() {
    let target = Arc::new(Mutex::new(None));
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test())
        .unwrap()
        .with_generator(Box::new(OrphanContribution::new(RuleBasedGenerator::new(), 2026, Arc::clone(&target))));
    let options = RunOptions { continue_on_error: true, ..RunOptions::default() };

    let summary = orch.run_all(&options).unwrap();
    assert_eq!(summary.failed_years(), vec![2026]);
    assert_eq!(summary.clean_years(), 2);
    assert_eq!(summary.last_completed_year, Some(2027));
    assert!(!summary.is_success());

    // Nothing of 2026 persisted; 2027 built on the 2025 state.
    let run_id = orch.run_id().to_string();
    assert!(orch.state_for_year(2026).unwrap().is_none());
    assert_eq!(orch.store().event_count_for_year(&run_id, 2026).unwrap(), 0);
    let s2025 = orch.state_for_year(2025).unwrap().unwrap();
    let s2027 = orch.state_for_year(2027).unwrap().unwrap();
    assert!(s2027.len() >= s2025.len());
    let years: Vec<i32> = orch.checkpoints().history(&run_id).unwrap().iter().map(|c| c.last_completed_year).collect();
    assert_eq!(years, vec![2025, 2027]);
}

#[test]
fn reports_are_written_per_year_and_for_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SimConfig::default_test();
    config.report_dir = Some(dir.path().to_path_buf());
    let mut orch = PipelineOrchestrator::build_test(config).unwrap();
    let summary = orch.run_all(&RunOptions::default()).unwrap();

    let run_dir = dir.path().join(orch.run_id());
    for year in 2025..=2027 {
        let raw = std::fs::read_to_string(run_dir.join(format!("year-{year}.json"))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["simulation_year"], year);
        assert_eq!(value["status"], "completed");
        assert_eq!(value["phase"], "CHECKPOINTED");
    }
    let table = std::fs::read_to_string(run_dir.join("summary.txt")).unwrap();
    assert_eq!(table, summary.render_table());
    assert!(table.contains("2027"));
    assert!(run_dir.join("summary.json").exists());

    let stored = orch.store().year_reports(orch.run_id()).unwrap();
    assert_eq!(stored.len(), 3);
}

#[test]
fn summary_carries_cache_stats_and_overhead() {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test().with_threads(2)).unwrap();
    let summary = orch.run_all(&RunOptions::default()).unwrap();
    assert_eq!(summary.cache.misses, 3, "one state computation per year");
    let overhead = summary.overhead.expect("overhead report");
    assert!(overhead.measured_wall_ms > 0.0);
    assert!(overhead.actual_reduction_pct >= 0.0);
    assert_eq!(orch.timings().wall_ms.len(), 3);
}

#[test]
fn plan_runs_derivation_in_parallel_only_with_enough_work() {
    let optimizer = CoordinationOptimizer::default();
    let resources = AvailableResources { threads: 4, allow_parallel: true, durable_entries: 0, resuming: false };

    let big = optimizer.plan(&[2025, 2026], 5_000, &resources);
    big.validate().unwrap();
    let year = big.year(2025).unwrap();
    assert_eq!(year.mode_of(Stage::DeriveWorkforce), ExecutionMode::Parallel);
    assert_eq!(year.mode_of(Stage::Persist), ExecutionMode::Sequential);
    assert!(big.estimated_reduction_pct > 0.0);

    let tiny = optimizer.plan(&[2025], 10, &resources);
    assert!(!tiny.parallel_derivation);
}

#[test]
fn point_lookup_matches_the_year_state() {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    orch.run_all(&RunOptions::default()).unwrap();
    let run_id = orch.run_id().to_string();

    for year in 2025..=2027 {
        let state = orch.state_for_year(year).unwrap().unwrap();
        for id in state.employees.keys().take(25) {
            let record = orch.store().employee_state(&run_id, id, year).unwrap();
            assert_eq!(record.as_ref(), state.get(id), "{id} in {year}");
        }
    }
    assert!(orch.store().employee_state(&run_id, "no-such-employee", 2026).unwrap().is_none());
    assert!(orch.store().employee_state(&run_id, "E000001", 2030).unwrap().is_none());
}
