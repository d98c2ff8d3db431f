//! Checkpoint, resume, force and cancellation behaviour.

use std::path::Path;
use workforce_core::{
    config::SimConfig,
    error::SimError,
    generator::{EventGenerator, RuleBasedGenerator},
    orchestrator::{CancelToken, PipelineOrchestrator, RunOptions},
    report::YearStatus,
    rng::RngBank,
    state::AccumulatedState,
    store::SimStore,
};

const RUN_ID: &str = "resume-test";

fn file_config(dir: &Path) -> SimConfig {
    SimConfig::default_test().with_checkpoint_dir(dir.join("checkpoints"))
}

fn open(dir: &Path, config: SimConfig) -> PipelineOrchestrator {
    let db = dir.join("run.db");
    let store = SimStore::open(db.to_str().unwrap()).expect("open store");
    PipelineOrchestrator::build(RUN_ID, config, store).expect("build")
}

fn uninterrupted() -> PipelineOrchestrator {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    orch.run_all(&RunOptions::default()).unwrap();
    orch
}

#[test]
fn interrupted_then_resumed_matches_uninterrupted() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        let summary = first.run(&[2025, 2026], &RunOptions::default()).unwrap();
        assert_eq!(summary.last_completed_year, Some(2026));
    }

    let mut second = open(dir.path(), file_config(dir.path()));
    let summary = second.run_all(&RunOptions::resuming()).unwrap();
    let statuses: Vec<YearStatus> = summary.years.iter().map(|y| y.status).collect();
    assert_eq!(statuses, vec![YearStatus::Resumed, YearStatus::Resumed, YearStatus::Completed]);
    assert_eq!(summary.last_completed_year, Some(2027));

    let reference = uninterrupted();
    for year in 2025..=2027 {
        assert_eq!(
            second.state_for_year(year).unwrap(),
            reference.state_for_year(year).unwrap(),
            "resumed state differs in {year}"
        );
    }
    assert_eq!(
        second.store().event_log_dump(RUN_ID).unwrap(),
        reference.store().event_log_dump(reference.run_id()).unwrap()
    );
}

#[test]
fn rerun_without_resume_refuses_existing_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        first.run(&[2025], &RunOptions::default()).unwrap();
    }
    let mut second = open(dir.path(), file_config(dir.path()));
    let err = second.run_all(&RunOptions::default()).unwrap_err();
    assert!(matches!(err, SimError::StaleCheckpoint { .. }), "got {err}");
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn changed_config_is_a_stale_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        first.run(&[2025], &RunOptions::default()).unwrap();
    }
    let mut changed = file_config(dir.path());
    changed.plan.match_rate = 1.0;
    let mut second = open(dir.path(), changed);
    let err = second.run_all(&RunOptions::resuming()).unwrap_err();
    match &err {
        SimError::StaleCheckpoint { run_id, checkpoint_fingerprint, config_fingerprint } => {
            assert_eq!(run_id, RUN_ID);
            assert_ne!(checkpoint_fingerprint, config_fingerprint);
        }
        other => panic!("expected stale checkpoint, got {other}"),
    }
    assert_eq!(err.exit_code(), 3);
    // Nothing ran: the 2025 checkpoint is still the latest.
    let latest = second.checkpoints().latest(RUN_ID).unwrap().unwrap();
    assert_eq!(latest.last_completed_year, 2025);
}

#[test]
fn execution_knobs_do_not_invalidate_a_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        first.run(&[2025], &RunOptions::default()).unwrap();
    }
    let config = file_config(dir.path()).with_threads(4);
    let mut second = open(dir.path(), config);
    let summary = second.run_all(&RunOptions::resuming()).unwrap();
    assert_eq!(summary.clean_years(), 2);
}

#[test]
fn force_discards_checkpoints_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        first.run_all(&RunOptions::default()).unwrap();
    }
    let mut changed = file_config(dir.path());
    changed.plan.match_rate = 1.0;
    let mut second = open(dir.path(), changed);
    let summary = second.run_all(&RunOptions::forced()).unwrap();
    assert_eq!(summary.clean_years(), 3);
    let history = second.checkpoints().history(RUN_ID).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|cp| cp.config_fingerprint == second.fingerprint()));
}

#[test]
fn checkpoint_files_are_per_year_json() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = open(dir.path(), file_config(dir.path()));
    orch.run_all(&RunOptions::default()).unwrap();
    for year in 2025..=2027 {
        let path = dir.path().join("checkpoints").join(RUN_ID).join(format!("year-{year}.json"));
        assert!(path.exists(), "missing {}", path.display());
    }
    let latest = orch.checkpoints().latest(RUN_ID).unwrap().unwrap();
    assert_eq!(latest.last_completed_year, 2027);
    assert_eq!(latest.summary_metrics.simulation_year, 2027);
}

#[test]
fn checkpoint_without_stored_output_is_unresumable() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut first = open(dir.path(), file_config(dir.path()));
        first.run(&[2025], &RunOptions::default()).unwrap();
    }
    // Same checkpoints, but a fresh database that never saw the run.
    let mut second = PipelineOrchestrator::build(RUN_ID, file_config(dir.path()), SimStore::in_memory().unwrap())
        .unwrap();
    let err = second.run_all(&RunOptions::resuming()).unwrap_err();
    match &err {
        SimError::CheckpointWithoutData { run_id, year } => {
            assert_eq!(run_id, RUN_ID);
            assert_eq!(*year, 2025);
        }
        other => panic!("expected unresumable checkpoint, got {other}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(second.store().event_count_for_year(RUN_ID, 2026).unwrap(), 0);
}

#[test]
fn skipping_a_year_is_a_configuration_error() {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    let err = orch.run(&[2026, 2027], &RunOptions::default()).unwrap_err();
    assert!(matches!(err, SimError::Configuration(_)), "got {err}");
    assert_eq!(err.exit_code(), 2);
}

// ── Cancellation ─────────────────────────────────────────────────────────

/// Cancels the run while generating `year`.
struct CancelDuring {
    inner: RuleBasedGenerator,
    year:  i32,
    token: CancelToken,
}

impl EventGenerator for CancelDuring {
    fn name(&self) -> &'static str {
        "cancel_during"
    }

    fn generate(
        &self,
        year: i32,
        prior: &AccumulatedState,
        config: &SimConfig,
        rng: &RngBank,
    ) -> workforce_core::error::SimResult<Vec<workforce_core::event::Event>> {
        if year == self.year {
            self.token.cancel();
        }
        self.inner.generate(year, prior, config, rng)
    }
}

#[test]
fn cancellation_stops_before_commit() {
    let orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    let token = orch.cancel_token();
    let mut orch = orch.with_generator(Box::new(CancelDuring {
        inner: RuleBasedGenerator::new(),
        year:  2026,
        token: token.clone(),
    }));

    let summary = orch.run_all(&RunOptions::default()).unwrap();
    let cancelled = summary.cancelled_at.expect("cancel point");
    assert_eq!(cancelled.year, 2026);
    assert_eq!(cancelled.stage, "generate_events");
    assert!(!summary.is_success());
    assert_eq!(summary.last_completed_year, Some(2025));

    let run_id = orch.run_id().to_string();
    assert_eq!(orch.checkpoints().latest(&run_id).unwrap().unwrap().last_completed_year, 2025);
    assert_eq!(orch.store().event_count_for_year(&run_id, 2026).unwrap(), 0);
    assert!(orch.state_for_year(2026).unwrap().is_none());

    // Resume after clearing the token finishes the run.
    token.reset();
    let summary = orch.run_all(&RunOptions::resuming()).unwrap();
    assert_eq!(summary.last_completed_year, Some(2027));
}
