//! Full-size scenario: a 7,000-employee population over 2025–2027, plus a
//! year that must fail on an orphan contribution.

mod common;

use common::OrphanContribution;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use workforce_core::{
    config::SimConfig,
    error::SimError,
    event::EventType,
    generator::RuleBasedGenerator,
    orchestrator::{PipelineOrchestrator, RunOptions},
};

#[test]
fn seven_thousand_employees_over_three_years() {
    let config = SimConfig::default_test().with_headcount(7_000).with_threads(4);
    let mut orch = PipelineOrchestrator::build_test(config).unwrap();
    let summary = orch.run_all(&RunOptions::default()).unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.clean_years(), 3);

    let run_id = orch.run_id().to_string();
    let store = orch.store();
    assert_eq!(store.duplicate_event_uuid_count(&run_id).unwrap(), 0);
    assert_eq!(store.duplicate_state_key_count(&run_id).unwrap(), 0);

    let mut known: BTreeSet<String> = orch.census().records.iter().map(|r| r.employee_id.clone()).collect();
    for year in 2025..=2027 {
        let events = store.events_for_year(&run_id, year).unwrap();
        known.extend(
            events
                .iter()
                .filter(|e| e.event_type == EventType::Hire)
                .map(|e| e.employee_id.clone()),
        );
        let state = orch.state_for_year(year).unwrap().unwrap();
        assert_eq!(state.len(), known.len(), "one record per employee ever seen, year {year}");
        assert_eq!(store.state_record_count(&run_id, year).unwrap() as usize, known.len());
        assert!(state.employees.keys().all(|id| known.contains(id)));
    }

    let latest = orch.checkpoints().latest(&run_id).unwrap().unwrap();
    assert_eq!(latest.last_completed_year, 2027);
    assert_eq!(latest.config_fingerprint, orch.fingerprint());
    assert!(summary.years.iter().all(|y| y.validations.iter().all(|v| v.passed)));
}

#[test]
fn contribution_without_enrollment_fails_the_year() {
    let target = Arc::new(Mutex::new(None));
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test())
        .unwrap()
        .with_generator(Box::new(OrphanContribution::new(
            RuleBasedGenerator::new(),
            2026,
            Arc::clone(&target),
        )));

    let err = orch.run_all(&RunOptions::default()).unwrap_err();
    let target = target.lock().unwrap().clone().expect("target chosen");
    match &err {
        SimError::IncompleteState { employee_id, year, .. } => {
            assert_eq!(employee_id, &target);
            assert_eq!(*year, 2026);
        }
        other => panic!("expected incomplete state, got {other}"),
    }
    let message = err.to_string();
    assert!(message.contains(&target) && message.contains("2026"), "{message}");
    assert_eq!(err.exit_code(), 1);

    let run_id = orch.run_id().to_string();
    let latest = orch.checkpoints().latest(&run_id).unwrap().unwrap();
    assert_eq!(latest.last_completed_year, 2025, "no checkpoint for the failed year");
    assert!(orch.state_for_year(2026).unwrap().is_none());
    assert_eq!(orch.store().event_count_for_year(&run_id, 2026).unwrap(), 0);

    let summary = orch.last_summary().expect("summary of the failed run");
    assert_eq!(summary.failed_years(), vec![2026]);
    assert_eq!(summary.report(2026).unwrap().failed_stage.as_deref(), Some("accumulate_state"));
}
