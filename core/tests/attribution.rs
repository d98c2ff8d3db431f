//! Cross-year attribution: exact sum invariant, caching and gap detection.

use workforce_core::{
    attribution::{CrossYearCostAttributor, TargetMetric},
    cache::CacheManager,
    config::SimConfig,
    error::SimError,
    event::EventType,
    orchestrator::{PipelineOrchestrator, RunOptions},
    store::SimStore,
};

fn completed_run() -> PipelineOrchestrator {
    let mut orch = PipelineOrchestrator::build_test(SimConfig::default_test()).unwrap();
    orch.run_all(&RunOptions::default()).unwrap();
    orch
}

#[test]
fn attributed_deltas_sum_to_observed_change_for_every_metric() {
    let orch = completed_run();
    let attributor = orch.attributor();
    for metric in TargetMetric::ALL {
        let report = attributor.attribute_report(metric, 2025, 2027).unwrap();
        let observed = attributor.observed_delta(metric, 2025, 2027).unwrap();
        assert_eq!(report.observed_delta(), observed, "{}", metric.name());
        assert_eq!(
            report.attributed_delta(),
            observed,
            "{}: records do not sum to the observed change",
            metric.name()
        );
        assert!(report.records.iter().all(|r| r.delta_value != 0));
        assert!(report.records.iter().all(|r| r.simulation_year > 2025 && r.simulation_year <= 2027));
    }
}

#[test]
fn balance_growth_is_attributed_to_contributions() {
    let orch = completed_run();
    let records = orch.attributor().attribute(TargetMetric::ContributionBalance, 2025, 2027).unwrap();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r.event_type == EventType::Contribution));
    assert!(records.iter().all(|r| r.delta_value > 0));

    let stored = orch.store().events_in_range(orch.run_id(), 2026, 2027).unwrap();
    for r in &records {
        assert!(
            stored.iter().any(|e| e.event_uuid == r.contributing_event_uuid),
            "record points at an event that is not in the store"
        );
    }
}

#[test]
fn headcount_change_is_hires_minus_terminations() {
    let orch = completed_run();
    let records = orch.attributor().attribute(TargetMetric::ActiveHeadcount, 2025, 2026).unwrap();
    let hires = records.iter().filter(|r| r.event_type == EventType::Hire).count() as i64;
    let terms = records.iter().filter(|r| r.event_type == EventType::Termination).count() as i64;
    let sum: i64 = records.iter().map(|r| r.delta_value).sum();
    assert_eq!(sum, hires - terms);
}

#[test]
fn same_range_is_served_from_cache() {
    let orch = completed_run();
    let attributor = orch.attributor();
    let first = attributor.attribute_report(TargetMetric::EmployerMatch, 2025, 2027).unwrap();
    let hits_before = orch.cache().stats().tier1_hits;
    let second = attributor.attribute_report(TargetMetric::EmployerMatch, 2025, 2027).unwrap();
    assert_eq!(first, second);
    assert!(orch.cache().stats().tier1_hits > hits_before);
}

#[test]
fn attribution_ids_are_deterministic() {
    let a = completed_run();
    let b = completed_run();
    let ra = a.attributor().attribute(TargetMetric::EmployeeDeferrals, 2025, 2027).unwrap();
    let rb = b.attributor().attribute(TargetMetric::EmployeeDeferrals, 2025, 2027).unwrap();
    assert_eq!(ra, rb);
}

#[test]
fn reversed_range_is_rejected() {
    let orch = completed_run();
    let err = orch.attributor().attribute(TargetMetric::ActiveHeadcount, 2027, 2025).unwrap_err();
    assert!(matches!(err, SimError::Configuration(_)));
}

#[test]
fn year_without_stored_state_is_a_gap() {
    let orch = completed_run();
    let err = orch.attributor().attribute(TargetMetric::ActiveHeadcount, 2025, 2028).unwrap_err();
    match err {
        SimError::AttributionGap { year, .. } => assert_eq!(year, 2028),
        other => panic!("expected gap, got {other}"),
    }
}

#[test]
fn missing_event_in_store_is_a_gap_naming_year_and_employee() {
    let orch = completed_run();
    let run_id = orch.run_id();

    // Copy the run into a second store, dropping one 2026 contribution.
    let copy = SimStore::in_memory().unwrap();
    copy.migrate().unwrap();
    copy.insert_run(run_id, 42, "test", orch.fingerprint()).unwrap();
    let mut dropped = None;
    for year in 2025..=2027 {
        let mut events = orch.store().events_for_year(run_id, year).unwrap();
        if year == 2026 {
            let idx = events
                .iter()
                .position(|e| e.event_type == EventType::Contribution)
                .expect("a 2026 contribution");
            dropped = Some(events.remove(idx));
        }
        let state = orch.state_for_year(year).unwrap().unwrap();
        copy.write_year(run_id, year, &events, &state, "{}").unwrap();
    }
    let dropped = dropped.unwrap();

    let cache = CacheManager::in_memory();
    let err = CrossYearCostAttributor::new(&copy, &cache, run_id)
        .attribute(TargetMetric::ContributionBalance, 2025, 2027)
        .unwrap_err();
    match err {
        SimError::AttributionGap { year, employee_id, .. } => {
            assert_eq!(year, 2026);
            assert_eq!(employee_id, dropped.employee_id);
        }
        other => panic!("expected gap, got {other}"),
    }
}
