//! ParityValidator — certifies that two runs of the same configuration
//! produced the same results.
//!
//! Compared records:
//!   - events, keyed by event_uuid (exact match)
//!   - accumulated state, keyed by (year, employee) (money within tolerance)
//!   - per-year scalar metrics (relative tolerance)
//!
//! score = matched / compared. A result passes when the score reaches the
//! validator's minimum AND no event_uuid is present in one run only.
//!
//! RULE: A determinism check (same config, same seed) requires score 1.0.
//! Any deviation is a defect, never a warning.

use crate::{
    config::SimConfig,
    error::{SimError, SimResult},
    event::Event,
    money::Cents,
    orchestrator::{PipelineOrchestrator, RunOptions},
    snapshot::WorkforceSnapshot,
    state::{AccumulatedState, EmployeeState},
    store::SimStore,
    types::SimulationYear,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Relative tolerances. Identifiers and categorical fields are always exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub money_relative:  f64,
    pub metric_relative: f64,
}

impl Tolerance {
    pub fn exact() -> Self {
        Self { money_relative: 0.0, metric_relative: 0.0 }
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { money_relative: 1e-6, metric_relative: 1e-6 }
    }
}

fn money_close(a: Cents, b: Cents, rel: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = a.0.abs().max(b.0.abs()) as f64;
    (a.0 - b.0).abs() as f64 <= rel * scale
}

fn metric_close(a: f64, b: f64, rel: f64) -> bool {
    a == b || (a - b).abs() <= rel * a.abs().max(b.abs())
}

/// Everything one run produced, loaded back from its store.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub strategy: String,
    pub events:   Vec<Event>,
    pub states:   BTreeMap<SimulationYear, AccumulatedState>,
    pub metrics:  BTreeMap<String, f64>,
}

impl RunArtifacts {
    pub fn from_store(store: &SimStore, run_id: &str, strategy: &str) -> SimResult<Self> {
        let years = store.state_years(run_id)?;
        let events = match (years.first(), years.last()) {
            (Some(first), Some(last)) => store.events_in_range(run_id, *first, *last)?,
            _ => Vec::new(),
        };
        let mut states = BTreeMap::new();
        for year in years {
            if let Some(state) = store.state_for_year(run_id, year)? {
                states.insert(year, state);
            }
        }
        let metrics = year_metrics(&states, &events);
        Ok(Self { strategy: strategy.to_string(), events, states, metrics })
    }
}

fn year_metrics(
    states: &BTreeMap<SimulationYear, AccumulatedState>,
    events: &[Event],
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    for (year, state) in states {
        let year_events: Vec<Event> =
            events.iter().filter(|e| e.simulation_year == *year).cloned().collect();
        let s = WorkforceSnapshot::take(state, &year_events);
        let values = [
            ("active_headcount", s.active_headcount as f64),
            ("terminated_headcount", s.terminated_headcount as f64),
            ("enrolled_headcount", s.enrolled_headcount as f64),
            ("participation_rate", s.participation_rate.0 as f64),
            ("active_compensation", s.active_compensation.as_dollars()),
            ("ytd_deferrals", s.ytd_deferrals.as_dollars()),
            ("ytd_match", s.ytd_match.as_dollars()),
            ("total_balance", s.total_balance.as_dollars()),
            ("event_count", s.events.total() as f64),
        ];
        for (name, value) in values {
            out.insert(format!("{year}.{name}"), value);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParityDetail {
    /// "event", "state" or "metric".
    pub record:     &'static str,
    pub key:        String,
    pub baseline:   Option<String>,
    pub comparison: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParityResult {
    pub test_name:           String,
    pub baseline_strategy:   String,
    pub comparison_strategy: String,
    pub score:               f64,
    pub passed:              bool,
    pub compared:            usize,
    pub matched:             usize,
    /// event_uuids present in one run only.
    pub identity_mismatches: usize,
    /// First mismatching records, up to the validator's limit.
    pub details:             Vec<ParityDetail>,
}

#[derive(Default)]
struct Tally {
    compared:            usize,
    matched:             usize,
    identity_mismatches: usize,
    details:             Vec<ParityDetail>,
}

impl Tally {
    fn record(&mut self, ok: bool, detail: impl FnOnce() -> ParityDetail, limit: usize) {
        self.compared += 1;
        if ok {
            self.matched += 1;
        } else if self.details.len() < limit {
            self.details.push(detail());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParityValidator {
    pub min_score:   f64,
    pub max_details: usize,
}

impl ParityValidator {
    /// Same config and seed: nothing may differ.
    pub fn determinism() -> Self {
        Self { min_score: 1.0, max_details: 20 }
    }

    /// Different thread counts or compute engines.
    pub fn cross_strategy() -> Self {
        Self { min_score: 0.9999, max_details: 20 }
    }

    pub fn with_max_details(mut self, n: usize) -> Self {
        self.max_details = n;
        self
    }

    pub fn compare(
        &self,
        test_name: &str,
        baseline: &RunArtifacts,
        comparison: &RunArtifacts,
        tolerance: &Tolerance,
    ) -> ParityResult {
        let mut tally = Tally::default();
        self.compare_events(&mut tally, &baseline.events, &comparison.events);
        self.compare_states(&mut tally, &baseline.states, &comparison.states, tolerance);
        self.compare_metrics(&mut tally, &baseline.metrics, &comparison.metrics, tolerance);

        let score = if tally.compared == 0 {
            1.0
        } else {
            tally.matched as f64 / tally.compared as f64
        };
        let passed = score >= self.min_score && tally.identity_mismatches == 0;
        let result = ParityResult {
            test_name:           test_name.to_string(),
            baseline_strategy:   baseline.strategy.clone(),
            comparison_strategy: comparison.strategy.clone(),
            score,
            passed,
            compared:            tally.compared,
            matched:             tally.matched,
            identity_mismatches: tally.identity_mismatches,
            details:             tally.details,
        };
        if passed {
            log::info!(
                "parity {test_name}: {} vs {} score {:.6} ({} records)",
                result.baseline_strategy,
                result.comparison_strategy,
                score,
                result.compared
            );
        } else {
            log::warn!(
                "parity {test_name}: {} vs {} FAILED score {:.6} (min {}), {} identity mismatches",
                result.baseline_strategy,
                result.comparison_strategy,
                score,
                self.min_score,
                result.identity_mismatches
            );
        }
        result
    }

    fn compare_events(&self, tally: &mut Tally, a: &[Event], b: &[Event]) {
        let a: BTreeMap<Uuid, &Event> = a.iter().map(|e| (e.event_uuid, e)).collect();
        let b: BTreeMap<Uuid, &Event> = b.iter().map(|e| (e.event_uuid, e)).collect();
        let ids: BTreeSet<Uuid> = a.keys().chain(b.keys()).copied().collect();
        for id in ids {
            let (ea, eb) = (a.get(&id), b.get(&id));
            if ea.is_none() || eb.is_none() {
                tally.identity_mismatches += 1;
            }
            tally.record(
                ea == eb,
                || ParityDetail {
                    record:     "event",
                    key:        id.to_string(),
                    baseline:   ea.map(|e| describe_event(e)),
                    comparison: eb.map(|e| describe_event(e)),
                },
                self.max_details,
            );
        }
    }

    fn compare_states(
        &self,
        tally: &mut Tally,
        a: &BTreeMap<SimulationYear, AccumulatedState>,
        b: &BTreeMap<SimulationYear, AccumulatedState>,
        tol: &Tolerance,
    ) {
        let years: BTreeSet<SimulationYear> = a.keys().chain(b.keys()).copied().collect();
        for year in years {
            let sa = a.get(&year);
            let sb = b.get(&year);
            let ids: BTreeSet<&String> = sa
                .into_iter()
                .flat_map(|s| s.employees.keys())
                .chain(sb.into_iter().flat_map(|s| s.employees.keys()))
                .collect();
            for id in ids {
                let ra = sa.and_then(|s| s.get(id));
                let rb = sb.and_then(|s| s.get(id));
                let ok = match (ra, rb) {
                    (Some(x), Some(y)) => records_close(x, y, tol.money_relative),
                    _ => false,
                };
                tally.record(
                    ok,
                    || ParityDetail {
                        record:     "state",
                        key:        format!("{year}/{id}"),
                        baseline:   ra.map(describe_state),
                        comparison: rb.map(describe_state),
                    },
                    self.max_details,
                );
            }
        }
    }

    fn compare_metrics(
        &self,
        tally: &mut Tally,
        a: &BTreeMap<String, f64>,
        b: &BTreeMap<String, f64>,
        tol: &Tolerance,
    ) {
        let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
        for key in keys {
            let (va, vb) = (a.get(key).copied(), b.get(key).copied());
            let ok = match (va, vb) {
                (Some(x), Some(y)) => metric_close(x, y, tol.metric_relative),
                _ => false,
            };
            tally.record(
                ok,
                || ParityDetail {
                    record:     "metric",
                    key:        key.clone(),
                    baseline:   va.map(|v| v.to_string()),
                    comparison: vb.map(|v| v.to_string()),
                },
                self.max_details,
            );
        }
    }
}

/// Categorical fields exact, money within `rel`.
fn records_close(a: &EmployeeState, b: &EmployeeState, rel: f64) -> bool {
    let (wa, wb) = (&a.workforce, &b.workforce);
    let (na, nb) = (&a.enrollment, &b.enrollment);
    let (ca, cb) = (&a.contributions, &b.contributions);
    a.employee_id == b.employee_id
        && a.simulation_year == b.simulation_year
        && wa.status == wb.status
        && wa.level == wb.level
        && wa.hire_date == wb.hire_date
        && wa.termination_date == wb.termination_date
        && na == nb
        && money_close(wa.compensation, wb.compensation, rel)
        && money_close(ca.ytd_deferrals, cb.ytd_deferrals, rel)
        && money_close(ca.ytd_match, cb.ytd_match, rel)
        && money_close(ca.cumulative_deferrals, cb.cumulative_deferrals, rel)
        && money_close(ca.cumulative_match, cb.cumulative_match, rel)
}

fn describe_event(e: &Event) -> String {
    format!("{} {} {} {}", e.event_type.name(), e.employee_id, e.effective_date, e.simulation_year)
}

fn describe_state(r: &EmployeeState) -> String {
    format!(
        "{} level={} comp={} enrolled={} rate={} balance={}",
        r.workforce.status.name(),
        r.workforce.level,
        r.workforce.compensation,
        r.enrollment.enrolled,
        r.enrollment.deferral_rate.0,
        r.balance()
    )
}

// ── Dual-run harness ─────────────────────────────────────────────────────

/// "<engine>/threads=<n>": the execution strategy of a config.
pub fn strategy_label(config: &SimConfig) -> String {
    format!(
        "{}/threads={}",
        config.execution.compute_engine.name(),
        config.execution.thread_count
    )
}

/// Run both configurations over their full horizon on fresh in-memory
/// stores and compare the results. Both must share a config fingerprint:
/// only execution knobs may differ.
pub fn dual_run(
    test_name: &str,
    baseline: SimConfig,
    comparison: SimConfig,
    validator: &ParityValidator,
    tolerance: &Tolerance,
) -> SimResult<ParityResult> {
    let (fa, fb) = (baseline.fingerprint()?, comparison.fingerprint()?);
    if fa != fb {
        return Err(SimError::Configuration(format!(
            "parity runs must share a config fingerprint ({fa} vs {fb})"
        )));
    }
    let a = execute(&format!("{test_name}-baseline"), baseline)?;
    let b = execute(&format!("{test_name}-comparison"), comparison)?;
    Ok(validator.compare(test_name, &a, &b, tolerance))
}

fn execute(run_id: &str, mut config: SimConfig) -> SimResult<RunArtifacts> {
    let strategy = strategy_label(&config);
    config.checkpoint_dir = None;
    config.report_dir = None;
    config.cache.durable_dir = None;
    let mut orchestrator = PipelineOrchestrator::build(run_id, config, SimStore::in_memory()?)?;
    orchestrator.run_all(&RunOptions::default())?;
    RunArtifacts::from_store(orchestrator.store(), run_id, &strategy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_tolerance_is_relative() {
        assert!(money_close(Cents(1_000_000), Cents(1_000_001), 1e-6));
        assert!(!money_close(Cents(1_000_000), Cents(1_000_002), 1e-6));
        assert!(!money_close(Cents(10), Cents(11), 0.0));
    }

    #[test]
    fn empty_runs_compare_as_identical() {
        let empty = RunArtifacts {
            strategy: "a".into(),
            events:   Vec::new(),
            states:   BTreeMap::new(),
            metrics:  BTreeMap::new(),
        };
        let r = ParityValidator::determinism().compare("empty", &empty, &empty, &Tolerance::exact());
        assert!(r.passed);
        assert_eq!(r.score, 1.0);
    }
}
