//! Year validators — data-quality checks run after state accumulation.
//!
//! RULE: Validators are read-only. They see the prior state, the year's
//! events and the derived state, and report; they never repair.
//! RULE: Severity comes from configuration. A failing `error` check gates
//! the year (no persist, no checkpoint); a failing `warn` check is logged.

use crate::{
    config::{SimConfig, ValidationConfig},
    error::{SimError, SimResult},
    event::{Event, EventType},
    money::{BasisPoints, Cents},
    pool::WorkerPool,
    state::AccumulatedState,
    types::SimulationYear,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Warn  => "warn",
            Self::Error => "error",
        }
    }
}

/// Everything a validator may look at for one year.
pub struct YearContext<'a> {
    pub year:   SimulationYear,
    pub prior:  &'a AccumulatedState,
    pub events: &'a [Event],
    pub state:  &'a AccumulatedState,
    pub config: &'a SimConfig,
}

pub trait YearValidator: Send + Sync {
    /// Stable check name, used for severity configuration and reports.
    fn name(&self) -> &'static str;

    /// None when the check passes, otherwise a message naming the
    /// offending entity.
    fn check(&self, ctx: &YearContext<'_>) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub check:    String,
    pub severity: Severity,
    pub passed:   bool,
    pub message:  Option<String>,
}

// ── Built-in checks ──────────────────────────────────────────────────────

pub struct UniqueEventIds;

impl YearValidator for UniqueEventIds {
    fn name(&self) -> &'static str { "unique_event_ids" }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        let mut seen = HashSet::with_capacity(ctx.events.len());
        ctx.events
            .iter()
            .find(|e| !seen.insert(e.event_uuid))
            .map(|e| format!("event_uuid {} appears more than once", e.event_uuid))
    }
}

pub struct OneRecordPerEmployee;

impl YearValidator for OneRecordPerEmployee {
    fn name(&self) -> &'static str { "one_record_per_employee" }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        if ctx.state.simulation_year != ctx.year {
            return Some(format!("state is labelled year {}", ctx.state.simulation_year));
        }
        ctx.state.employees.iter().find_map(|(key, rec)| {
            if rec.employee_id != *key {
                Some(format!("record keyed {key} carries employee_id {}", rec.employee_id))
            } else if rec.simulation_year != ctx.year {
                Some(format!("employee {key} record is labelled year {}", rec.simulation_year))
            } else {
                None
            }
        })
    }
}

pub struct NonNegativeBalances;

impl YearValidator for NonNegativeBalances {
    fn name(&self) -> &'static str { "non_negative_balances" }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        ctx.state.employees.values().find_map(|rec| {
            let c = &rec.contributions;
            let amounts = [
                ("compensation", rec.workforce.compensation),
                ("ytd_deferrals", c.ytd_deferrals),
                ("ytd_match", c.ytd_match),
                ("cumulative_deferrals", c.cumulative_deferrals),
                ("cumulative_match", c.cumulative_match),
            ];
            amounts
                .iter()
                .find(|(_, v)| *v < Cents::ZERO)
                .map(|(field, v)| format!("employee {} has negative {field} {v}", rec.employee_id))
        })
    }
}

pub struct DeferralWithinBounds;

impl YearValidator for DeferralWithinBounds {
    fn name(&self) -> &'static str { "deferral_within_bounds" }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        let max = BasisPoints::from_fraction(ctx.config.plan.max_deferral_rate);
        ctx.state.employees.values().find_map(|rec| {
            let e = &rec.enrollment;
            if e.deferral_rate > max {
                Some(format!(
                    "employee {} defers {} above plan maximum {max}",
                    rec.employee_id, e.deferral_rate
                ))
            } else if !e.enrolled && e.deferral_rate != BasisPoints::ZERO {
                Some(format!("employee {} is not enrolled but defers {}", rec.employee_id, e.deferral_rate))
            } else {
                None
            }
        })
    }
}

pub struct HeadcountConsistency;

impl YearValidator for HeadcountConsistency {
    fn name(&self) -> &'static str { "headcount_consistency" }

    fn check(&self, ctx: &YearContext<'_>) -> Option<String> {
        let count = |t: EventType| ctx.events.iter().filter(|e| e.event_type == t).count() as i64;
        let hires = count(EventType::Hire);
        let terms = count(EventType::Termination);
        let before = ctx.prior.totals().active_headcount;
        let after = ctx.state.totals().active_headcount;
        let expected = before + hires - terms;
        if after != expected {
            return Some(format!(
                "active headcount {after} != {before} + {hires} hires - {terms} terminations"
            ));
        }
        let expected_records = ctx.prior.len() as i64 + hires;
        if ctx.state.len() as i64 != expected_records {
            return Some(format!(
                "{} records, expected {} prior records + {hires} hires",
                ctx.state.len(),
                ctx.prior.len()
            ));
        }
        None
    }
}

pub fn builtin_validators() -> Vec<Box<dyn YearValidator>> {
    vec![
        Box::new(UniqueEventIds),
        Box::new(OneRecordPerEmployee),
        Box::new(NonNegativeBalances),
        Box::new(DeferralWithinBounds),
        Box::new(HeadcountConsistency),
    ]
}

// ── Running and gating ───────────────────────────────────────────────────

/// Run every validator on `workers`. Outcomes keep the validators'
/// registration order.
pub fn run_validators(
    validators: &[Box<dyn YearValidator>],
    ctx: &YearContext<'_>,
    config: &ValidationConfig,
    workers: &WorkerPool,
) -> Vec<ValidationOutcome> {
    workers.map(validators, |v| {
        let message = v.check(ctx);
        ValidationOutcome {
            check:    v.name().to_string(),
            severity: config.severity_for(v.name()),
            passed:   message.is_none(),
            message,
        }
    })
}

/// Turn outcomes into a gate decision. The first failing `error` check
/// fails the year when `fail_on_error` is set; everything else is logged.
pub fn gate(
    year: SimulationYear,
    outcomes: &[ValidationOutcome],
    fail_on_error: bool,
) -> SimResult<()> {
    for o in outcomes.iter().filter(|o| !o.passed) {
        let message = o.message.clone().unwrap_or_default();
        match o.severity {
            Severity::Error if fail_on_error => {
                return Err(SimError::ValidationGateFailure {
                    year,
                    check: o.check.clone(),
                    stage: "validate",
                    message,
                });
            }
            severity => {
                log::warn!("year {year}: check {} failed ({}): {message}", o.check, severity.name());
            }
        }
    }
    Ok(())
}
