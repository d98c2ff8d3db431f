//! CrossYearCostAttributor — traces a metric's change over a year range
//! back to the events that caused it.
//!
//! Method: start from the stored state of `from_year`, then for each year
//! up to `to_year` roll over and replay that year's events in replay order.
//! Each event's delta is metric(after) - metric(before) on the one employee
//! it touches. Metrics are integer (cents or counts) and unchanged by
//! rollover, so the deltas telescope exactly to the observed change.
//!
//! RULE: After each replayed year the replayed state must equal the stored
//! state. Any difference means the event store is missing (or has extra)
//! events for that transition: fail with AttributionGap, never return a
//! partial chain.
//! RULE: Attribution records are derived and recomputable. They are cached
//! but never persisted as authoritative data.

use crate::{
    cache::CacheManager,
    config::{canonical_hash, sha256_hex},
    error::{SimError, SimResult},
    event::EventType,
    state::{apply_event, AccumulatedState, EmployeeState},
    store::SimStore,
    types::{EmployeeId, SimulationYear},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    /// Cumulative deferrals + cumulative match, in cents.
    ContributionBalance,
    EmployeeDeferrals,
    EmployerMatch,
    /// Year-end compensation of active employees, in cents.
    ActiveCompensation,
    ActiveHeadcount,
    EnrolledHeadcount,
}

impl TargetMetric {
    pub const ALL: [TargetMetric; 6] = [
        Self::ContributionBalance,
        Self::EmployeeDeferrals,
        Self::EmployerMatch,
        Self::ActiveCompensation,
        Self::ActiveHeadcount,
        Self::EnrolledHeadcount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ContributionBalance => "contribution_balance",
            Self::EmployeeDeferrals   => "employee_deferrals",
            Self::EmployerMatch       => "employer_match",
            Self::ActiveCompensation  => "active_compensation",
            Self::ActiveHeadcount     => "active_headcount",
            Self::EnrolledHeadcount   => "enrolled_headcount",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// One employee's share of the metric.
    pub fn of_employee(&self, rec: &EmployeeState) -> i64 {
        match self {
            Self::ContributionBalance => rec.balance().0,
            Self::EmployeeDeferrals   => rec.contributions.cumulative_deferrals.0,
            Self::EmployerMatch       => rec.contributions.cumulative_match.0,
            Self::ActiveCompensation  => {
                if rec.is_active() { rec.workforce.compensation.0 } else { 0 }
            }
            Self::ActiveHeadcount => rec.is_active() as i64,
            Self::EnrolledHeadcount => (rec.is_active() && rec.enrollment.enrolled) as i64,
        }
    }

    pub fn measure(&self, state: &AccumulatedState) -> i64 {
        state.employees.values().map(|r| self.of_employee(r)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub attribution_uuid:        Uuid,
    pub target_metric:           TargetMetric,
    pub from_year:               SimulationYear,
    pub to_year:                 SimulationYear,
    pub contributing_event_uuid: Uuid,
    pub employee_id:             EmployeeId,
    pub event_type:              EventType,
    pub simulation_year:         SimulationYear,
    pub delta_value:             i64,
}

/// Attribution records plus the observed change they must sum to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub target_metric:  TargetMetric,
    pub from_year:      SimulationYear,
    pub to_year:        SimulationYear,
    pub start_value:    i64,
    pub end_value:      i64,
    pub records:        Vec<AttributionRecord>,
}

impl AttributionReport {
    pub fn observed_delta(&self) -> i64 {
        self.end_value - self.start_value
    }

    pub fn attributed_delta(&self) -> i64 {
        self.records.iter().map(|r| r.delta_value).sum()
    }
}

#[derive(Serialize)]
struct AttributionKey<'a> {
    kind:          &'static str,
    run_id:        &'a str,
    target_metric: TargetMetric,
    from_year:     SimulationYear,
    to_year:       SimulationYear,
    state_hashes:  Vec<String>,
}

pub struct CrossYearCostAttributor<'a> {
    store:  &'a SimStore,
    cache:  &'a CacheManager,
    run_id: &'a str,
}

impl<'a> CrossYearCostAttributor<'a> {
    pub fn new(store: &'a SimStore, cache: &'a CacheManager, run_id: &'a str) -> Self {
        Self { store, cache, run_id }
    }

    pub fn attribute(
        &self,
        target_metric: TargetMetric,
        from_year: SimulationYear,
        to_year: SimulationYear,
    ) -> SimResult<Vec<AttributionRecord>> {
        Ok(self.attribute_report(target_metric, from_year, to_year)?.records)
    }

    /// Records in replay order, plus start and end values. Cached by the
    /// stored state hashes of every year in the range.
    pub fn attribute_report(
        &self,
        target_metric: TargetMetric,
        from_year: SimulationYear,
        to_year: SimulationYear,
    ) -> SimResult<AttributionReport> {
        if to_year < from_year {
            return Err(SimError::Configuration(format!(
                "attribution range {from_year}..{to_year} is reversed"
            )));
        }
        let mut state_hashes = Vec::new();
        for year in from_year..=to_year {
            match self.store.state_header(self.run_id, year)? {
                Some(h) => state_hashes.push(h.state_hash),
                None => return Err(self.gap(year, "", None, "no stored state for this year")),
            }
        }
        let fingerprint = canonical_hash(&AttributionKey {
            kind: "attribution",
            run_id: self.run_id,
            target_metric,
            from_year,
            to_year,
            state_hashes,
        })?;
        let mut keys = vec![format!("run:{}", self.run_id)];
        keys.extend((from_year..=to_year).map(|y| format!("year:{y}")));

        let (bytes, hit) = self.cache.get_or_compute(&fingerprint, &keys, || {
            let report = self.replay(target_metric, from_year, to_year)?;
            Ok(serde_json::to_vec(&report)?)
        })?;
        match serde_json::from_slice::<AttributionReport>(&bytes) {
            Ok(report) => {
                log::debug!(
                    "attribute: {} {from_year}..={to_year} {} ({} records)",
                    target_metric.name(),
                    if hit { "cache hit" } else { "computed" },
                    report.records.len()
                );
                Ok(report)
            }
            Err(e) => {
                log::warn!("attribute: cached report {fingerprint} unusable ({e}); recomputing");
                self.cache.discard(&fingerprint);
                self.replay(target_metric, from_year, to_year)
            }
        }
    }

    /// Observed change of the metric between two stored years.
    pub fn observed_delta(
        &self,
        target_metric: TargetMetric,
        from_year: SimulationYear,
        to_year: SimulationYear,
    ) -> SimResult<i64> {
        let start = self.stored_state(from_year)?;
        let end = self.stored_state(to_year)?;
        Ok(target_metric.measure(&end) - target_metric.measure(&start))
    }

    fn gap(&self, year: SimulationYear, employee_id: &str, event_uuid: Option<Uuid>, reason: &str) -> SimError {
        SimError::AttributionGap {
            year,
            employee_id: employee_id.to_string(),
            event_uuid,
            reason: reason.to_string(),
        }
    }

    fn stored_state(&self, year: SimulationYear) -> SimResult<AccumulatedState> {
        self.store
            .state_for_year(self.run_id, year)?
            .ok_or_else(|| self.gap(year, "", None, "no stored state for this year"))
    }

    fn attribution_uuid(&self, metric: TargetMetric, from: SimulationYear, to: SimulationYear, event: Uuid) -> Uuid {
        let digest = sha256_hex(format!("{}|{}|{from}|{to}|{event}", self.run_id, metric.name()).as_bytes());
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&digest[i * 2..i * 2 + 2], 16).unwrap_or(0);
        }
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }

    fn replay(
        &self,
        metric: TargetMetric,
        from_year: SimulationYear,
        to_year: SimulationYear,
    ) -> SimResult<AttributionReport> {
        let start = self.stored_state(from_year)?;
        let start_value = metric.measure(&start);
        let mut working = start;
        let mut records = Vec::new();

        for year in from_year + 1..=to_year {
            working = working.rollover(year);
            for event in self.store.events_for_year(self.run_id, year)? {
                let id = event.employee_id.clone();
                let before = working.get(&id).map(|r| metric.of_employee(r)).unwrap_or(0);
                apply_event(&mut working.employees, &event).map_err(|e| {
                    self.gap(year, &id, Some(event.event_uuid), &format!("event cannot be applied: {e:?}"))
                })?;
                let after = working.get(&id).map(|r| metric.of_employee(r)).unwrap_or(0);
                let delta = after - before;
                if delta != 0 {
                    records.push(AttributionRecord {
                        attribution_uuid:        self.attribution_uuid(metric, from_year, to_year, event.event_uuid),
                        target_metric:           metric,
                        from_year,
                        to_year,
                        contributing_event_uuid: event.event_uuid,
                        employee_id:             id,
                        event_type:              event.event_type,
                        simulation_year:         year,
                        delta_value:             delta,
                    });
                }
            }

            let stored = self.stored_state(year)?;
            let ids = working.employees.keys().chain(stored.employees.keys());
            for id in ids {
                if working.get(id) != stored.get(id) {
                    return Err(self.gap(
                        year,
                        id,
                        None,
                        "replayed state differs from stored state; events are missing from the store",
                    ));
                }
            }
        }

        let end_value = metric.measure(&working);
        Ok(AttributionReport { target_metric: metric, from_year, to_year, start_value, end_value, records })
    }
}
