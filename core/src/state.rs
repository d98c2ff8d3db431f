//! Accumulated state — the per-year, per-employee derived facts.
//!
//! RULE: An AccumulatedState is immutable once written. Year N+1 is a new
//! value built from year N plus year N+1's events; year N is never edited.
//! RULE: Fields are split into three groups (workforce, enrollment,
//! contributions). Each event type touches exactly one group, so the
//! groups can be derived independently and merged.

use crate::{
    config::canonical_hash,
    error::{SimError, SimResult},
    event::{Event, EventPayload, EventType},
    money::{BasisPoints, Cents},
    types::{EmployeeId, Fingerprint, SimulationYear},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Active,
    Terminated,
}

impl EmploymentStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active     => "active",
            Self::Terminated => "terminated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "active"     => Some(Self::Active),
            "terminated" => Some(Self::Terminated),
            _            => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkforceFacts {
    pub status:           EmploymentStatus,
    pub level:            u8,
    /// Year-end annual compensation.
    pub compensation:     Cents,
    pub hire_date:        NaiveDate,
    pub termination_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentFacts {
    pub enrolled:        bool,
    pub enrollment_date: Option<NaiveDate>,
    pub deferral_rate:   BasisPoints,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionFacts {
    pub ytd_deferrals:        Cents,
    pub ytd_match:            Cents,
    pub cumulative_deferrals: Cents,
    pub cumulative_match:     Cents,
}

impl ContributionFacts {
    pub fn balance(&self) -> Cents {
        self.cumulative_deferrals + self.cumulative_match
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmployeeState {
    pub employee_id:     EmployeeId,
    pub simulation_year: SimulationYear,
    pub workforce:       WorkforceFacts,
    pub enrollment:      EnrollmentFacts,
    pub contributions:   ContributionFacts,
}

impl EmployeeState {
    pub fn is_active(&self) -> bool {
        self.workforce.status == EmploymentStatus::Active
    }

    pub fn balance(&self) -> Cents {
        self.contributions.balance()
    }
}

/// Baseline census row: the population before the first simulated year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusRecord {
    pub employee_id:   EmployeeId,
    pub hire_date:     NaiveDate,
    pub level:         u8,
    pub compensation:  Cents,
    pub enrolled:      bool,
    pub deferral_rate: BasisPoints,
    /// Plan balance carried in from before the simulation.
    pub opening_balance: Cents,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Census {
    pub records: Vec<CensusRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatedState {
    pub simulation_year: SimulationYear,
    pub scenario_id:     String,
    pub plan_design_id:  String,
    pub employees:       BTreeMap<EmployeeId, EmployeeState>,
}

/// Aggregate view of one AccumulatedState.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTotals {
    pub active_headcount:     i64,
    pub terminated_headcount: i64,
    pub enrolled_headcount:   i64,
    pub active_compensation:  Cents,
    pub ytd_deferrals:        Cents,
    pub ytd_match:            Cents,
    pub cumulative_deferrals: Cents,
    pub cumulative_match:     Cents,
    pub total_balance:        Cents,
}

impl AccumulatedState {
    pub fn empty(year: SimulationYear, scenario_id: &str, plan_design_id: &str) -> Self {
        Self {
            simulation_year: year,
            scenario_id:     scenario_id.to_string(),
            plan_design_id:  plan_design_id.to_string(),
            employees:       BTreeMap::new(),
        }
    }

    /// The state for the year before the first simulated year: the census
    /// expressed as employee records.
    pub fn from_census(
        census: &Census,
        year: SimulationYear,
        scenario_id: &str,
        plan_design_id: &str,
    ) -> Self {
        let mut state = Self::empty(year, scenario_id, plan_design_id);
        for rec in &census.records {
            state.employees.insert(
                rec.employee_id.clone(),
                EmployeeState {
                    employee_id:     rec.employee_id.clone(),
                    simulation_year: year,
                    workforce: WorkforceFacts {
                        status:           EmploymentStatus::Active,
                        level:            rec.level,
                        compensation:     rec.compensation,
                        hire_date:        rec.hire_date,
                        termination_date: None,
                    },
                    enrollment: EnrollmentFacts {
                        enrolled:        rec.enrolled,
                        enrollment_date: None,
                        deferral_rate:   if rec.enrolled { rec.deferral_rate } else { BasisPoints::ZERO },
                    },
                    contributions: ContributionFacts {
                        cumulative_deferrals: rec.opening_balance,
                        ..ContributionFacts::default()
                    },
                },
            );
        }
        state
    }

    /// Carry every record forward into `next_year`: relabel the year and
    /// reset year-to-date contributions. Nothing else changes.
    pub fn rollover(&self, next_year: SimulationYear) -> Self {
        let employees = self
            .employees
            .iter()
            .map(|(id, rec)| {
                let mut next = rec.clone();
                next.simulation_year = next_year;
                next.contributions.ytd_deferrals = Cents::ZERO;
                next.contributions.ytd_match = Cents::ZERO;
                (id.clone(), next)
            })
            .collect();
        Self {
            simulation_year: next_year,
            scenario_id:     self.scenario_id.clone(),
            plan_design_id:  self.plan_design_id.clone(),
            employees,
        }
    }

    pub fn get(&self, employee_id: &str) -> Option<&EmployeeState> {
        self.employees.get(employee_id)
    }

    pub fn len(&self) -> usize {
        self.employees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.employees.is_empty()
    }

    /// Content hash of the whole state. BTreeMap ordering makes it stable.
    pub fn content_hash(&self) -> SimResult<Fingerprint> {
        canonical_hash(self)
    }

    pub fn totals(&self) -> StateTotals {
        let mut t = StateTotals::default();
        for rec in self.employees.values() {
            if rec.is_active() {
                t.active_headcount += 1;
                t.active_compensation += rec.workforce.compensation;
                if rec.enrollment.enrolled {
                    t.enrolled_headcount += 1;
                }
            } else {
                t.terminated_headcount += 1;
            }
            t.ytd_deferrals += rec.contributions.ytd_deferrals;
            t.ytd_match += rec.contributions.ytd_match;
            t.cumulative_deferrals += rec.contributions.cumulative_deferrals;
            t.cumulative_match += rec.contributions.cumulative_match;
            t.total_balance += rec.balance();
        }
        t
    }
}

// ── Event application ────────────────────────────────────────────────────

/// Why an event could not be applied to the working state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    MissingRecord,
    DuplicateHire,
}

pub fn new_hire_state(event: &Event) -> Option<EmployeeState> {
    match &event.payload {
        EventPayload::Hire { level, compensation } => Some(EmployeeState {
            employee_id:     event.employee_id.clone(),
            simulation_year: event.simulation_year,
            workforce: WorkforceFacts {
                status:           EmploymentStatus::Active,
                level:            *level,
                compensation:     *compensation,
                hire_date:        event.effective_date,
                termination_date: None,
            },
            enrollment:    EnrollmentFacts::default(),
            contributions: ContributionFacts::default(),
        }),
        _ => None,
    }
}

/// Workforce group: hire, promotion, raise, termination.
pub fn apply_workforce(facts: &mut WorkforceFacts, event: &Event) {
    match &event.payload {
        EventPayload::Hire { level, compensation } => {
            facts.level = *level;
            facts.compensation = *compensation;
            facts.hire_date = event.effective_date;
        }
        EventPayload::Promotion { to_level, new_compensation, .. } => {
            facts.level = *to_level;
            facts.compensation = *new_compensation;
        }
        EventPayload::Raise { new_compensation, .. } => {
            facts.compensation = *new_compensation;
        }
        EventPayload::Termination { .. } => {
            facts.status = EmploymentStatus::Terminated;
            facts.termination_date = Some(event.effective_date);
        }
        _ => {}
    }
}

/// Enrollment group: enrollment, deferral change.
pub fn apply_enrollment(facts: &mut EnrollmentFacts, event: &Event) {
    match &event.payload {
        EventPayload::Enrollment { deferral_rate } => {
            facts.enrolled = true;
            facts.enrollment_date = Some(event.effective_date);
            facts.deferral_rate = *deferral_rate;
        }
        EventPayload::DeferralChange { to_rate, .. } => {
            facts.deferral_rate = *to_rate;
        }
        _ => {}
    }
}

/// Contribution group: contribution.
pub fn apply_contribution(facts: &mut ContributionFacts, event: &Event) {
    if let EventPayload::Contribution { employee_amount, employer_match } = &event.payload {
        facts.ytd_deferrals += *employee_amount;
        facts.ytd_match += *employer_match;
        facts.cumulative_deferrals += *employee_amount;
        facts.cumulative_match += *employer_match;
    }
}

/// Apply one event to a working employee map, in replay order.
pub fn apply_event(
    employees: &mut BTreeMap<EmployeeId, EmployeeState>,
    event: &Event,
) -> Result<(), ApplyError> {
    if event.event_type == EventType::Hire {
        if employees.contains_key(&event.employee_id) {
            return Err(ApplyError::DuplicateHire);
        }
        if let Some(rec) = new_hire_state(event) {
            employees.insert(event.employee_id.clone(), rec);
        }
        return Ok(());
    }
    let rec = employees
        .get_mut(&event.employee_id)
        .ok_or(ApplyError::MissingRecord)?;
    match event.event_type {
        EventType::Promotion | EventType::Raise | EventType::Termination => {
            apply_workforce(&mut rec.workforce, event)
        }
        EventType::Enrollment | EventType::DeferralChange => {
            apply_enrollment(&mut rec.enrollment, event)
        }
        EventType::Contribution => apply_contribution(&mut rec.contributions, event),
        EventType::Hire => {}
    }
    Ok(())
}

// ── Completeness checks ──────────────────────────────────────────────────

fn incomplete(event: &Event, year: SimulationYear, reason: &str) -> SimError {
    SimError::IncompleteState {
        employee_id: event.employee_id.clone(),
        year,
        stage: "accumulate_state",
        reason: format!("{reason} (event {} {})", event.event_type.name(), event.event_uuid),
    }
}

/// Structural checks on a year's events against the prior state, run before
/// any derivation. `events` must already be in replay order.
///
/// Rejects: events from another year, a hire for an employee that already
/// exists, a second hire, any event for an employee with no prior record
/// and no hire, and events ordered before the employee's hire.
pub fn check_year_inputs(
    prior: &AccumulatedState,
    year: SimulationYear,
    events: &[Event],
) -> SimResult<()> {
    let mut hired: HashMap<&str, ()> = HashMap::new();
    for event in events {
        if event.simulation_year != year {
            return Err(incomplete(
                event,
                year,
                &format!("event belongs to year {}", event.simulation_year),
            ));
        }
        let known = prior.employees.contains_key(&event.employee_id);
        let already_hired = hired.contains_key(event.employee_id.as_str());
        if event.event_type == EventType::Hire {
            if known || already_hired {
                return Err(incomplete(event, year, "hire for an employee that already exists"));
            }
            hired.insert(event.employee_id.as_str(), ());
        } else if !known && !already_hired {
            return Err(incomplete(event, year, "no prior record and no hire event"));
        }
    }
    Ok(())
}

/// Year-end checks on derived state: every employee with a contribution or
/// deferral change must be enrolled by year end.
pub fn check_year_outputs(
    derived: &BTreeMap<EmployeeId, EmployeeState>,
    year: SimulationYear,
    events: &[Event],
) -> SimResult<()> {
    for event in events {
        if !matches!(event.event_type, EventType::Contribution | EventType::DeferralChange) {
            continue;
        }
        let enrolled = derived
            .get(&event.employee_id)
            .map(|r| r.enrollment.enrolled)
            .unwrap_or(false);
        if !enrolled {
            return Err(incomplete(event, year, "contribution activity without an enrollment record"));
        }
    }
    Ok(())
}
