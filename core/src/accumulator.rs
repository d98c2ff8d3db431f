//! StateAccumulator — builds year N's AccumulatedState from year N-1's
//! state plus year N's events.
//!
//! RULE: Year N is derived from year N-1 and year N's events only. Events
//! of earlier years are never replayed here. `replay_from_baseline` exists
//! to verify that property and is never on the run path.
//! RULE: Both compute engines are last-writer-wins per field group, in
//! event order, and sum contributions in integer cents. They must produce
//! identical states and identical errors.
//!
//! In-memory pipeline for one year:
//!
//! ```text
//!   check_year_inputs
//!   ├─ derive_workforce   (hire, promotion, raise, termination)
//!   └─ derive_enrollment  (enrollment, deferral change)      ← concurrent
//!   apply_contributions
//!   check_year_outputs
//! ```

use crate::{
    cache::CacheManager,
    config::{canonical_hash, ComputeEngine, SimConfig},
    error::{SimError, SimResult},
    event::{Event, EventPayload, EventType},
    money::{BasisPoints, Cents},
    pool::WorkerPool,
    state::{
        self, apply_contribution, apply_enrollment, apply_workforce, check_year_inputs,
        check_year_outputs, new_hire_state, AccumulatedState, Census, ContributionFacts,
        EmployeeState, EmploymentStatus, EnrollmentFacts, WorkforceFacts,
    },
    types::{EmployeeId, Fingerprint, SimulationYear},
};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one `advance`, with the bookkeeping the orchestrator reports.
#[derive(Debug, Clone)]
pub struct Accumulated {
    pub state:       AccumulatedState,
    pub fingerprint: Fingerprint,
    pub cache_hit:   bool,
    /// Measured sub-stage durations; empty on a cache hit.
    pub timings:     Vec<(&'static str, Duration)>,
}

pub struct StateAccumulator {
    config:   Arc<SimConfig>,
    census:   Arc<Census>,
    engine:   ComputeEngine,
    workers:  Arc<WorkerPool>,
    parallel: bool,
}

#[derive(Serialize)]
struct FingerprintInputs<'a> {
    year:           SimulationYear,
    scenario_id:    &'a str,
    plan_design_id: &'a str,
    prior_hash:     &'a str,
    events_hash:    &'a str,
}

impl StateAccumulator {
    pub fn new(config: Arc<SimConfig>, census: Arc<Census>) -> Self {
        let engine = config.execution.compute_engine;
        Self { config, census, engine, workers: Arc::new(WorkerPool::sequential()), parallel: false }
    }

    /// Derive field groups on `workers` when the execution plan allows it.
    pub fn with_workers(mut self, workers: Arc<WorkerPool>, parallel: bool) -> Self {
        self.workers = workers;
        self.parallel = parallel;
        self
    }

    pub fn engine(&self) -> ComputeEngine {
        self.engine
    }

    /// The state that precedes the first simulated year.
    pub fn baseline(&self, first_year: SimulationYear) -> AccumulatedState {
        AccumulatedState::from_census(
            &self.census,
            first_year - 1,
            &self.config.scenario_id,
            &self.config.plan_design_id,
        )
    }

    /// Dependency keys attached to every cached state of `year`.
    pub fn dependency_keys(&self, year: SimulationYear) -> Vec<String> {
        vec![
            format!("scenario:{}", self.config.scenario_id),
            format!("plan_design:{}", self.config.plan_design_id),
            format!("year:{year}"),
        ]
    }

    /// Cache key over (year, scenario, plan design, prior hash, events hash).
    pub fn fingerprint(
        &self,
        prior: &AccumulatedState,
        year: SimulationYear,
        events: &[Event],
    ) -> SimResult<Fingerprint> {
        let prior_hash = prior.content_hash()?;
        let events_hash = canonical_hash(&events)?;
        canonical_hash(&FingerprintInputs {
            year,
            scenario_id:    &self.config.scenario_id,
            plan_design_id: &self.config.plan_design_id,
            prior_hash:     &prior_hash,
            events_hash:    &events_hash,
        })
    }

    pub fn advance(
        &self,
        prior: Option<&AccumulatedState>,
        year: SimulationYear,
        events: &[Event],
        cache: &CacheManager,
    ) -> SimResult<AccumulatedState> {
        Ok(self.advance_detailed(prior, year, events, cache)?.state)
    }

    /// Cache-aware advance. `prior` None means year 1: start from the census.
    pub fn advance_detailed(
        &self,
        prior: Option<&AccumulatedState>,
        year: SimulationYear,
        events: &[Event],
        cache: &CacheManager,
    ) -> SimResult<Accumulated> {
        let baseline;
        let prior = match prior {
            Some(p) => p,
            None => {
                baseline = self.baseline(year);
                &baseline
            }
        };
        let mut ordered = events.to_vec();
        crate::event::sort_events(&mut ordered);

        let fingerprint = self.fingerprint(prior, year, &ordered)?;
        let keys = self.dependency_keys(year);
        let mut timings = Vec::new();

        let (bytes, cache_hit) = cache.get_or_compute(&fingerprint, &keys, || {
            let state = self.derive(prior, year, &ordered, &mut timings)?;
            Ok(serde_json::to_vec(&state)?)
        })?;

        match serde_json::from_slice::<AccumulatedState>(&bytes) {
            Ok(state) if state.simulation_year == year => {
                log::debug!(
                    "accumulate: year {year} {} ({} records, engine {})",
                    if cache_hit { "cache hit" } else { "computed" },
                    state.len(),
                    self.engine.name()
                );
                Ok(Accumulated { state, fingerprint, cache_hit, timings })
            }
            other => {
                let reason = match other {
                    Ok(s) => format!("payload holds year {}", s.simulation_year),
                    Err(e) => e.to_string(),
                };
                log::warn!("accumulate: cached state {fingerprint} unusable ({reason}); recomputing");
                cache.discard(&fingerprint);
                let mut timings = Vec::new();
                let state = self.derive(prior, year, &ordered, &mut timings)?;
                cache.put_json(&fingerprint, &state, &keys)?;
                Ok(Accumulated { state, fingerprint, cache_hit: false, timings })
            }
        }
    }

    /// Derive without consulting the cache. `events` must be in replay order.
    pub fn derive(
        &self,
        prior: &AccumulatedState,
        year: SimulationYear,
        events: &[Event],
        timings: &mut Vec<(&'static str, Duration)>,
    ) -> SimResult<AccumulatedState> {
        check_year_inputs(prior, year, events)?;
        let state = match self.engine {
            ComputeEngine::InMemory => self.derive_in_memory(prior, year, events, timings),
            ComputeEngine::Sql => derive_sql(prior, year, events, timings)?,
        };
        check_year_outputs(&state.employees, year, events)?;
        Ok(state)
    }

    // ── In-memory engine ──────────────────────────────────────

    fn derive_in_memory(
        &self,
        prior: &AccumulatedState,
        year: SimulationYear,
        events: &[Event],
        timings: &mut Vec<(&'static str, Duration)>,
    ) -> AccumulatedState {
        let base = prior.rollover(year);
        let by_employee = group_by_employee(events);
        let roster: Vec<&str> = {
            let mut ids: Vec<&str> = base.employees.keys().map(String::as_str).collect();
            ids.extend(
                by_employee
                    .keys()
                    .copied()
                    .filter(|id| !base.employees.contains_key(*id)),
            );
            ids.sort_unstable();
            ids
        };

        let inline = WorkerPool::sequential();
        let workers: &WorkerPool = if self.parallel { &self.workers } else { &inline };
        let ((workforce, wf_time), (enrollment, en_time)) = workers.join(
            || {
                let t = Instant::now();
                let out = derive_group(&base, &by_employee, &roster, workers, |r| r.workforce.clone(), apply_workforce);
                (out, t.elapsed())
            },
            || {
                let t = Instant::now();
                let out = derive_group(&base, &by_employee, &roster, workers, |r| r.enrollment.clone(), apply_enrollment);
                (out, t.elapsed())
            },
        );
        timings.push(("derive_workforce", wf_time));
        timings.push(("derive_enrollment", en_time));

        let t = Instant::now();
        let mut employees = BTreeMap::new();
        for ((id, wf), (_, en)) in workforce.into_iter().zip(enrollment) {
            let mut contributions = base
                .employees
                .get(&id)
                .map(|r| r.contributions.clone())
                .unwrap_or_default();
            if let Some(evs) = by_employee.get(id.as_str()) {
                for e in evs.iter().filter(|e| e.event_type == EventType::Contribution) {
                    apply_contribution(&mut contributions, e);
                }
            }
            employees.insert(
                id.clone(),
                EmployeeState {
                    employee_id: id,
                    simulation_year: year,
                    workforce: wf,
                    enrollment: en,
                    contributions,
                },
            );
        }
        timings.push(("apply_contributions", t.elapsed()));

        AccumulatedState { employees, ..base }
    }
}

fn group_by_employee(events: &[Event]) -> BTreeMap<&str, Vec<&Event>> {
    let mut out: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for e in events {
        out.entry(e.employee_id.as_str()).or_default().push(e);
    }
    out
}

/// Derive one field group for every employee on the roster, partitioned by
/// employee across the pool's workers. Output is in roster order.
fn derive_group<T, P, A>(
    base: &AccumulatedState,
    by_employee: &BTreeMap<&str, Vec<&Event>>,
    roster: &[&str],
    workers: &WorkerPool,
    pick: P,
    apply: A,
) -> Vec<(EmployeeId, T)>
where
    T: Send,
    P: Fn(&EmployeeState) -> T + Sync + Send,
    A: Fn(&mut T, &Event) + Sync + Send,
{
    workers.map(roster, |&id| {
        let events = by_employee.get(id).map(Vec::as_slice).unwrap_or(&[]);
        let mut facts = match base.employees.get(id) {
            Some(rec) => Some(pick(rec)),
            None => events.iter().find_map(|e| new_hire_state(e)).map(|rec| pick(&rec)),
        };
        if let Some(f) = facts.as_mut() {
            for e in events {
                apply(f, e);
            }
        }
        // check_year_inputs guarantees every roster entry has a base record
        // or a hire, so `facts` is always present here.
        (id.to_string(), facts)
    })
    .into_iter()
    .filter_map(|(id, facts)| facts.map(|f| (id, f)))
    .collect()
}

// ── SQL engine ───────────────────────────────────────────────────────────

const SQL_SCHEMA: &str = "
CREATE TABLE prior (
    employee_id          TEXT PRIMARY KEY,
    status               TEXT NOT NULL,
    level                INTEGER NOT NULL,
    compensation         INTEGER NOT NULL,
    hire_date            TEXT NOT NULL,
    termination_date     TEXT,
    enrolled             INTEGER NOT NULL,
    enrollment_date      TEXT,
    deferral_rate        INTEGER NOT NULL,
    cumulative_deferrals INTEGER NOT NULL,
    cumulative_match     INTEGER NOT NULL
);
CREATE TABLE ev (
    event_uuid      TEXT PRIMARY KEY,
    employee_id     TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    effective_date  TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    level           INTEGER,
    compensation    INTEGER,
    deferral_rate   INTEGER,
    employee_amount INTEGER,
    employer_match  INTEGER
);
CREATE INDEX ev_emp ON ev(employee_id, event_type);
";

/// Last event per employee among `types`, by replay order.
fn last_by(types: &str, columns: &str) -> String {
    format!(
        "SELECT employee_id, {columns} FROM (
            SELECT *, ROW_NUMBER() OVER (
                PARTITION BY employee_id
                ORDER BY effective_date DESC, priority DESC, event_uuid DESC
            ) AS rn
            FROM ev WHERE event_type IN ({types})
         ) WHERE rn = 1"
    )
}

fn derive_query() -> String {
    format!(
        "WITH
         last_comp   AS ({comp}),
         last_level  AS ({level}),
         last_term   AS ({term}),
         last_enroll AS ({enroll}),
         last_rate   AS ({rate}),
         hires   AS (SELECT employee_id, effective_date AS hire_date FROM ev WHERE event_type = 'hire'),
         contrib AS (
            SELECT employee_id, SUM(employee_amount) AS d, SUM(employer_match) AS m
            FROM ev WHERE event_type = 'contribution' GROUP BY employee_id
         ),
         roster AS (SELECT employee_id FROM prior UNION SELECT employee_id FROM hires)
         SELECT r.employee_id,
                CASE WHEN lt.employee_id IS NOT NULL THEN 'terminated'
                     ELSE COALESCE(p.status, 'active') END,
                COALESCE(ll.level, p.level),
                COALESCE(lc.compensation, p.compensation),
                COALESCE(h.hire_date, p.hire_date),
                COALESCE(lt.effective_date, p.termination_date),
                CASE WHEN le.employee_id IS NOT NULL THEN 1 ELSE COALESCE(p.enrolled, 0) END,
                COALESCE(le.effective_date, p.enrollment_date),
                COALESCE(lr.deferral_rate, p.deferral_rate, 0),
                COALESCE(c.d, 0),
                COALESCE(c.m, 0),
                COALESCE(p.cumulative_deferrals, 0) + COALESCE(c.d, 0),
                COALESCE(p.cumulative_match, 0) + COALESCE(c.m, 0)
         FROM roster r
         LEFT JOIN prior p        ON p.employee_id  = r.employee_id
         LEFT JOIN hires h        ON h.employee_id  = r.employee_id
         LEFT JOIN last_comp lc   ON lc.employee_id = r.employee_id
         LEFT JOIN last_level ll  ON ll.employee_id = r.employee_id
         LEFT JOIN last_term lt   ON lt.employee_id = r.employee_id
         LEFT JOIN last_enroll le ON le.employee_id = r.employee_id
         LEFT JOIN last_rate lr   ON lr.employee_id = r.employee_id
         LEFT JOIN contrib c      ON c.employee_id  = r.employee_id
         ORDER BY r.employee_id",
        comp = last_by("'hire', 'promotion', 'raise'", "compensation"),
        level = last_by("'hire', 'promotion'", "level"),
        term = last_by("'termination'", "effective_date"),
        enroll = last_by("'enrollment'", "effective_date"),
        rate = last_by("'enrollment', 'deferral_change'", "deferral_rate"),
    )
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> SimResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SimError::Other(anyhow::anyhow!("bad date {s}: {e}")))
}

/// Flattened payload columns: (level, compensation, deferral_rate, amount, match).
type PayloadColumns = (Option<u8>, Option<i64>, Option<u32>, Option<i64>, Option<i64>);

fn payload_columns(payload: &EventPayload) -> PayloadColumns {
    match payload {
        EventPayload::Hire { level, compensation } => (Some(*level), Some(compensation.0), None, None, None),
        EventPayload::Promotion { to_level, new_compensation, .. } => {
            (Some(*to_level), Some(new_compensation.0), None, None, None)
        }
        EventPayload::Raise { new_compensation, .. } => (None, Some(new_compensation.0), None, None, None),
        EventPayload::Enrollment { deferral_rate } => (None, None, Some(deferral_rate.0), None, None),
        EventPayload::DeferralChange { to_rate, .. } => (None, None, Some(to_rate.0), None, None),
        EventPayload::Contribution { employee_amount, employer_match } => {
            (None, None, None, Some(employee_amount.0), Some(employer_match.0))
        }
        EventPayload::Termination { .. } => (None, None, None, None, None),
    }
}

fn load_scratch(conn: &Connection, prior: &AccumulatedState, events: &[Event]) -> SimResult<()> {
    conn.execute_batch(SQL_SCHEMA)?;
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO prior VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for rec in prior.employees.values() {
            stmt.execute(params![
                &rec.employee_id,
                rec.workforce.status.name(),
                rec.workforce.level,
                rec.workforce.compensation.0,
                fmt_date(rec.workforce.hire_date),
                rec.workforce.termination_date.map(fmt_date),
                rec.enrollment.enrolled as i32,
                rec.enrollment.enrollment_date.map(fmt_date),
                rec.enrollment.deferral_rate.0,
                rec.contributions.cumulative_deferrals.0,
                rec.contributions.cumulative_match.0,
            ])?;
        }
        let mut stmt = tx.prepare("INSERT INTO ev VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)")?;
        for e in events {
            let (level, comp, rate, amount, matched) = payload_columns(&e.payload);
            stmt.execute(params![
                e.event_uuid.to_string(),
                &e.employee_id,
                e.event_type.name(),
                fmt_date(e.effective_date),
                e.event_type.priority(),
                level,
                comp,
                rate,
                amount,
                matched,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn derive_sql(
    prior: &AccumulatedState,
    year: SimulationYear,
    events: &[Event],
    timings: &mut Vec<(&'static str, Duration)>,
) -> SimResult<AccumulatedState> {
    let t = Instant::now();
    let conn = Connection::open_in_memory()?;
    load_scratch(&conn, prior, events)?;
    timings.push(("sql_load", t.elapsed()));

    let t = Instant::now();
    let mut stmt = conn.prepare(&derive_query())?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u8>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i32>(6)? != 0,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, u32>(8)?,
                [row.get::<_, i64>(9)?, row.get(10)?, row.get(11)?, row.get(12)?],
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut employees = BTreeMap::new();
    for (id, status, level, comp, hire, term, enrolled, enroll_date, rate, sums) in rows {
        let status = EmploymentStatus::from_name(&status)
            .ok_or_else(|| anyhow::anyhow!("unknown status {status}"))?;
        let rec = EmployeeState {
            employee_id: id.clone(),
            simulation_year: year,
            workforce: WorkforceFacts {
                status,
                level,
                compensation: Cents(comp),
                hire_date: parse_date(&hire)?,
                termination_date: term.as_deref().map(parse_date).transpose()?,
            },
            enrollment: EnrollmentFacts {
                enrolled,
                enrollment_date: enroll_date.as_deref().map(parse_date).transpose()?,
                deferral_rate: BasisPoints(rate),
            },
            contributions: ContributionFacts {
                ytd_deferrals:        Cents(sums[0]),
                ytd_match:            Cents(sums[1]),
                cumulative_deferrals: Cents(sums[2]),
                cumulative_match:     Cents(sums[3]),
            },
        };
        employees.insert(id, rec);
    }
    timings.push(("sql_derive", t.elapsed()));

    Ok(AccumulatedState {
        simulation_year: year,
        scenario_id:     prior.scenario_id.clone(),
        plan_design_id:  prior.plan_design_id.clone(),
        employees,
    })
}

// ── Verification path ────────────────────────────────────────────────────

/// Rebuild the state of `to_year` by replaying every event since the
/// census, one at a time. Verification only; the run path never calls it.
/// `events` may span several years and need not be ordered.
pub fn replay_from_baseline(
    census: &Census,
    config: &SimConfig,
    events: &[Event],
    to_year: SimulationYear,
) -> SimResult<AccumulatedState> {
    let first = config.horizon.start_year;
    let mut state = AccumulatedState::from_census(
        census,
        first - 1,
        &config.scenario_id,
        &config.plan_design_id,
    );
    let mut ordered = events.to_vec();
    crate::event::sort_events(&mut ordered);

    for year in first..=to_year {
        let year_events: Vec<Event> =
            ordered.iter().filter(|e| e.simulation_year == year).cloned().collect();
        check_year_inputs(&state, year, &year_events)?;
        let mut next = state.rollover(year);
        for e in &year_events {
            state::apply_event(&mut next.employees, e).map_err(|err| SimError::IncompleteState {
                employee_id: e.employee_id.clone(),
                year,
                stage: "replay",
                reason: format!("{err:?} applying {}", e.event_uuid),
            })?;
        }
        check_year_outputs(&next.employees, year, &year_events)?;
        state = next;
    }
    Ok(state)
}
