use super::SimStore;
use crate::{
    error::{SimError, SimResult},
    money::{BasisPoints, Cents},
    state::{
        AccumulatedState, ContributionFacts, EmployeeState, EmploymentStatus, EnrollmentFacts,
        WorkforceFacts,
    },
    types::SimulationYear,
};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> SimResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SimError::Other(anyhow::anyhow!("bad date {s}: {e}")))
}

pub(super) fn insert_state(conn: &Connection, run_id: &str, state: &AccumulatedState) -> SimResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO accumulated_state (
            run_id, employee_id, simulation_year, status, level, compensation,
            hire_date, termination_date, enrolled, enrollment_date, deferral_rate,
            ytd_deferrals, ytd_match, cumulative_deferrals, cumulative_match
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
    )?;
    for rec in state.employees.values() {
        stmt.execute(params![
            run_id,
            &rec.employee_id,
            state.simulation_year,
            rec.workforce.status.name(),
            rec.workforce.level,
            rec.workforce.compensation.0,
            fmt_date(rec.workforce.hire_date),
            rec.workforce.termination_date.map(fmt_date),
            if rec.enrollment.enrolled { 1 } else { 0 },
            rec.enrollment.enrollment_date.map(fmt_date),
            rec.enrollment.deferral_rate.0,
            rec.contributions.ytd_deferrals.0,
            rec.contributions.ytd_match.0,
            rec.contributions.cumulative_deferrals.0,
            rec.contributions.cumulative_match.0,
        ])?;
    }
    conn.execute(
        "INSERT INTO accumulated_state_header (
            run_id, simulation_year, scenario_id, plan_design_id, state_hash, record_count
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id,
            state.simulation_year,
            &state.scenario_id,
            &state.plan_design_id,
            state.content_hash()?,
            state.len() as i64,
        ],
    )?;
    Ok(())
}

struct StateRow {
    employee_id:          String,
    simulation_year:      SimulationYear,
    status:               String,
    level:                u8,
    compensation:         i64,
    hire_date:            String,
    termination_date:     Option<String>,
    enrolled:             bool,
    enrollment_date:      Option<String>,
    deferral_rate:        u32,
    ytd_deferrals:        i64,
    ytd_match:            i64,
    cumulative_deferrals: i64,
    cumulative_match:     i64,
}

const STATE_COLUMNS: &str = "employee_id, simulation_year, status, level, compensation,
    hire_date, termination_date, enrolled, enrollment_date, deferral_rate,
    ytd_deferrals, ytd_match, cumulative_deferrals, cumulative_match";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRow> {
    Ok(StateRow {
        employee_id:          row.get(0)?,
        simulation_year:      row.get(1)?,
        status:               row.get(2)?,
        level:                row.get(3)?,
        compensation:         row.get(4)?,
        hire_date:            row.get(5)?,
        termination_date:     row.get(6)?,
        enrolled:             row.get::<_, i32>(7)? != 0,
        enrollment_date:      row.get(8)?,
        deferral_rate:        row.get(9)?,
        ytd_deferrals:        row.get(10)?,
        ytd_match:            row.get(11)?,
        cumulative_deferrals: row.get(12)?,
        cumulative_match:     row.get(13)?,
    })
}

impl StateRow {
    fn decode(self) -> SimResult<EmployeeState> {
        let status = EmploymentStatus::from_name(&self.status)
            .ok_or_else(|| anyhow::anyhow!("unknown status {}", self.status))?;
        Ok(EmployeeState {
            employee_id:     self.employee_id,
            simulation_year: self.simulation_year,
            workforce: WorkforceFacts {
                status,
                level:            self.level,
                compensation:     Cents(self.compensation),
                hire_date:        parse_date(&self.hire_date)?,
                termination_date: self.termination_date.as_deref().map(parse_date).transpose()?,
            },
            enrollment: EnrollmentFacts {
                enrolled:        self.enrolled,
                enrollment_date: self.enrollment_date.as_deref().map(parse_date).transpose()?,
                deferral_rate:   BasisPoints(self.deferral_rate),
            },
            contributions: ContributionFacts {
                ytd_deferrals:        Cents(self.ytd_deferrals),
                ytd_match:            Cents(self.ytd_match),
                cumulative_deferrals: Cents(self.cumulative_deferrals),
                cumulative_match:     Cents(self.cumulative_match),
            },
        })
    }
}

/// Header row stored alongside each persisted year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHeader {
    pub simulation_year: SimulationYear,
    pub scenario_id:     String,
    pub plan_design_id:  String,
    pub state_hash:      String,
    pub record_count:    i64,
}

impl SimStore {
    // ── Accumulated state ──────────────────────────────────────

    pub fn state_header(&self, run_id: &str, year: SimulationYear) -> SimResult<Option<StateHeader>> {
        let header = self
            .conn
            .query_row(
                "SELECT simulation_year, scenario_id, plan_design_id, state_hash, record_count
                 FROM accumulated_state_header WHERE run_id = ?1 AND simulation_year = ?2",
                params![run_id, year],
                |row| {
                    Ok(StateHeader {
                        simulation_year: row.get(0)?,
                        scenario_id:     row.get(1)?,
                        plan_design_id:  row.get(2)?,
                        state_hash:      row.get(3)?,
                        record_count:    row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(header)
    }

    /// Full AccumulatedState for one year (range scan by year).
    pub fn state_for_year(
        &self,
        run_id: &str,
        year: SimulationYear,
    ) -> SimResult<Option<AccumulatedState>> {
        let Some(header) = self.state_header(run_id, year)? else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM accumulated_state
             WHERE run_id = ?1 AND simulation_year = ?2 ORDER BY employee_id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id, year], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut employees = BTreeMap::new();
        for row in rows {
            let rec = row.decode()?;
            employees.insert(rec.employee_id.clone(), rec);
        }
        Ok(Some(AccumulatedState {
            simulation_year: year,
            scenario_id:     header.scenario_id,
            plan_design_id:  header.plan_design_id,
            employees,
        }))
    }

    /// Point lookup by (employee_id, year).
    pub fn employee_state(
        &self,
        run_id: &str,
        employee_id: &str,
        year: SimulationYear,
    ) -> SimResult<Option<EmployeeState>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM accumulated_state
             WHERE run_id = ?1 AND employee_id = ?2 AND simulation_year = ?3"
        );
        let row = self
            .conn
            .query_row(&sql, params![run_id, employee_id, year], read_row)
            .optional()?;
        row.map(StateRow::decode).transpose()
    }

    /// Years with persisted state, ascending.
    pub fn state_years(&self, run_id: &str) -> SimResult<Vec<SimulationYear>> {
        let mut stmt = self.conn.prepare(
            "SELECT simulation_year FROM accumulated_state_header
             WHERE run_id = ?1 ORDER BY simulation_year ASC",
        )?;
        let years = stmt
            .query_map(params![run_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(years)
    }

    pub fn state_record_count(&self, run_id: &str, year: SimulationYear) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM accumulated_state WHERE run_id = ?1 AND simulation_year = ?2",
            params![run_id, year],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// (employee_id, year) pairs stored more than once. Always 0 unless the
    /// schema's primary key was bypassed.
    pub fn duplicate_state_key_count(&self, run_id: &str) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT employee_id, simulation_year FROM accumulated_state
                WHERE run_id = ?1
                GROUP BY employee_id, simulation_year HAVING COUNT(*) > 1
             )",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
