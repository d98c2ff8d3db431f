use super::SimStore;
use crate::{error::SimResult, types::SimulationYear};
use rusqlite::{params, Connection};

pub(super) fn upsert_report(
    conn: &Connection,
    run_id: &str,
    year: SimulationYear,
    status: &str,
    report_json: &str,
) -> SimResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO year_report (run_id, simulation_year, status, report_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![run_id, year, status, report_json],
    )?;
    Ok(())
}

impl SimStore {
    // ── Year reports ───────────────────────────────────────────

    /// (year, status, report_json) rows, ascending by year.
    pub fn year_reports(&self, run_id: &str) -> SimResult<Vec<(SimulationYear, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT simulation_year, status, report_json FROM year_report
             WHERE run_id = ?1 ORDER BY simulation_year ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
