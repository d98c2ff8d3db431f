use super::SimStore;
use crate::{
    error::{SimError, SimResult},
    event::{Event, EventPayload, EventType},
    types::SimulationYear,
};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use uuid::Uuid;

/// An event log row as persisted, before payload decoding.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub event_uuid:      String,
    pub employee_id:     String,
    pub event_type:      String,
    pub simulation_year: SimulationYear,
    pub effective_date:  String,
    pub payload:         String,
}

impl EventRow {
    pub fn decode(self) -> SimResult<Event> {
        let event_uuid = Uuid::parse_str(&self.event_uuid)
            .map_err(|e| anyhow::anyhow!("bad event_uuid {}: {e}", self.event_uuid))?;
        let event_type = EventType::from_name(&self.event_type)
            .ok_or_else(|| anyhow::anyhow!("unknown event_type {}", self.event_type))?;
        let effective_date = NaiveDate::parse_from_str(&self.effective_date, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("bad effective_date {}: {e}", self.effective_date))?;
        let payload: EventPayload = serde_json::from_str(&self.payload)?;
        if payload.event_type() != event_type {
            return Err(SimError::Other(anyhow::anyhow!(
                "event {event_uuid}: payload type {} does not match column {}",
                payload.event_type().name(),
                event_type.name()
            )));
        }
        Ok(Event {
            event_uuid,
            employee_id: self.employee_id,
            event_type,
            simulation_year: self.simulation_year,
            effective_date,
            payload,
        })
    }
}

pub(super) fn insert_events(conn: &Connection, run_id: &str, events: &[Event]) -> SimResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO event_log (
            run_id, event_uuid, employee_id, event_type, simulation_year,
            effective_date, priority, payload
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for e in events {
        stmt.execute(params![
            run_id,
            e.event_uuid.to_string(),
            &e.employee_id,
            e.event_type.name(),
            e.simulation_year,
            e.effective_date.format("%Y-%m-%d").to_string(),
            e.event_type.priority(),
            serde_json::to_string(&e.payload)?,
        ])?;
    }
    Ok(())
}

const EVENT_COLUMNS: &str =
    "event_uuid, employee_id, event_type, simulation_year, effective_date, payload";

const EVENT_ORDER: &str = "ORDER BY simulation_year ASC, effective_date ASC, priority ASC, event_uuid ASC";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        event_uuid:      row.get(0)?,
        employee_id:     row.get(1)?,
        event_type:      row.get(2)?,
        simulation_year: row.get(3)?,
        effective_date:  row.get(4)?,
        payload:         row.get(5)?,
    })
}

impl SimStore {
    // ── Event log ──────────────────────────────────────────────

    /// Events of one year, in replay order.
    pub fn events_for_year(&self, run_id: &str, year: SimulationYear) -> SimResult<Vec<Event>> {
        self.events_in_range(run_id, year, year)
    }

    /// Events of years from..=to, in replay order.
    pub fn events_in_range(
        &self,
        run_id: &str,
        from: SimulationYear,
        to: SimulationYear,
    ) -> SimResult<Vec<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_log
             WHERE run_id = ?1 AND simulation_year BETWEEN ?2 AND ?3
             {EVENT_ORDER}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id, from, to], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(EventRow::decode).collect()
    }

    pub fn event_count_for_year(&self, run_id: &str, year: SimulationYear) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM event_log WHERE run_id = ?1 AND simulation_year = ?2",
            params![run_id, year],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Number of event_uuid values that appear more than once in a run.
    pub fn duplicate_event_uuid_count(&self, run_id: &str) -> SimResult<i64> {
        let n = self.conn.query_row(
            "SELECT COUNT(*) FROM (
                SELECT event_uuid FROM event_log WHERE run_id = ?1
                GROUP BY event_uuid HAVING COUNT(*) > 1
             )",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Every event of a run as raw JSON lines, in replay order.
    /// Used by determinism checks to compare event stores byte for byte.
    pub fn event_log_dump(&self, run_id: &str) -> SimResult<Vec<String>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM event_log WHERE run_id = ?1 {EVENT_ORDER}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![run_id], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|r| {
                format!(
                    "{}|{}|{}|{}|{}|{}",
                    r.event_uuid, r.employee_id, r.event_type, r.simulation_year,
                    r.effective_date, r.payload
                )
            })
            .collect())
    }
}
