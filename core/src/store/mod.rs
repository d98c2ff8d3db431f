//! SQLite persistence layer — the Event Store and its derived tables.
//!
//! RULE: Only the store talks to the run database.
//! Components call store methods; they never execute SQL against it.
//! RULE: The event log is append-only and has a single writer (the
//! orchestrator). A year's events, accumulated state and report are
//! written in one transaction, before that year's checkpoint commit.

use crate::{
    error::SimResult,
    event::Event,
    state::AccumulatedState,
    types::SimulationYear,
};
use rusqlite::{params, Connection, OptionalExtension};

mod events;
mod report;
mod state;

pub use events::EventRow;
pub use state::StateHeader;

pub struct SimStore {
    conn: Connection,
}

impl SimStore {
    pub fn open(path: &str) -> SimResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> SimResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> SimResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_reports.sql"))?;
        Ok(())
    }

    // ── Run ────────────────────────────────────────────────────

    /// Register a run. Re-registering an existing run is a no-op, so resumed
    /// runs can call this freely.
    pub fn insert_run(
        &self,
        run_id: &str,
        seed: u64,
        version: &str,
        config_fingerprint: &str,
    ) -> SimResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO run (run_id, seed, version, config_fingerprint, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                seed as i64,
                version,
                config_fingerprint,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn run_fingerprint(&self, run_id: &str) -> SimResult<Option<String>> {
        let fp = self
            .conn
            .query_row(
                "SELECT config_fingerprint FROM run WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(fp)
    }

    /// Drop every row of a run. Only used by an explicit forced restart.
    pub fn purge_run(&self, run_id: &str) -> SimResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        // The append-only trigger guards UPDATE; a forced restart deletes.
        tx.execute("DELETE FROM event_log WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM accumulated_state WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM accumulated_state_header WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM year_report WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM run WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Remove output of `year` and later that no checkpoint covers.
    /// A crash between `write_year` and the checkpoint commit leaves such
    /// rows behind; the resumed run recomputes them byte for byte.
    pub fn discard_uncommitted(&self, run_id: &str, year: SimulationYear) -> SimResult<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        removed += tx.execute(
            "DELETE FROM event_log WHERE run_id = ?1 AND simulation_year >= ?2",
            params![run_id, year],
        )?;
        removed += tx.execute(
            "DELETE FROM accumulated_state WHERE run_id = ?1 AND simulation_year >= ?2",
            params![run_id, year],
        )?;
        tx.execute(
            "DELETE FROM accumulated_state_header WHERE run_id = ?1 AND simulation_year >= ?2",
            params![run_id, year],
        )?;
        tx.execute(
            "DELETE FROM year_report WHERE run_id = ?1 AND simulation_year >= ?2",
            params![run_id, year],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    // ── Year commit ────────────────────────────────────────────

    /// Durably write one year's output: events, accumulated state and the
    /// year report, all or nothing.
    pub fn write_year(
        &self,
        run_id: &str,
        year: SimulationYear,
        events: &[Event],
        state: &AccumulatedState,
        report_json: &str,
    ) -> SimResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        events::insert_events(&tx, run_id, events)?;
        state::insert_state(&tx, run_id, state)?;
        report::upsert_report(&tx, run_id, year, "completed", report_json)?;
        tx.commit()?;
        log::debug!(
            "run={run_id} year={year}: wrote {} events, {} state records",
            events.len(),
            state.len()
        );
        Ok(())
    }
}
