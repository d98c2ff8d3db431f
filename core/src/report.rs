//! Run reports — per-year JSON records and the multi-year summary table.

use crate::{
    cache::CacheStats,
    error::SimResult,
    optimizer::OverheadReport,
    snapshot::WorkforceSnapshot,
    types::{Fingerprint, RunId, SimulationYear},
    validation::ValidationOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Per-year lifecycle: PENDING → EVENTS_GENERATED → STATE_ACCUMULATED →
/// VALIDATED → CHECKPOINTED, or FAILED from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum YearPhase {
    Pending,
    EventsGenerated,
    StateAccumulated,
    Validated,
    Checkpointed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearStatus {
    Completed,
    /// Already checkpointed by an earlier run; not recomputed.
    Resumed,
    Failed,
    Cancelled,
}

impl YearStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Resumed   => "resumed",
            Self::Failed    => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearReport {
    pub run_id:            RunId,
    pub simulation_year:   SimulationYear,
    pub status:            YearStatus,
    pub phase:             YearPhase,
    pub snapshot:          Option<WorkforceSnapshot>,
    pub state_fingerprint: Option<Fingerprint>,
    pub cache_hit:         bool,
    pub validations:       Vec<ValidationOutcome>,
    pub stage_ms:          BTreeMap<String, f64>,
    pub error:             Option<String>,
    pub failed_stage:      Option<String>,
}

impl YearReport {
    pub fn new(run_id: &str, year: SimulationYear) -> Self {
        Self {
            run_id:            run_id.to_string(),
            simulation_year:   year,
            status:            YearStatus::Failed,
            phase:             YearPhase::Pending,
            snapshot:          None,
            state_fingerprint: None,
            cache_hit:         false,
            validations:       Vec::new(),
            stage_ms:          BTreeMap::new(),
            error:             None,
            failed_stage:      None,
        }
    }

    pub fn warnings(&self) -> usize {
        self.validations.iter().filter(|v| !v.passed).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelPoint {
    pub year:  SimulationYear,
    pub stage: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id:              RunId,
    pub config_fingerprint:  Fingerprint,
    pub years:               Vec<YearReport>,
    pub last_completed_year: Option<SimulationYear>,
    pub cancelled_at:        Option<CancelPoint>,
    pub cache:               CacheStats,
    pub overhead:            Option<OverheadReport>,
}

impl RunSummary {
    pub fn new(run_id: &str, config_fingerprint: &str) -> Self {
        Self {
            run_id:              run_id.to_string(),
            config_fingerprint:  config_fingerprint.to_string(),
            years:               Vec::new(),
            last_completed_year: None,
            cancelled_at:        None,
            cache:               CacheStats::default(),
            overhead:            None,
        }
    }

    /// Years computed and checkpointed in this run.
    pub fn clean_years(&self) -> usize {
        self.years.iter().filter(|y| y.status == YearStatus::Completed).count()
    }

    pub fn failed_years(&self) -> Vec<SimulationYear> {
        self.years
            .iter()
            .filter(|y| y.status == YearStatus::Failed)
            .map(|y| y.simulation_year)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.cancelled_at.is_none() && self.failed_years().is_empty()
    }

    pub fn report(&self, year: SimulationYear) -> Option<&YearReport> {
        self.years.iter().find(|y| y.simulation_year == year)
    }

    /// Fixed-width multi-year table.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<6} {:<10} {:>8} {:>8} {:>8} {:>8} {:>16} {:>16} {:>5}",
            "year", "status", "active", "hires", "terms", "enrolled", "compensation", "balance", "warn"
        );
        for y in &self.years {
            match &y.snapshot {
                Some(s) => {
                    let _ = writeln!(
                        out,
                        "{:<6} {:<10} {:>8} {:>8} {:>8} {:>8} {:>16} {:>16} {:>5}",
                        y.simulation_year,
                        y.status.name(),
                        s.active_headcount,
                        s.events.hires,
                        s.events.terminations,
                        s.enrolled_headcount,
                        s.active_compensation.to_string(),
                        s.total_balance.to_string(),
                        y.warnings()
                    );
                }
                None => {
                    let _ = writeln!(
                        out,
                        "{:<6} {:<10} {}",
                        y.simulation_year,
                        y.status.name(),
                        y.error.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        let _ = writeln!(
            out,
            "clean years: {}  failed: {:?}  cache tier-1 hit rate: {:.1}%",
            self.clean_years(),
            self.failed_years(),
            self.cache.tier1_hit_rate() * 100.0
        );
        if let Some(o) = &self.overhead {
            let _ = writeln!(
                out,
                "coordination overhead reduction: estimated {:.1}%, actual {:.1}%",
                o.estimated_reduction_pct, o.actual_reduction_pct
            );
        }
        out
    }
}

/// Write `<dir>/<run_id>/year-YYYY.json`.
pub fn write_year_report(dir: &Path, report: &YearReport) -> SimResult<()> {
    let run_dir = dir.join(&report.run_id);
    std::fs::create_dir_all(&run_dir)?;
    let path = run_dir.join(format!("year-{:04}.json", report.simulation_year));
    std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
    log::debug!("report: wrote {}", path.display());
    Ok(())
}

/// Write `<dir>/<run_id>/summary.json` and `summary.txt`.
pub fn write_summary(dir: &Path, summary: &RunSummary) -> SimResult<()> {
    let run_dir = dir.join(&summary.run_id);
    std::fs::create_dir_all(&run_dir)?;
    std::fs::write(run_dir.join("summary.json"), serde_json::to_vec_pretty(summary)?)?;
    std::fs::write(run_dir.join("summary.txt"), summary.render_table())?;
    Ok(())
}
