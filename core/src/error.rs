use crate::types::{EmployeeId, SimulationYear};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Incomplete state for employee '{employee_id}' in year {year} (stage {stage}): {reason}")]
    IncompleteState {
        employee_id: EmployeeId,
        year:        SimulationYear,
        stage:       &'static str,
        reason:      String,
    },

    #[error("Attribution gap in year {year} for employee '{employee_id}': {reason}")]
    AttributionGap {
        year:        SimulationYear,
        employee_id: EmployeeId,
        event_uuid:  Option<uuid::Uuid>,
        reason:      String,
    },

    #[error("Validation gate '{check}' failed for year {year} (stage {stage}): {message}")]
    ValidationGateFailure {
        year:    SimulationYear,
        check:   String,
        stage:   &'static str,
        message: String,
    },

    #[error("Unresumable checkpoint for run '{run_id}' (checkpoint fingerprint {checkpoint_fingerprint}, \
             config fingerprint {config_fingerprint}); use --resume to continue or --force to discard")]
    StaleCheckpoint {
        run_id:                 String,
        checkpoint_fingerprint: String,
        config_fingerprint:     String,
    },

    #[error("Checkpoint for run '{run_id}' year {year} has no stored output in this database; \
             point --db at the run's database or use --force to restart")]
    CheckpointWithoutData { run_id: String, year: SimulationYear },

    #[error("Cache entry {fingerprint} is corrupt: {reason}")]
    CacheCorruption { fingerprint: String, reason: String },

    #[error("Run cancelled in year {year} after stage {stage}")]
    Cancelled { year: SimulationYear, stage: &'static str },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SimError {
    /// Process exit code for the command surface.
    /// 0 success, 1 validation gate / run failure, 2 configuration, 3 stale or unresumable checkpoint.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_)       => 2,
            Self::StaleCheckpoint { .. }
            | Self::CheckpointWithoutData { .. } => 3,
            _ => 1,
        }
    }

    /// The simulation year the error refers to, when there is one.
    pub fn year(&self) -> Option<SimulationYear> {
        match self {
            Self::IncompleteState { year, .. }
            | Self::AttributionGap { year, .. }
            | Self::ValidationGateFailure { year, .. }
            | Self::Cancelled { year, .. }
            | Self::CheckpointWithoutData { year, .. } => Some(*year),
            _ => None,
        }
    }

    /// The pipeline stage the error surfaced in, when there is one.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::IncompleteState { stage, .. }
            | Self::ValidationGateFailure { stage, .. }
            | Self::Cancelled { stage, .. } => Some(stage),
            Self::AttributionGap { .. } => Some("attribute"),
            _ => None,
        }
    }

    /// True for errors that abort only the current year, not the configuration.
    pub fn is_year_level(&self) -> bool {
        matches!(
            self,
            Self::IncompleteState { .. } | Self::ValidationGateFailure { .. }
        )
    }
}

pub type SimResult<T> = Result<T, SimError>;
