//! Run configuration.
//!
//! RULE: A `SimConfig` is immutable once loaded. It is shared as
//! `Arc<SimConfig>` and passed into every component call; no component
//! reads ambient global state. The fingerprint is computed once per run.

use crate::{
    calendar::{SimulationHorizon, MAX_YEAR, MIN_YEAR},
    error::{SimError, SimResult},
    types::Fingerprint,
    validation::Severity,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Upper bound on the starting salary of the top level, in dollars.
pub const MAX_BAND_COMPENSATION: f64 = 10_000_000.0;

// ── Strategy variants ──────────────────────────────────────────────────────

/// Which engine derives accumulated state. Resolved once at load time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputeEngine {
    #[default]
    InMemory,
    Sql,
}

impl ComputeEngine {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Sql      => "sql",
        }
    }
}

/// How annual raises are drawn by the rule-based event generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RaiseStrategy {
    /// Flat merit percentage for everyone.
    Legacy,
    /// Merit spread by level plus cost-of-living adjustment.
    #[default]
    Realistic,
}

// ── Business sections (fingerprinted) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkforceConfig {
    pub baseline_headcount:  usize,
    pub target_growth_rate:  f64,
    pub termination_rate:    f64,
    pub promotion_rate:      f64,
    pub max_level:           u8,
    /// Level-1 starting salary, in dollars.
    pub base_compensation:   f64,
    /// Salary multiplier applied per level above 1.
    pub level_multiplier:    f64,
    /// Salary bump on promotion, as a fraction.
    pub promotion_increase:  f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub raise_strategy: RaiseStrategy,
    pub merit_rate:     f64,
    pub cola_rate:      f64,
    /// Random spread around the merit rate (Realistic only).
    pub merit_spread:   f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDesignConfig {
    /// Probability a baseline employee is already enrolled.
    pub baseline_participation_rate: f64,
    pub auto_enroll:                 bool,
    pub auto_enroll_opt_out_rate:    f64,
    /// Voluntary enrollment probability when auto-enroll is off.
    pub voluntary_enroll_rate:       f64,
    pub default_deferral_rate:       f64,
    pub max_deferral_rate:           f64,
    pub escalation_enabled:          bool,
    pub escalation_increment:        f64,
    pub escalation_cap:              f64,
    /// Employer match as a fraction of matched deferrals.
    pub match_rate:                  f64,
    /// Deferral rate matched up to.
    pub match_cap:                   f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Per-check severity override. Checks not listed run at `error`.
    #[serde(default)]
    pub severities: BTreeMap<String, Severity>,
}

impl ValidationConfig {
    pub fn severity_for(&self, check: &str) -> Severity {
        self.severities.get(check).copied().unwrap_or(Severity::Error)
    }
}

// ── Execution sections (not fingerprinted) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub thread_count:    usize,
    pub compute_engine:  ComputeEngine,
    /// Allow independent in-year stages to run concurrently.
    pub parallel_stages: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { thread_count: 1, compute_engine: ComputeEngine::InMemory, parallel_stages: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub tier1_capacity:      usize,
    pub tier2_capacity:      usize,
    /// Access count at which a lower-tier hit is promoted to tier 1.
    pub promotion_threshold: u64,
    /// Durable compressed tier. None disables tier 3.
    pub durable_dir:         Option<PathBuf>,
    pub compression_level:   i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tier1_capacity:      16,
            tier2_capacity:      128,
            promotion_threshold: 2,
            durable_dir:         None,
            compression_level:   3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub scenario_id:    String,
    pub plan_design_id: String,
    pub horizon:        SimulationHorizon,
    pub random_seed:    u64,
    pub workforce:      WorkforceConfig,
    pub compensation:   CompensationConfig,
    pub plan:           PlanDesignConfig,
    #[serde(default)]
    pub validation:     ValidationConfig,
    #[serde(default)]
    pub execution:      ExecutionConfig,
    #[serde(default)]
    pub cache:          CacheConfig,
    /// Checkpoint directory. None keeps checkpoints in memory.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Per-year JSON reports are written here when set.
    #[serde(default)]
    pub report_dir:     Option<PathBuf>,
}

/// The subset of configuration that determines simulation results.
#[derive(Serialize)]
struct FingerprintView<'a> {
    scenario_id:    &'a str,
    plan_design_id: &'a str,
    random_seed:    u64,
    workforce:      &'a WorkforceConfig,
    compensation:   &'a CompensationConfig,
    plan:           &'a PlanDesignConfig,
    validation:     &'a ValidationConfig,
}

impl SimConfig {
    /// Load from a JSON file.
    /// In tests, use SimConfig::default_test().
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        let config: SimConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Load and validate; every failure is a configuration error.
    pub fn load_validated(path: &Path) -> SimResult<Self> {
        let config = Self::load(path).map_err(|e| SimError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        let fail = |msg: String| Err(SimError::Configuration(msg));

        if self.scenario_id.trim().is_empty() {
            return fail("scenario_id must not be empty".into());
        }
        if self.plan_design_id.trim().is_empty() {
            return fail("plan_design_id must not be empty".into());
        }
        let h = &self.horizon;
        if h.end_year < h.start_year {
            return fail(format!("end_year {} is before start_year {}", h.end_year, h.start_year));
        }
        if h.start_year < MIN_YEAR || h.end_year > MAX_YEAR {
            return fail(format!("horizon must lie within {MIN_YEAR}..={MAX_YEAR}"));
        }

        let rates = [
            ("workforce.termination_rate", self.workforce.termination_rate),
            ("workforce.promotion_rate", self.workforce.promotion_rate),
            ("workforce.promotion_increase", self.workforce.promotion_increase),
            ("compensation.merit_rate", self.compensation.merit_rate),
            ("compensation.cola_rate", self.compensation.cola_rate),
            ("compensation.merit_spread", self.compensation.merit_spread),
            ("plan.baseline_participation_rate", self.plan.baseline_participation_rate),
            ("plan.auto_enroll_opt_out_rate", self.plan.auto_enroll_opt_out_rate),
            ("plan.voluntary_enroll_rate", self.plan.voluntary_enroll_rate),
            ("plan.default_deferral_rate", self.plan.default_deferral_rate),
            ("plan.max_deferral_rate", self.plan.max_deferral_rate),
            ("plan.escalation_increment", self.plan.escalation_increment),
            ("plan.escalation_cap", self.plan.escalation_cap),
            ("plan.match_rate", self.plan.match_rate),
            ("plan.match_cap", self.plan.match_cap),
        ];
        for (name, value) in rates {
            if !(0.0..=1.0).contains(&value) {
                return fail(format!("{name} = {value} is outside [0, 1]"));
            }
        }
        if !(-0.5..=1.0).contains(&self.workforce.target_growth_rate) {
            return fail(format!(
                "workforce.target_growth_rate = {} is outside [-0.5, 1]",
                self.workforce.target_growth_rate
            ));
        }
        if self.plan.default_deferral_rate > self.plan.max_deferral_rate {
            return fail("plan.default_deferral_rate exceeds plan.max_deferral_rate".into());
        }
        if self.plan.escalation_cap > self.plan.max_deferral_rate {
            return fail("plan.escalation_cap exceeds plan.max_deferral_rate".into());
        }
        if self.workforce.max_level == 0 {
            return fail("workforce.max_level must be at least 1".into());
        }
        let w = &self.workforce;
        if !w.base_compensation.is_finite() || !w.level_multiplier.is_finite() {
            return fail("workforce compensation bands must be finite numbers".into());
        }
        if w.base_compensation <= 0.0 || w.level_multiplier < 1.0 {
            return fail("workforce compensation bands must be positive and non-decreasing".into());
        }
        let top_band = w.base_compensation * w.level_multiplier.powi(i32::from(w.max_level) - 1);
        if !top_band.is_finite() || top_band > MAX_BAND_COMPENSATION {
            return fail(format!(
                "workforce top band {top_band} exceeds {MAX_BAND_COMPENSATION} (base_compensation × level_multiplier^(max_level-1))"
            ));
        }
        if self.execution.thread_count == 0 {
            return fail("execution.thread_count must be at least 1".into());
        }
        if self.cache.tier1_capacity == 0 || self.cache.tier2_capacity == 0 {
            return fail("cache tier capacities must be at least 1".into());
        }
        if !(1..=22).contains(&self.cache.compression_level) {
            return fail(format!(
                "cache.compression_level = {} is outside 1..=22",
                self.cache.compression_level
            ));
        }
        Ok(())
    }

    /// Deterministic SHA-256 over the result-determining configuration.
    ///
    /// Uses canonical JSON with sorted keys so map ordering never changes
    /// the hash. Execution knobs (threads, engine, cache, directories) and
    /// the horizon are excluded: changing them never invalidates a checkpoint.
    pub fn fingerprint(&self) -> SimResult<Fingerprint> {
        let view = FingerprintView {
            scenario_id:    &self.scenario_id,
            plan_design_id: &self.plan_design_id,
            random_seed:    self.random_seed,
            workforce:      &self.workforce,
            compensation:   &self.compensation,
            plan:           &self.plan,
            validation:     &self.validation,
        };
        canonical_hash(&view)
    }

    pub fn years(&self) -> Vec<crate::types::SimulationYear> {
        self.horizon.years()
    }

    pub fn default_test() -> Self {
        Self {
            scenario_id:    "baseline".into(),
            plan_design_id: "standard_401k".into(),
            horizon:        SimulationHorizon::new(2025, 2027),
            random_seed:    42,
            workforce: WorkforceConfig {
                baseline_headcount: 200,
                target_growth_rate: 0.03,
                termination_rate:   0.12,
                promotion_rate:     0.08,
                max_level:          5,
                base_compensation:  52_000.0,
                level_multiplier:   1.28,
                promotion_increase: 0.10,
            },
            compensation: CompensationConfig {
                raise_strategy: RaiseStrategy::Realistic,
                merit_rate:     0.03,
                cola_rate:      0.01,
                merit_spread:   0.02,
            },
            plan: PlanDesignConfig {
                baseline_participation_rate: 0.65,
                auto_enroll:                 true,
                auto_enroll_opt_out_rate:    0.10,
                voluntary_enroll_rate:       0.25,
                default_deferral_rate:       0.06,
                max_deferral_rate:           0.75,
                escalation_enabled:          true,
                escalation_increment:        0.01,
                escalation_cap:              0.10,
                match_rate:                  0.50,
                match_cap:                   0.06,
            },
            validation:     ValidationConfig::default(),
            execution:      ExecutionConfig::default(),
            cache:          CacheConfig::default(),
            checkpoint_dir: None,
            report_dir:     None,
        }
    }

    // ── Test and harness builders ──────────────────────────────────────────

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_years(mut self, start: i32, end: i32) -> Self {
        self.horizon = SimulationHorizon::new(start, end);
        self
    }

    pub fn with_headcount(mut self, headcount: usize) -> Self {
        self.workforce.baseline_headcount = headcount;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.execution.thread_count = threads;
        self
    }

    pub fn with_engine(mut self, engine: ComputeEngine) -> Self {
        self.execution.compute_engine = engine;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }
}

/// SHA-256 of the canonical (sorted-key) JSON form of `value`.
pub fn canonical_hash<T: Serialize>(value: &T) -> SimResult<Fingerprint> {
    let canonical = canonicalize(serde_json::to_value(value)?);
    let json = serde_json::to_string(&canonical)?;
    Ok(sha256_hex(json.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_is_valid() {
        SimConfig::default_test().validate().unwrap();
    }

    #[test]
    fn fingerprint_ignores_execution_knobs() {
        let a = SimConfig::default_test();
        let b = SimConfig::default_test()
            .with_threads(4)
            .with_engine(ComputeEngine::Sql)
            .with_years(2025, 2030);
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn fingerprint_tracks_business_inputs() {
        let a = SimConfig::default_test();
        let b = SimConfig::default_test().with_seed(43);
        let mut c = SimConfig::default_test();
        c.plan.match_rate = 1.0;
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        assert_ne!(a.fingerprint().unwrap(), c.fingerprint().unwrap());
    }

    #[test]
    fn rejects_inverted_horizon() {
        let cfg = SimConfig::default_test().with_years(2027, 2025);
        assert!(matches!(cfg.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn rejects_out_of_range_rate() {
        let mut cfg = SimConfig::default_test();
        cfg.plan.match_cap = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("plan.match_cap"));
    }

    #[test]
    fn rejects_non_finite_compensation_bands() {
        let mut cfg = SimConfig::default_test();
        cfg.workforce.base_compensation = f64::NAN;
        assert!(matches!(cfg.validate(), Err(SimError::Configuration(_))));

        let mut cfg = SimConfig::default_test();
        cfg.workforce.level_multiplier = f64::INFINITY;
        assert!(matches!(cfg.validate(), Err(SimError::Configuration(_))));
    }

    #[test]
    fn rejects_top_band_above_ceiling() {
        let mut cfg = SimConfig::default_test();
        cfg.workforce.level_multiplier = 1e9;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("top band"), "{err}");
    }
}
