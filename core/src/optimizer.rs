//! CoordinationOptimizer — plans how each year's stages are executed.
//!
//! STAGES PER YEAR (fixed order, never reordered):
//!   1. generate_events
//!   2. derive_workforce   ┐ may run concurrently
//!   3. derive_enrollment  ┘
//!   4. apply_contributions
//!   5. validate           (checks may run concurrently with each other)
//!   6. persist
//!   7. checkpoint
//!   8. report
//!
//! RULE: Years never overlap. Year N+1 starts only after year N has been
//! checkpointed; a plan that says otherwise is rejected by `validate`.
//! RULE: The overhead report is diagnostic. It never changes what runs.

use crate::{
    error::{SimError, SimResult},
    types::SimulationYear,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GenerateEvents,
    DeriveWorkforce,
    DeriveEnrollment,
    ApplyContributions,
    Validate,
    Persist,
    Checkpoint,
    Report,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Self::GenerateEvents,
        Self::DeriveWorkforce,
        Self::DeriveEnrollment,
        Self::ApplyContributions,
        Self::Validate,
        Self::Persist,
        Self::Checkpoint,
        Self::Report,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::GenerateEvents     => "generate_events",
            Self::DeriveWorkforce    => "derive_workforce",
            Self::DeriveEnrollment   => "derive_enrollment",
            Self::ApplyContributions => "apply_contributions",
            Self::Validate           => "validate",
            Self::Persist            => "persist",
            Self::Checkpoint         => "checkpoint",
            Self::Report             => "report",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Static cost per 1,000 employees, in milliseconds.
    fn heuristic_ms_per_1k(&self) -> f64 {
        match self {
            Self::GenerateEvents     => 4.0,
            Self::DeriveWorkforce    => 2.0,
            Self::DeriveEnrollment   => 1.5,
            Self::ApplyContributions => 1.0,
            Self::Validate           => 1.2,
            Self::Persist            => 6.0,
            Self::Checkpoint         => 0.05,
            Self::Report             => 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAssignment {
    pub stage:        Stage,
    pub mode:         ExecutionMode,
    /// Stages sharing a group run together; groups run in ascending order.
    pub group:        u8,
    pub estimated_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearPlan {
    pub year:    SimulationYear,
    pub stages:  Vec<StageAssignment>,
    /// Load durable cache entries for this year before accumulating.
    pub prewarm: bool,
}

impl YearPlan {
    pub fn mode_of(&self, stage: Stage) -> ExecutionMode {
        self.stages
            .iter()
            .find(|a| a.stage == stage)
            .map(|a| a.mode)
            .unwrap_or(ExecutionMode::Sequential)
    }

    /// Estimated wall time: each group costs its slowest member.
    pub fn estimated_wall_ms(&self) -> f64 {
        let mut groups: BTreeMap<u8, f64> = BTreeMap::new();
        for a in &self.stages {
            let g = groups.entry(a.group).or_insert(0.0);
            *g = g.max(a.estimated_ms);
        }
        groups.values().sum()
    }

    pub fn estimated_sequential_ms(&self, threads: usize) -> f64 {
        self.stages
            .iter()
            .map(|a| match (a.stage, a.mode) {
                // A parallel validate estimate is already divided by threads.
                (Stage::Validate, ExecutionMode::Parallel) => a.estimated_ms * threads as f64,
                _ => a.estimated_ms,
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub years:                   Vec<YearPlan>,
    pub worker_threads:          usize,
    pub parallel_derivation:     bool,
    pub parallel_validation:     bool,
    pub bottleneck:              Stage,
    pub cost_source:             CostSource,
    pub estimated_reduction_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    History,
    Heuristic,
}

impl ExecutionPlan {
    pub fn year(&self, year: SimulationYear) -> Option<&YearPlan> {
        self.years.iter().find(|y| y.year == year)
    }

    /// Check the correctness-critical ordering: years strictly ascending,
    /// stages in canonical order, and only the two derivation stages may
    /// share a concurrent group.
    pub fn validate(&self) -> SimResult<()> {
        let fail = |msg: String| Err(SimError::Configuration(format!("invalid execution plan: {msg}")));
        for pair in self.years.windows(2) {
            if pair[1].year <= pair[0].year {
                return fail(format!("year {} scheduled after {}", pair[1].year, pair[0].year));
            }
        }
        for yp in &self.years {
            let order: Vec<Stage> = yp.stages.iter().map(|a| a.stage).collect();
            if order != Stage::ALL {
                return fail(format!("year {} stages out of order", yp.year));
            }
            for pair in yp.stages.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                if b.group < a.group {
                    return fail(format!("year {}: group order decreases at {}", yp.year, b.stage.name()));
                }
                let concurrent_derivation =
                    a.stage == Stage::DeriveWorkforce && b.stage == Stage::DeriveEnrollment;
                if a.group == b.group && !concurrent_derivation {
                    return fail(format!(
                        "year {}: {} and {} cannot run concurrently",
                        yp.year,
                        a.stage.name(),
                        b.stage.name()
                    ));
                }
            }
        }
        Ok(())
    }
}

// ── Inputs ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableResources {
    pub threads:         usize,
    /// Whether independent in-year stages may run concurrently at all.
    pub allow_parallel:  bool,
    pub durable_entries: usize,
    pub resuming:        bool,
}

/// Mean stage cost from earlier runs, per 1,000 employees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunHistory {
    pub stage_ms_per_1k: BTreeMap<Stage, f64>,
    pub samples:         u64,
}

impl RunHistory {
    pub fn load(path: &Path) -> SimResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn save(&self, path: &Path) -> SimResult<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Fold measured timings into the running means.
    pub fn record(&mut self, timings: &StageTimings, employees: usize) {
        let per_1k = (employees.max(1) as f64) / 1000.0;
        for (stage, mean_ms) in timings.mean_ms_by_stage() {
            let sample = mean_ms / per_1k;
            let n = self.samples as f64;
            let entry = self.stage_ms_per_1k.entry(stage).or_insert(sample);
            *entry = (*entry * n + sample) / (n + 1.0);
        }
        self.samples += 1;
    }
}

/// Measured durations per (year, stage), plus wall time per year.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub per_year: BTreeMap<SimulationYear, BTreeMap<Stage, f64>>,
    pub wall_ms:  BTreeMap<SimulationYear, f64>,
}

impl StageTimings {
    pub fn record(&mut self, year: SimulationYear, stage: Stage, elapsed: Duration) {
        *self.per_year.entry(year).or_default().entry(stage).or_insert(0.0) +=
            elapsed.as_secs_f64() * 1000.0;
    }

    pub fn record_wall(&mut self, year: SimulationYear, elapsed: Duration) {
        self.wall_ms.insert(year, elapsed.as_secs_f64() * 1000.0);
    }

    pub fn sequential_ms(&self) -> f64 {
        self.per_year.values().flat_map(|m| m.values()).sum()
    }

    pub fn total_wall_ms(&self) -> f64 {
        self.wall_ms.values().sum()
    }

    fn mean_ms_by_stage(&self) -> BTreeMap<Stage, f64> {
        let mut sums: BTreeMap<Stage, (f64, f64)> = BTreeMap::new();
        for stages in self.per_year.values() {
            for (stage, ms) in stages {
                let e = sums.entry(*stage).or_insert((0.0, 0.0));
                e.0 += ms;
                e.1 += 1.0;
            }
        }
        sums.into_iter().map(|(s, (total, n))| (s, total / n)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverheadReport {
    pub estimated_reduction_pct: f64,
    pub actual_reduction_pct:    f64,
    pub measured_sequential_ms:  f64,
    pub measured_wall_ms:        f64,
}

// ── Optimizer ────────────────────────────────────────────────────────────

/// Below this many employees per worker, thread start-up outweighs the
/// derivation work.
const MIN_EMPLOYEES_PER_WORKER: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct CoordinationOptimizer {
    history: Option<RunHistory>,
}

impl CoordinationOptimizer {
    pub fn new(history: Option<RunHistory>) -> Self {
        Self { history }
    }

    pub fn history(&self) -> Option<&RunHistory> {
        self.history.as_ref()
    }

    fn stage_cost_ms(&self, stage: Stage, employees: usize) -> (f64, CostSource) {
        let per_1k = employees as f64 / 1000.0;
        match self.history.as_ref().and_then(|h| h.stage_ms_per_1k.get(&stage)) {
            Some(ms) => (ms * per_1k, CostSource::History),
            None => (stage.heuristic_ms_per_1k() * per_1k, CostSource::Heuristic),
        }
    }

    pub fn plan(
        &self,
        years: &[SimulationYear],
        employees: usize,
        resources: &AvailableResources,
    ) -> ExecutionPlan {
        let threads = resources.threads.max(1);
        let parallel_ok = resources.allow_parallel && threads > 1;
        let parallel_derivation = parallel_ok && employees >= MIN_EMPLOYEES_PER_WORKER * 2;
        let parallel_validation = parallel_ok;
        let prewarm = resources.durable_entries > 0 || resources.resuming;

        let mut cost_source = CostSource::Heuristic;
        let costs: BTreeMap<Stage, f64> = Stage::ALL
            .into_iter()
            .map(|s| {
                let (ms, source) = self.stage_cost_ms(s, employees);
                if source == CostSource::History {
                    cost_source = CostSource::History;
                }
                (s, ms)
            })
            .collect();
        let bottleneck = costs
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(s, _)| *s)
            .unwrap_or(Stage::Persist);

        let year_plans: Vec<YearPlan> = years
            .iter()
            .map(|&year| {
                let mut group = 0u8;
                let stages = Stage::ALL
                    .into_iter()
                    .map(|stage| {
                        let joins_previous = stage == Stage::DeriveEnrollment && parallel_derivation;
                        if !joins_previous && stage != Stage::GenerateEvents {
                            group += 1;
                        }
                        let (mode, estimated_ms) = match stage {
                            Stage::DeriveWorkforce | Stage::DeriveEnrollment if parallel_derivation => {
                                (ExecutionMode::Parallel, costs[&stage])
                            }
                            Stage::Validate if parallel_validation => {
                                (ExecutionMode::Parallel, costs[&stage] / threads as f64)
                            }
                            _ => (ExecutionMode::Sequential, costs[&stage]),
                        };
                        StageAssignment { stage, mode, group, estimated_ms }
                    })
                    .collect();
                YearPlan { year, stages, prewarm }
            })
            .collect();

        let sequential: f64 = year_plans.iter().map(|y| y.estimated_sequential_ms(threads)).sum();
        let planned: f64 = year_plans.iter().map(YearPlan::estimated_wall_ms).sum();
        let estimated_reduction_pct = reduction_pct(sequential, planned);

        log::info!(
            "optimizer: {} years, {employees} employees, {threads} threads; \
             parallel derivation={parallel_derivation}, prewarm={prewarm}, bottleneck={}, \
             estimated reduction {estimated_reduction_pct:.1}%",
            years.len(),
            bottleneck.name()
        );

        ExecutionPlan {
            years: year_plans,
            worker_threads: threads,
            parallel_derivation,
            parallel_validation,
            bottleneck,
            cost_source,
            estimated_reduction_pct,
        }
    }

    /// Compare the plan's estimate with measured timings.
    pub fn overhead_report(&self, plan: &ExecutionPlan, timings: &StageTimings) -> OverheadReport {
        let measured_sequential_ms = timings.sequential_ms();
        let measured_wall_ms = timings.total_wall_ms();
        OverheadReport {
            estimated_reduction_pct: plan.estimated_reduction_pct,
            actual_reduction_pct: reduction_pct(measured_sequential_ms, measured_wall_ms),
            measured_sequential_ms,
            measured_wall_ms,
        }
    }
}

fn reduction_pct(sequential: f64, actual: f64) -> f64 {
    if sequential <= 0.0 {
        return 0.0;
    }
    ((sequential - actual) / sequential * 100.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(threads: usize) -> AvailableResources {
        AvailableResources { threads, allow_parallel: true, durable_entries: 0, resuming: false }
    }

    #[test]
    fn single_thread_plan_is_fully_sequential() {
        let plan = CoordinationOptimizer::default().plan(&[2025, 2026], 5_000, &resources(1));
        plan.validate().unwrap();
        assert!(!plan.parallel_derivation);
        assert_eq!(plan.estimated_reduction_pct, 0.0);
        for yp in &plan.years {
            let groups: Vec<u8> = yp.stages.iter().map(|a| a.group).collect();
            assert_eq!(groups, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        }
    }

    #[test]
    fn only_derivation_stages_share_a_group() {
        let plan = CoordinationOptimizer::default().plan(&[2025], 5_000, &resources(4));
        plan.validate().unwrap();
        let yp = &plan.years[0];
        assert_eq!(yp.mode_of(Stage::DeriveWorkforce), ExecutionMode::Parallel);
        assert_eq!(yp.stages[1].group, yp.stages[2].group);
        assert!(plan.estimated_reduction_pct > 0.0);
    }

    #[test]
    fn plans_that_overlap_years_are_rejected() {
        let mut plan = CoordinationOptimizer::default().plan(&[2025, 2026], 100, &resources(2));
        plan.years.swap(0, 1);
        assert!(plan.validate().is_err());

        let mut plan = CoordinationOptimizer::default().plan(&[2025], 100, &resources(2));
        plan.years[0].stages[5].group = plan.years[0].stages[4].group;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn history_overrides_heuristics() {
        let mut history = RunHistory::default();
        history.stage_ms_per_1k.insert(Stage::Validate, 500.0);
        let plan = CoordinationOptimizer::new(Some(history)).plan(&[2025], 1_000, &resources(1));
        assert_eq!(plan.cost_source, CostSource::History);
        assert_eq!(plan.bottleneck, Stage::Validate);
    }
}
