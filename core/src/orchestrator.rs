//! PipelineOrchestrator — drives a run year by year.
//!
//! STAGE ORDER (fixed, never reordered):
//!   1. Generate events        (EventGenerator)
//!   2. Accumulate state       (StateAccumulator, cache-aware)
//!   3. Validate               (YearValidator set, gate on `error` checks)
//!   4. Persist                (one store transaction per year)
//!   5. Checkpoint             (only after persist succeeded)
//!   6. Report                 (year report file, run summary at the end)
//!
//! RULES:
//!   - Year N is never started before year N-1 is checkpointed.
//!   - A failed or cancelled year persists nothing.
//!   - Checkpoint compatibility is decided before any stage runs.
//!   - All randomness flows through the RngBank.

use crate::{
    accumulator::StateAccumulator,
    attribution::CrossYearCostAttributor,
    cache::{CacheManager, CacheTier},
    checkpoint::CheckpointManager,
    config::SimConfig,
    error::{SimError, SimResult},
    event::{sort_events, Event},
    generator::{generate_census, EventGenerator, RuleBasedGenerator},
    optimizer::{
        AvailableResources, CoordinationOptimizer, ExecutionPlan, RunHistory, Stage, StageTimings,
    },
    pool::WorkerPool,
    report::{self, CancelPoint, RunSummary, YearPhase, YearReport, YearStatus},
    rng::RngBank,
    snapshot::WorkforceSnapshot,
    state::{AccumulatedState, Census},
    store::SimStore,
    types::{Fingerprint, RunId, SimulationYear},
    validation::{self, builtin_validators, YearContext, YearValidator},
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
const HISTORY_FILE: &str = "run_history.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Continue from the latest compatible checkpoint.
    pub resume: bool,
    /// A failing `error`-severity check fails the year.
    pub fail_on_validation_error: bool,
    /// Record a failed year and go on to the next one.
    pub continue_on_error: bool,
    /// Discard existing checkpoints and stored output for the run.
    pub force: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            fail_on_validation_error: true,
            continue_on_error: false,
            force: false,
        }
    }
}

impl RunOptions {
    pub fn resuming() -> Self {
        Self { resume: true, ..Self::default() }
    }

    pub fn forced() -> Self {
        Self { force: true, ..Self::default() }
    }
}

/// Cooperative cancellation. Checked between stages; a cancelled year is
/// never committed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PipelineOrchestrator {
    run_id:       RunId,
    config:       Arc<SimConfig>,
    fingerprint:  Fingerprint,
    store:        SimStore,
    cache:        Arc<CacheManager>,
    checkpoints:  CheckpointManager,
    rng_bank:     RngBank,
    census:       Arc<Census>,
    generator:    Box<dyn EventGenerator>,
    validators:   Vec<Box<dyn YearValidator>>,
    optimizer:    CoordinationOptimizer,
    cancel:       CancelToken,
    timings:      StageTimings,
    last_summary: Option<RunSummary>,
}

impl PipelineOrchestrator {
    /// Build a fully wired orchestrator: validated config, migrated store,
    /// cache tiers, checkpoint location, census and the built-in validators.
    pub fn build(run_id: impl Into<RunId>, config: SimConfig, store: SimStore) -> SimResult<Self> {
        config.validate()?;
        store.migrate()?;
        let fingerprint = config.fingerprint()?;
        let cache = Arc::new(CacheManager::new(&config.cache)?);
        let checkpoints = CheckpointManager::new(config.checkpoint_dir.as_deref())?;
        let rng_bank = RngBank::new(config.random_seed);
        let census = Arc::new(generate_census(&config, &rng_bank));
        let history = match history_path(&config) {
            Some(path) => RunHistory::load(&path).unwrap_or_else(|e| {
                log::warn!("optimizer: ignoring unreadable run history {} ({e})", path.display());
                None
            }),
            None => None,
        };
        let run_id = run_id.into();
        log::info!(
            "orchestrator: run={run_id} scenario={} plan_design={} seed={} census={} fingerprint={}",
            config.scenario_id,
            config.plan_design_id,
            config.random_seed,
            census.records.len(),
            &fingerprint[..12.min(fingerprint.len())]
        );
        Ok(Self {
            run_id,
            config: Arc::new(config),
            fingerprint,
            store,
            cache,
            checkpoints,
            rng_bank,
            census,
            generator: Box::new(RuleBasedGenerator::new()),
            validators: builtin_validators(),
            optimizer: CoordinationOptimizer::new(history),
            cancel: CancelToken::default(),
            timings: StageTimings::default(),
            last_summary: None,
        })
    }

    /// In-memory store and checkpoints; run id derived from scenario and seed.
    pub fn build_test(config: SimConfig) -> SimResult<Self> {
        let run_id = format!("test-{}-{}", config.scenario_id, config.random_seed);
        Self::build(run_id, config, SimStore::in_memory()?)
    }

    /// Replace the event generator.
    pub fn with_generator(mut self, generator: Box<dyn EventGenerator>) -> Self {
        self.generator = generator;
        self
    }

    /// Share a cache between orchestrators (e.g. a rerun in the same process).
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = cache;
        self
    }

    /// Register an additional validator. Runs after the built-in ones.
    pub fn add_validator(&mut self, validator: Box<dyn YearValidator>) {
        self.validators.push(validator);
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn store(&self) -> &SimStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn census(&self) -> &Census {
        &self.census
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }

    /// Summary of the most recent `run`, including runs that returned Err.
    pub fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    pub fn attributor(&self) -> CrossYearCostAttributor<'_> {
        CrossYearCostAttributor::new(&self.store, &self.cache, &self.run_id)
    }

    pub fn state_for_year(&self, year: SimulationYear) -> SimResult<Option<AccumulatedState>> {
        self.store.state_for_year(&self.run_id, year)
    }

    // ── Run loop ───────────────────────────────────────────────

    /// Run every year of the configured horizon.
    pub fn run_all(&mut self, options: &RunOptions) -> SimResult<RunSummary> {
        let years = self.config.years();
        self.run(&years, options)
    }

    /// Run `years` (ascending, contiguous, inside the horizon). Years already
    /// checkpointed are reported as resumed and not recomputed.
    pub fn run(&mut self, years: &[SimulationYear], options: &RunOptions) -> SimResult<RunSummary> {
        self.check_years(years)?;
        let latest = self.preflight(options)?;
        self.store
            .insert_run(&self.run_id, self.config.random_seed, ENGINE_VERSION, &self.fingerprint)?;

        let mut committed = latest.map(|cp| cp.last_completed_year);
        let mut summary = RunSummary::new(&self.run_id, &self.fingerprint);
        summary.last_completed_year = committed;

        let pending: Vec<SimulationYear> =
            years.iter().copied().filter(|y| committed.map_or(true, |c| *y > c)).collect();
        if let Some(&first) = pending.first() {
            let expected = committed.map_or(self.config.horizon.start_year, |c| c + 1);
            if first != expected {
                return Err(SimError::Configuration(format!(
                    "year {first} cannot run before year {expected} is checkpointed"
                )));
            }
        }

        let resources = AvailableResources {
            threads:         self.config.execution.thread_count,
            allow_parallel:  self.config.execution.parallel_stages,
            durable_entries: self.cache.tier_len(CacheTier::Durable),
            resuming:        options.resume && committed.is_some(),
        };
        let plan = self.optimizer.plan(&pending, self.census.records.len(), &resources);
        plan.validate()?;
        let workers = Arc::new(WorkerPool::new(plan.worker_threads)?);
        let accumulator = StateAccumulator::new(self.config.clone(), self.census.clone())
            .with_workers(Arc::clone(&workers), plan.parallel_derivation);

        let resumed = self.checkpoints.history(&self.run_id)?;
        for &year in years.iter().filter(|y| !pending.contains(y)) {
            let mut report = YearReport::new(&self.run_id, year);
            report.status = YearStatus::Resumed;
            report.phase = YearPhase::Checkpointed;
            report.snapshot = resumed
                .iter()
                .find(|cp| cp.last_completed_year == year)
                .map(|cp| cp.summary_metrics.clone());
            log::info!("year {year}: already checkpointed, skipping");
            summary.years.push(report);
        }

        let mut prior = match committed {
            Some(c) if !pending.is_empty() => Some(
                self.store
                    .state_for_year(&self.run_id, c)?
                    .ok_or_else(|| SimError::CheckpointWithoutData { run_id: self.run_id.clone(), year: c })?,
            ),
            _ => None,
        };

        for year in pending {
            self.store.discard_uncommitted(&self.run_id, year)?;
            let mut report = YearReport::new(&self.run_id, year);
            let started = Instant::now();
            let outcome =
                self.run_year(year, prior.as_ref(), &plan, &accumulator, &workers, options, &mut report);
            match outcome {
                Ok(state) => {
                    self.timings.record_wall(year, started.elapsed());
                    committed = Some(year);
                    summary.last_completed_year = committed;
                    prior = Some(state);
                    summary.years.push(report);
                }
                Err(SimError::Cancelled { year, stage }) => {
                    log::warn!("year {year}: cancelled after {stage}; nothing committed");
                    report.status = YearStatus::Cancelled;
                    report.error = Some(format!("cancelled after {stage}"));
                    summary.cancelled_at = Some(CancelPoint { year, stage });
                    summary.years.push(report);
                    break;
                }
                Err(e) => {
                    log::error!("year {year}: {e}");
                    report.status = YearStatus::Failed;
                    report.phase = YearPhase::Failed;
                    report.error = Some(e.to_string());
                    report.failed_stage = e.stage().map(str::to_string);
                    self.store.discard_uncommitted(&self.run_id, year)?;
                    summary.years.push(report);
                    if options.continue_on_error && e.is_year_level() {
                        continue;
                    }
                    self.finish(&plan, &mut summary)?;
                    return Err(e);
                }
            }
        }

        self.finish(&plan, &mut summary)?;
        Ok(summary)
    }

    fn check_years(&self, years: &[SimulationYear]) -> SimResult<()> {
        for y in years {
            if !self.config.horizon.contains(*y) {
                return Err(SimError::Configuration(format!(
                    "year {y} is outside the horizon {}..={}",
                    self.config.horizon.start_year, self.config.horizon.end_year
                )));
            }
        }
        if years.windows(2).any(|w| w[1] != w[0] + 1) {
            return Err(SimError::Configuration(format!(
                "years must be ascending and contiguous, got {years:?}"
            )));
        }
        Ok(())
    }

    /// Decide checkpoint compatibility before any stage runs.
    fn preflight(&mut self, options: &RunOptions) -> SimResult<Option<crate::checkpoint::CheckpointRecord>> {
        if options.force {
            let cleared = self.checkpoints.clear(&self.run_id)?;
            self.store.purge_run(&self.run_id)?;
            log::warn!("run={}: force restart, discarded {cleared} checkpoints and stored output", self.run_id);
            return Ok(None);
        }
        if let Some(stored) = self.store.run_fingerprint(&self.run_id)? {
            if stored != self.fingerprint {
                return Err(SimError::StaleCheckpoint {
                    run_id:                 self.run_id.clone(),
                    checkpoint_fingerprint: stored,
                    config_fingerprint:     self.fingerprint.clone(),
                });
            }
        }
        let latest = self.checkpoints.latest(&self.run_id)?;
        if let Some(cp) = &latest {
            cp.verify(&self.fingerprint)?;
            if !options.resume {
                return Err(SimError::StaleCheckpoint {
                    run_id:                 self.run_id.clone(),
                    checkpoint_fingerprint: cp.config_fingerprint.clone(),
                    config_fingerprint:     self.fingerprint.clone(),
                });
            }
            if self.store.state_header(&self.run_id, cp.last_completed_year)?.is_none() {
                return Err(SimError::CheckpointWithoutData {
                    run_id: self.run_id.clone(),
                    year:   cp.last_completed_year,
                });
            }
            log::info!(
                "run={}: resuming after year {} (checkpoint {})",
                self.run_id,
                cp.last_completed_year,
                cp.timestamp.to_rfc3339()
            );
        }
        Ok(latest)
    }

    fn check_cancel(&self, year: SimulationYear, stage: &'static str) -> SimResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SimError::Cancelled { year, stage });
        }
        Ok(())
    }

    fn record(&mut self, report: &mut YearReport, stage: Stage, elapsed: Duration) {
        self.timings.record(report.simulation_year, stage, elapsed);
        *report.stage_ms.entry(stage.name().to_string()).or_default() += elapsed.as_secs_f64() * 1000.0;
    }

    fn run_year(
        &mut self,
        year: SimulationYear,
        prior: Option<&AccumulatedState>,
        plan: &ExecutionPlan,
        accumulator: &StateAccumulator,
        workers: &WorkerPool,
        options: &RunOptions,
        report: &mut YearReport,
    ) -> SimResult<AccumulatedState> {
        log::info!("year {year}: start");
        self.check_cancel(year, "pending")?;

        let baseline;
        let prior_state = match prior {
            Some(p) => p,
            None => {
                baseline = accumulator.baseline(year);
                &baseline
            }
        };

        // 1. Generate
        let t = Instant::now();
        let mut events: Vec<Event> =
            self.generator.generate(year, prior_state, &self.config, &self.rng_bank)?;
        sort_events(&mut events);
        self.record(report, Stage::GenerateEvents, t.elapsed());
        report.phase = YearPhase::EventsGenerated;
        log::debug!("year {year}: {} events from {}", events.len(), self.generator.name());
        self.check_cancel(year, "generate_events")?;

        // 2. Accumulate
        if plan.year(year).is_some_and(|p| p.prewarm) {
            let loaded = self.cache.prewarm(&format!("year:{year}"));
            if loaded > 0 {
                log::debug!("year {year}: prewarmed {loaded} cache entries");
            }
        }
        let acc = accumulator.advance_detailed(prior, year, &events, &self.cache)?;
        for (name, elapsed) in &acc.timings {
            let stage = Stage::from_name(name).unwrap_or(Stage::DeriveWorkforce);
            self.timings.record(year, stage, *elapsed);
            *report.stage_ms.entry((*name).to_string()).or_default() += elapsed.as_secs_f64() * 1000.0;
        }
        report.cache_hit = acc.cache_hit;
        report.state_fingerprint = Some(acc.fingerprint.clone());
        report.phase = YearPhase::StateAccumulated;
        self.check_cancel(year, "accumulate_state")?;

        // 3. Validate
        let t = Instant::now();
        let inline = WorkerPool::sequential();
        let validators_on = if plan.parallel_validation { workers } else { &inline };
        let ctx = YearContext {
            year,
            prior: prior_state,
            events: &events,
            state: &acc.state,
            config: &self.config,
        };
        let outcomes = validation::run_validators(&self.validators, &ctx, &self.config.validation, validators_on);
        self.record(report, Stage::Validate, t.elapsed());
        report.validations = outcomes;
        validation::gate(year, &report.validations, options.fail_on_validation_error)?;
        report.phase = YearPhase::Validated;
        self.check_cancel(year, "validate")?;

        // 4. Persist
        let snapshot = WorkforceSnapshot::take(&acc.state, &events);
        report.snapshot = Some(snapshot.clone());
        report.status = YearStatus::Completed;
        report.phase = YearPhase::Checkpointed;
        let t = Instant::now();
        let report_json = serde_json::to_string(&*report)?;
        self.store.write_year(&self.run_id, year, &events, &acc.state, &report_json)?;
        self.record(report, Stage::Persist, t.elapsed());

        // 5. Checkpoint
        let t = Instant::now();
        self.checkpoints.commit(&self.run_id, year, &self.fingerprint, snapshot)?;
        self.record(report, Stage::Checkpoint, t.elapsed());

        // 6. Report
        let t = Instant::now();
        if let Some(dir) = &self.config.report_dir {
            report::write_year_report(dir, report)?;
        }
        self.record(report, Stage::Report, t.elapsed());
        log::info!(
            "year {year}: completed ({} events, {} active, cache {})",
            events.len(),
            report.snapshot.as_ref().map_or(0, |s| s.active_headcount),
            if acc.cache_hit { "hit" } else { "miss" }
        );
        Ok(acc.state)
    }

    /// Close out the summary: cache stats, overhead, history, files.
    fn finish(&mut self, plan: &ExecutionPlan, summary: &mut RunSummary) -> SimResult<()> {
        summary.cache = self.cache.stats();
        summary.overhead = Some(self.optimizer.overhead_report(plan, &self.timings));
        if let Some(path) = history_path(&self.config) {
            let mut history = self.optimizer.history().cloned().unwrap_or_default();
            history.record(&self.timings, self.census.records.len());
            history.save(&path)?;
        }
        if let Some(dir) = &self.config.report_dir {
            report::write_summary(dir, summary)?;
        }
        log::info!(
            "run={}: {} clean years, failed {:?}, last completed {:?}",
            self.run_id,
            summary.clean_years(),
            summary.failed_years(),
            summary.last_completed_year
        );
        self.last_summary = Some(summary.clone());
        Ok(())
    }
}

fn history_path(config: &SimConfig) -> Option<PathBuf> {
    config.checkpoint_dir.as_ref().map(|d| d.join(HISTORY_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_gate_on_errors() {
        let o = RunOptions::default();
        assert!(o.fail_on_validation_error);
        assert!(!o.resume && !o.force && !o.continue_on_error);
    }

    #[test]
    fn cancel_token_is_shared() {
        let a = CancelToken::default();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
        a.reset();
        assert!(!b.is_cancelled());
    }
}
