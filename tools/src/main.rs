//! sim-runner: headless runner for the workforce simulation.
//!
//! Usage:
//!   sim-runner run --config data/simulation.json --db run.db [--resume] [--force]
//!                  [--continue-on-error] [--no-fail-on-validation-error]
//!                  [--run-id <id>] [--threads <n>]
//!   sim-runner validate --config data/simulation.json
//!   sim-runner checkpoint --config data/simulation.json --run-id <id> [--show-latest]
//!
//! Exit codes: 0 success, 1 validation gate or run failure,
//! 2 configuration error, 3 stale checkpoint.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::Path;
use workforce_core::{
    checkpoint::CheckpointManager,
    config::SimConfig,
    error::SimError,
    orchestrator::{PipelineOrchestrator, RunOptions},
    store::SimStore,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let code = match dispatch(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<SimError>() {
                Some(sim) => sim.exit_code(),
                None => 2,
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(args: &[String]) -> Result<i32> {
    match args.get(1).map(String::as_str) {
        Some("run") => cmd_run(args),
        Some("validate") => cmd_validate(args),
        Some("checkpoint") => cmd_checkpoint(args),
        other => Err(anyhow!(
            "unknown command {other:?}; expected one of: run, validate, checkpoint"
        )),
    }
}

fn load_config(args: &[String]) -> Result<SimConfig> {
    let path = arg_value(args, "--config").ok_or_else(|| anyhow!("--config <file> is required"))?;
    Ok(SimConfig::load_validated(Path::new(path))?)
}

fn default_run_id(config: &SimConfig) -> String {
    format!("{}-{}-{}", config.scenario_id, config.plan_design_id, config.random_seed)
}

fn cmd_run(args: &[String]) -> Result<i32> {
    let mut config = load_config(args)?;
    config.execution.thread_count = parse_arg(args, "--threads", config.execution.thread_count);
    config.validate()?;

    let options = RunOptions {
        resume:                   has_flag(args, "--resume"),
        force:                    has_flag(args, "--force"),
        continue_on_error:        has_flag(args, "--continue-on-error"),
        fail_on_validation_error: !has_flag(args, "--no-fail-on-validation-error"),
    };
    let run_id = arg_value(args, "--run-id")
        .map(str::to_string)
        .unwrap_or_else(|| default_run_id(&config));
    let db = arg_value(args, "--db").unwrap_or(":memory:");

    println!("workforce simulation — sim-runner");
    println!("  run_id:   {run_id}");
    println!("  scenario: {} / {}", config.scenario_id, config.plan_design_id);
    println!("  years:    {}..={}", config.horizon.start_year, config.horizon.end_year);
    println!("  seed:     {}", config.random_seed);
    println!("  engine:   {} ({} threads)", config.execution.compute_engine.name(), config.execution.thread_count);
    println!("  db:       {db}");
    println!();

    let store = if db == ":memory:" {
        SimStore::in_memory()?
    } else {
        SimStore::open(db).with_context(|| format!("opening {db}"))?
    };
    let mut orchestrator = PipelineOrchestrator::build(run_id, config, store)?;
    let result = orchestrator.run_all(&options);

    if let Some(summary) = orchestrator.last_summary() {
        print!("{}", summary.render_table());
    }
    let summary = result?;
    if summary.is_success() {
        Ok(0)
    } else {
        Ok(1)
    }
}

fn cmd_validate(args: &[String]) -> Result<i32> {
    let config = load_config(args)?;
    println!("configuration OK");
    println!("  scenario:    {} / {}", config.scenario_id, config.plan_design_id);
    println!("  years:       {:?}", config.years());
    println!("  headcount:   {}", config.workforce.baseline_headcount);
    println!("  fingerprint: {}", config.fingerprint()?);
    Ok(0)
}

fn cmd_checkpoint(args: &[String]) -> Result<i32> {
    let config = load_config(args)?;
    let run_id = arg_value(args, "--run-id")
        .map(str::to_string)
        .unwrap_or_else(|| default_run_id(&config));
    let dir = config
        .checkpoint_dir
        .as_deref()
        .ok_or_else(|| SimError::Configuration("checkpoint_dir is not configured".into()))?;
    let manager = CheckpointManager::new(Some(dir))?;
    let fingerprint = config.fingerprint()?;

    let records = if has_flag(args, "--show-latest") {
        manager.latest(&run_id)?.into_iter().collect()
    } else {
        manager.history(&run_id)?
    };
    if records.is_empty() {
        println!("no checkpoints for run {run_id}");
        return Ok(0);
    }
    for cp in records {
        let compatible = if cp.config_fingerprint == fingerprint { "compatible" } else { "STALE" };
        println!(
            "{}  year {}  {}  active={} balance={}  [{compatible}]",
            cp.run_id,
            cp.last_completed_year,
            cp.timestamp.to_rfc3339(),
            cp.summary_metrics.active_headcount,
            cp.summary_metrics.total_balance
        );
    }
    Ok(0)
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
