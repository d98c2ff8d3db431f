//! Incremental accumulation must equal a full replay from the census,
//! for both compute engines, on arbitrary small populations.

use proptest::prelude::*;
use workforce_core::{
    accumulator::replay_from_baseline,
    config::{ComputeEngine, SimConfig},
    orchestrator::{PipelineOrchestrator, RunOptions},
};

fn run(config: SimConfig) -> PipelineOrchestrator {
    let mut orch = PipelineOrchestrator::build_test(config).expect("build");
    orch.run_all(&RunOptions::default()).expect("run");
    orch
}

fn check_against_replay(orch: &PipelineOrchestrator) {
    let config = orch.config();
    let end = config.horizon.end_year;
    let events = orch
        .store()
        .events_in_range(orch.run_id(), config.horizon.start_year, end)
        .expect("events");
    for year in config.years() {
        let stored = orch.state_for_year(year).unwrap().expect("stored state");
        let replayed = replay_from_baseline(orch.census(), config, &events, year).expect("replay");
        assert_eq!(stored, replayed, "incremental state diverged from replay in {year}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn incremental_equals_full_replay(
        seed in any::<u64>(),
        headcount in 5usize..60,
        sql in any::<bool>(),
    ) {
        let engine = if sql { ComputeEngine::Sql } else { ComputeEngine::InMemory };
        let config = SimConfig::default_test()
            .with_seed(seed)
            .with_headcount(headcount)
            .with_engine(engine);
        let orch = run(config);
        check_against_replay(&orch);
    }

    #[test]
    fn engines_agree_year_by_year(seed in any::<u64>(), headcount in 5usize..60) {
        let mem = run(SimConfig::default_test().with_seed(seed).with_headcount(headcount));
        let sql = run(
            SimConfig::default_test()
                .with_seed(seed)
                .with_headcount(headcount)
                .with_engine(ComputeEngine::Sql),
        );
        for year in mem.config().years() {
            prop_assert_eq!(
                mem.state_for_year(year).unwrap(),
                sql.state_for_year(year).unwrap(),
                "engines disagree in {}", year
            );
        }
    }
}

#[test]
fn parallel_derivation_equals_replay() {
    let orch = run(SimConfig::default_test().with_headcount(600).with_threads(4));
    check_against_replay(&orch);
}
