//! End-to-end runs of the engine against small test functions

use std::sync::Arc;

use conjecture::{
    ConjectureData, ConjectureRunner, DirectoryBasedExampleDatabase, DrawResult, ExampleDatabase,
    ExitReason, ParallelSettings, Phase, RunnerSettings, run_sharded,
};

fn large_sum(data: &mut ConjectureData) -> DrawResult<()> {
    let a = data.draw_bits(8, None)?;
    let b = data.draw_bits(8, None)?;
    if a + b > 300 {
        match data.mark_interesting(None)? {}
    }
    Ok(())
}

fn large_word(data: &mut ConjectureData) -> DrawResult<()> {
    let n = data.draw_bits(16, None)?;
    if n >= 1000 {
        match data.mark_interesting(None)? {}
    }
    Ok(())
}

fn two_pairs_of_bits(data: &mut ConjectureData) -> DrawResult<()> {
    data.draw_bits(2, None)?;
    data.draw_bits(2, None)?;
    Ok(())
}

fn targeted_byte(data: &mut ConjectureData) -> DrawResult<()> {
    let n = data.draw_bits(8, None)?;
    data.target("n", n as f64)
}

fn always_passes(data: &mut ConjectureData) -> DrawResult<()> {
    data.draw_bytes(4)?;
    Ok(())
}

#[test]
fn test_sum_is_shrunk_to_boundary() {
    let settings = RunnerSettings::default().with_seed(2);
    let mut runner = ConjectureRunner::new(settings, large_sum).unwrap();
    let outcome = runner.run().unwrap();

    let example = outcome.smallest_interesting().unwrap();
    assert_eq!(example.buffer.len(), 2);
    let sum = example.buffer[0] as u64 + example.buffer[1] as u64;
    assert_eq!(sum, 301);
    assert!(outcome.shrinks > 0);
}

#[test]
fn test_passing_run_stops_at_max_examples() {
    let settings = RunnerSettings::default().with_seed(4).with_max_examples(30);
    let mut runner = ConjectureRunner::new(settings, always_passes).unwrap();
    let outcome = runner.run().unwrap();
    assert!(outcome.passed());
    assert_eq!(outcome.exit_reason, ExitReason::MaxExamples);
    assert_eq!(outcome.valid_examples, 30);
    assert_eq!(outcome.statistics.total_test_cases(), outcome.call_count);
}

#[test]
fn test_small_search_space_is_exhausted() {
    let settings = RunnerSettings::default().with_seed(5);
    let mut runner = ConjectureRunner::new(settings, two_pairs_of_bits).unwrap();
    let outcome = runner.run().unwrap();
    assert_eq!(outcome.exit_reason, ExitReason::Finished);
    assert_eq!(outcome.valid_examples, 16);
    assert!(runner.tree().is_exhausted());
}

#[test]
fn test_directory_database_replays_failure() {
    let dir = tempfile::tempdir().unwrap();
    let settings = RunnerSettings::default()
        .with_seed(6)
        .with_database_key(b"scenario".to_vec());

    let db = Arc::new(DirectoryBasedExampleDatabase::new(dir.path()).unwrap());
    let mut runner = ConjectureRunner::new(settings.clone(), large_word)
        .unwrap()
        .with_database(db.clone());
    let outcome = runner.run().unwrap();
    let best = outcome.smallest_interesting().unwrap().buffer.clone();
    assert_eq!(best, vec![0x03, 0xE8]);
    assert_eq!(db.fetch(b"scenario").unwrap(), vec![best.clone()]);

    let reopened = Arc::new(DirectoryBasedExampleDatabase::new(dir.path()).unwrap());
    let mut runner = ConjectureRunner::new(settings.with_phases(vec![Phase::Reuse]), large_word)
        .unwrap()
        .with_database(reopened);
    let outcome = runner.run().unwrap();
    assert_eq!(outcome.smallest_interesting().unwrap().buffer, best);
    assert_eq!(outcome.statistics.generate.test_cases, 0);
}

#[test]
fn test_targets_reach_high_scores() {
    let settings = RunnerSettings::default()
        .with_seed(8)
        .with_phases(vec![Phase::Generate, Phase::Target]);
    let mut runner = ConjectureRunner::new(settings, targeted_byte).unwrap();
    let outcome = runner.run().unwrap();
    assert!(outcome.passed());
    assert!(outcome.best_observed_targets["n"] >= 200.0);
    assert!(
        outcome
            .pareto_front
            .iter()
            .any(|result| result.target_observations["n"] == outcome.best_observed_targets["n"])
    );
}

#[test]
fn test_sharded_run_matches_single_runner_result() {
    let settings = RunnerSettings::default().with_seed(9);
    let parallel = ParallelSettings {
        num_shards: 2,
        enabled: true,
    };
    let outcome = run_sharded(&settings, &parallel, |_| large_word).unwrap();
    assert_eq!(outcome.smallest_interesting().unwrap().buffer, vec![0x03, 0xE8]);
}
