//! Sharded runs on scoped threads.
//!
//! Runners are single-threaded, so parallelism comes from running several
//! independent runners, each with its own seed, choice tree and cache, and
//! merging what they found afterwards.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;
use rand::Rng;

use crate::config::{ParallelSettings, RunnerSettings};
use crate::data::{ConjectureData, ConjectureResult};
use crate::engine::{ConjectureRunner, ExitReason, RunOutcome};
use crate::error::{ConjectureError, DrawResult};
use crate::pareto::ParetoFront;
use crate::rng::{create_rng, shard_seed};
use crate::utils::sort_key;

/// Settings for shard `shard` of `shards`. The example and iteration
/// budgets are split between shards.
fn shard_settings(
    settings: &RunnerSettings,
    seed: u64,
    shard: usize,
    shards: usize,
) -> RunnerSettings {
    let max_examples = settings.max_examples.div_ceil(shards);
    RunnerSettings {
        max_examples,
        max_iterations: settings.max_iterations.div_ceil(shards).max(max_examples),
        seed: Some(shard_seed(seed, shard)),
        ..settings.clone()
    }
}

/// Run `make_test(shard)` on independent runners and merge the outcomes.
///
/// With parallelism disabled, or a single shard, this is the same as one
/// runner with `settings`. Each shard builds its own test function on its
/// own thread, so the test does not need to be `Send`.
pub fn run_sharded<M, F>(
    settings: &RunnerSettings,
    parallel: &ParallelSettings,
    make_test: M,
) -> Result<RunOutcome, ConjectureError>
where
    M: Fn(usize) -> F + Sync,
    F: FnMut(&mut ConjectureData<'_>) -> DrawResult<()>,
{
    settings.validate()?;
    let shards = if parallel.enabled {
        parallel.num_shards.max(1)
    } else {
        1
    };
    if shards == 1 {
        return ConjectureRunner::new(settings.clone(), make_test(0))?.run();
    }

    let seed = settings
        .seed
        .unwrap_or_else(|| create_rng(None).r#gen::<u64>());
    debug!("Running {} shards from seed {}", shards, seed);

    let make_test = &make_test;
    let results = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..shards)
            .map(|shard| {
                let settings = shard_settings(settings, seed, shard, shards);
                s.spawn(move |_| -> Result<RunOutcome, ConjectureError> {
                    ConjectureRunner::new(settings, make_test(shard))?.run()
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(ConjectureError::internal("shard thread panicked")))
            })
            .collect::<Vec<_>>()
    })
    .map_err(|_| ConjectureError::internal("shard thread panicked"))?;

    let outcomes = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    Ok(merge_outcomes(outcomes))
}

/// Combine shard outcomes, keeping the smallest reproduction per origin.
///
/// The exit reason is `Flaky` if any shard was flaky, otherwise that of the
/// first shard.
pub fn merge_outcomes(outcomes: Vec<RunOutcome>) -> RunOutcome {
    let mut outcomes = outcomes.into_iter();
    let Some(mut merged) = outcomes.next() else {
        return RunOutcome {
            interesting_examples: BTreeMap::new(),
            exit_reason: ExitReason::Finished,
            call_count: 0,
            valid_examples: 0,
            invalid_examples: 0,
            overrun_examples: 0,
            shrinks: 0,
            best_observed_targets: BTreeMap::new(),
            pareto_front: Vec::new(),
            statistics: Default::default(),
        };
    };

    let mut front = ParetoFront::new();
    for result in merged.pareto_front.drain(..) {
        front.add(Rc::new(result));
    }

    for outcome in outcomes {
        if outcome.exit_reason == ExitReason::Flaky {
            merged.exit_reason = ExitReason::Flaky;
        }
        merged.call_count += outcome.call_count;
        merged.valid_examples += outcome.valid_examples;
        merged.invalid_examples += outcome.invalid_examples;
        merged.overrun_examples += outcome.overrun_examples;
        merged.shrinks += outcome.shrinks;
        merged.statistics.merge(&outcome.statistics);

        for (label, score) in outcome.best_observed_targets {
            let best = merged.best_observed_targets.entry(label).or_insert(score);
            *best = best.max(score);
        }
        for (origin, result) in outcome.interesting_examples {
            match merged.interesting_examples.get(&origin) {
                Some(existing) if sort_key(&existing.buffer) <= sort_key(&result.buffer) => {}
                _ => {
                    merged.interesting_examples.insert(origin, result);
                }
            }
        }
        for result in outcome.pareto_front {
            front.add(Rc::new(result));
        }
    }

    merged.pareto_front = front
        .iter()
        .map(|result| ConjectureResult::clone(result))
        .collect();
    merged
}
