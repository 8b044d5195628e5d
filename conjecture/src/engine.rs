//! The runner: drives a test function through reuse, generation, targeting
//! and shrinking.
//!
//! Every execution goes through a single `test_function` step, which
//! records the draws in the choice tree, caches the result, updates the
//! Pareto front and target bests, and keeps the smallest reproduction for
//! each interesting origin. Stopping conditions are checked after every
//! execution and unwind the current phase as [`Halt::Complete`].

use std::any::Any;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Once};
use std::time::Instant;

use log::{debug, trace, warn};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::cache::{GenericCache, LruReused};
use crate::config::{Phase, RunnerSettings};
use crate::data::{ConjectureData, ConjectureResult, InterestingOrigin, Status};
use crate::database::ExampleDatabase;
use crate::datatree::DataTree;
use crate::error::{ConjectureError, DataError, DrawResult};
use crate::optimiser::{Optimiser, OptimiserEngine};
use crate::pareto::ParetoFront;
use crate::rng::{create_rng, create_seeded_rng};
use crate::shrinker::{TestCaseExecutor, TestCaseShrinker};
use crate::source::{ByteSource, GenerationParameters};
use crate::statistics::RunStatistics;
use crate::utils::sort_key;

/// Calls made after the first bug before generation may stop
const MIN_TEST_CALLS: usize = 10;

/// Novel-prefix attempts before mutation starts
const MUTATION_WARMUP: usize = 10;

/// Valid examples kept as starting points for mutation
const MUTATION_POOL_SIZE: usize = 64;

/// Fresh bytes appended to each mutated buffer
const MUTATION_PADDING: usize = 64;

const SECONDARY_SUFFIX: &str = ".secondary";
const PARETO_SUFFIX: &str = ".pareto";

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    /// Enough valid examples were generated
    MaxExamples,
    /// The test function was called too many times without enough valid examples
    MaxIterations,
    /// The shrink budget ran out
    MaxShrinks,
    /// Every phase ran to completion, or the choice tree was exhausted
    Finished,
    /// The wall-clock budget ran out
    Timeout,
    /// An interesting example stopped reproducing
    Flaky,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            ExitReason::MaxExamples => "settings.max_examples",
            ExitReason::MaxIterations => "settings.max_iterations",
            ExitReason::MaxShrinks => "shrink limit",
            ExitReason::Finished => "nothing left to do",
            ExitReason::Timeout => "timeout",
            ExitReason::Flaky => "test was flaky",
        };
        f.write_str(description)
    }
}

/// Interrupts the phase loop
#[derive(Debug)]
pub enum Halt {
    /// The run is over for a normal reason
    Complete(ExitReason),
    /// The run failed
    Error(ConjectureError),
}

impl From<ConjectureError> for Halt {
    fn from(err: ConjectureError) -> Self {
        Halt::Error(err)
    }
}

/// Everything a finished run reports
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Smallest known reproduction for each interesting origin
    pub interesting_examples: BTreeMap<Option<InterestingOrigin>, ConjectureResult>,
    pub exit_reason: ExitReason,
    pub call_count: usize,
    pub valid_examples: usize,
    pub invalid_examples: usize,
    pub overrun_examples: usize,
    pub shrinks: usize,
    /// Highest score observed for each target label
    pub best_observed_targets: BTreeMap<String, f64>,
    /// Final Pareto front in shortlex order
    pub pareto_front: Vec<ConjectureResult>,
    pub statistics: RunStatistics,
}

impl RunOutcome {
    /// True if no interesting example was found
    pub fn passed(&self) -> bool {
        self.interesting_examples.is_empty()
    }

    /// The shortlex-smallest interesting example across all origins
    pub fn smallest_interesting(&self) -> Option<&ConjectureResult> {
        self.interesting_examples
            .values()
            .min_by(|a, b| sort_key(&a.buffer).cmp(&sort_key(&b.buffer)))
    }
}

thread_local! {
    static QUIET_PANICS: Cell<bool> = const { Cell::new(false) };
}

static QUIET_PANIC_HOOK: Once = Once::new();

/// Wrap the panic hook so that it stays silent on a thread that is inside a
/// test function. Panics there are caught and reported as interesting.
fn install_quiet_panic_hook() {
    QUIET_PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !QUIET_PANICS.with(Cell::get) {
                previous(info);
            }
        }));
    });
}

/// Whether panics on this thread currently bypass the panic hook
pub(crate) fn panics_are_quiet() -> bool {
    QUIET_PANICS.with(Cell::get)
}

/// Run `f` with the panic hook silenced on this thread
fn catch_quietly<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    install_quiet_panic_hook();
    let outer = QUIET_PANICS.with(|quiet| quiet.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    QUIET_PANICS.with(|quiet| quiet.set(outer));
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Copy the bytes of one example over a disjoint example of the same length
fn duplicate_span(random: &mut StdRng, origin: &ConjectureResult, buffer: &mut [u8]) -> bool {
    let mut by_length: BTreeMap<usize, BTreeSet<(usize, usize)>> = BTreeMap::new();
    for ex in origin.examples.iter().filter(|ex| !ex.is_empty()) {
        by_length.entry(ex.len()).or_default().insert((ex.start, ex.end));
    }
    let groups: Vec<Vec<(usize, usize)>> = by_length
        .into_values()
        .filter(|spans| spans.len() > 1)
        .map(|spans| spans.into_iter().collect())
        .collect();
    let Some(spans) = groups.choose(random) else {
        return false;
    };
    let picked: Vec<&(usize, usize)> = spans.choose_multiple(random, 2).collect();
    let (&(from, from_end), &(to, _)) = (picked[0], picked[1]);
    buffer.copy_within(from..from_end, to);
    true
}

/// Flip one bit of a randomly chosen unforced block
fn flip_bit(random: &mut StdRng, origin: &ConjectureResult, buffer: &mut [u8]) {
    let blocks: Vec<_> = origin
        .blocks
        .iter()
        .filter(|block| !block.forced && !block.is_empty())
        .collect();
    if let Some(block) = blocks.choose(random) {
        let i = random.gen_range(block.start..block.end);
        buffer[i] ^= 1u8 << random.gen_range(0..8u32);
    }
}

/// Runs a test function against generated and replayed byte buffers.
///
/// A runner is single-threaded and owns its choice tree and cache. Use
/// [`run_sharded`](crate::parallel::run_sharded) to spread work over threads.
pub struct ConjectureRunner<F> {
    test: F,
    settings: RunnerSettings,
    random: StdRng,
    tree: DataTree,
    cache: GenericCache<Vec<u8>, Rc<ConjectureResult>, LruReused>,
    overrun: Rc<ConjectureResult>,
    database: Option<Arc<dyn ExampleDatabase>>,
    interesting_examples: BTreeMap<Option<InterestingOrigin>, Rc<ConjectureResult>>,
    shrunk_examples: HashSet<Option<InterestingOrigin>>,
    pareto_front: ParetoFront,
    best_observed_targets: BTreeMap<String, f64>,
    best_examples_of_observed_targets: BTreeMap<String, Rc<ConjectureResult>>,
    call_count: usize,
    valid_examples: usize,
    invalid_examples: usize,
    overrun_examples: usize,
    shrinks: usize,
    first_bug_found_at: Option<usize>,
    last_bug_found_at: Option<usize>,
    statistics: RunStatistics,
    current_phase: Phase,
    phase_started: Instant,
    start_time: Instant,
}

impl<F> fmt::Debug for ConjectureRunner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConjectureRunner")
            .field("settings", &self.settings)
            .field("call_count", &self.call_count)
            .field("interesting_examples", &self.interesting_examples.len())
            .finish()
    }
}

impl<F> ConjectureRunner<F>
where
    F: FnMut(&mut ConjectureData<'_>) -> DrawResult<()>,
{
    /// Create a runner after validating `settings`
    pub fn new(settings: RunnerSettings, test: F) -> Result<Self, ConjectureError> {
        settings.validate()?;
        let cache = GenericCache::new(settings.cache_size, LruReused::default())?;
        let now = Instant::now();
        Ok(Self {
            test,
            random: create_rng(settings.seed),
            settings,
            tree: DataTree::new(),
            cache,
            overrun: Rc::new(ConjectureResult::overrun()),
            database: None,
            interesting_examples: BTreeMap::new(),
            shrunk_examples: HashSet::new(),
            pareto_front: ParetoFront::new(),
            best_observed_targets: BTreeMap::new(),
            best_examples_of_observed_targets: BTreeMap::new(),
            call_count: 0,
            valid_examples: 0,
            invalid_examples: 0,
            overrun_examples: 0,
            shrinks: 0,
            first_bug_found_at: None,
            last_bug_found_at: None,
            statistics: RunStatistics::default(),
            current_phase: Phase::Reuse,
            phase_started: now,
            start_time: now,
        })
    }

    /// Persist examples in `database` under `settings.database_key`
    pub fn with_database(mut self, database: Arc<dyn ExampleDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn tree(&self) -> &DataTree {
        &self.tree
    }

    pub fn call_count(&self) -> usize {
        self.call_count
    }

    pub fn valid_examples(&self) -> usize {
        self.valid_examples
    }

    pub fn shrinks(&self) -> usize {
        self.shrinks
    }

    pub fn interesting_examples(
        &self,
    ) -> &BTreeMap<Option<InterestingOrigin>, Rc<ConjectureResult>> {
        &self.interesting_examples
    }

    pub fn best_observed_targets(&self) -> &BTreeMap<String, f64> {
        &self.best_observed_targets
    }

    pub fn pareto_front(&self) -> &ParetoFront {
        &self.pareto_front
    }

    /// Run every enabled phase and report what was found
    pub fn run(&mut self) -> Result<RunOutcome, ConjectureError> {
        self.start_time = Instant::now();
        self.phase_started = self.start_time;
        let exit_reason = match self.run_phases() {
            Ok(()) => ExitReason::Finished,
            Err(Halt::Complete(reason)) => reason,
            Err(Halt::Error(err)) => {
                self.finish_phase();
                return Err(err);
            }
        };
        self.finish_phase();
        debug!(
            "Run finished after {} calls ({} valid, {} invalid, {} overrun): {}",
            self.call_count,
            self.valid_examples,
            self.invalid_examples,
            self.overrun_examples,
            exit_reason
        );
        Ok(self.outcome(exit_reason))
    }

    fn run_phases(&mut self) -> Result<(), Halt> {
        self.reuse_existing_examples()?;
        self.generate_new_examples()?;
        // Targeting normally happens during generation
        if !self.settings.has_phase(Phase::Generate) {
            self.optimise_targets()?;
        }
        self.shrink_interesting_examples()
    }

    fn outcome(&self, exit_reason: ExitReason) -> RunOutcome {
        let mut interesting_examples: BTreeMap<_, _> = self
            .interesting_examples
            .iter()
            .map(|(origin, result)| (origin.clone(), ConjectureResult::clone(result)))
            .collect();
        if !self.settings.report_multiple_bugs
            && let Some((origin, smallest)) = self
                .interesting_examples
                .iter()
                .min_by(|a, b| sort_key(&a.1.buffer).cmp(&sort_key(&b.1.buffer)))
        {
            interesting_examples =
                BTreeMap::from([(origin.clone(), ConjectureResult::clone(smallest))]);
        }
        let mut statistics = self.statistics.clone();
        statistics.shrinks = self.shrinks;
        RunOutcome {
            interesting_examples,
            exit_reason,
            call_count: self.call_count,
            valid_examples: self.valid_examples,
            invalid_examples: self.invalid_examples,
            overrun_examples: self.overrun_examples,
            shrinks: self.shrinks,
            best_observed_targets: self.best_observed_targets.clone(),
            pareto_front: self
                .pareto_front
                .iter()
                .map(|result| ConjectureResult::clone(result))
                .collect(),
            statistics,
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        self.finish_phase();
        if phase != self.current_phase {
            debug!("Entering {:?} phase after {} calls", phase, self.call_count);
        }
        self.current_phase = phase;
    }

    fn finish_phase(&mut self) {
        let now = Instant::now();
        self.statistics.phase_mut(self.current_phase).duration += now - self.phase_started;
        self.phase_started = now;
    }

    /// Run the test function once on bytes from `source`.
    ///
    /// Drawing goes through the choice tree, so inconsistent generation
    /// surfaces here as a flaky error.
    fn execute(&mut self, source: ByteSource) -> Result<ConjectureResult, ConjectureError> {
        let observer = self.tree.new_observer();
        let mut data = ConjectureData::new(source, Box::new(observer))
            .with_max_depth(self.settings.max_depth)
            .with_integer_range_bias(self.settings.integer_range_bias.clone());
        let testcounter = data.testcounter();

        let test = &mut self.test;
        let outcome = match catch_quietly(|| test(&mut data)) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(&*payload);
                trace!("Test case {} panicked: {}", testcounter, message);
                let origin = InterestingOrigin::new(format!("panicked: {}", message));
                match data.mark_interesting(Some(origin)) {
                    Ok(never) => match never {},
                    Err(err) => Err(err),
                }
            }
        };
        match outcome {
            Ok(()) => data.freeze()?,
            Err(DataError::StopTest { testcounter: t }) if t == testcounter => {}
            Err(err) => return Err(err.into()),
        }
        Ok(data.as_result())
    }

    /// Execute the test, record everything learned, and check the stopping
    /// conditions
    fn test_function(&mut self, source: ByteSource) -> Result<Rc<ConjectureResult>, Halt> {
        let result = self.execute(source)?;
        self.call_count += 1;
        self.statistics
            .phase_mut(self.current_phase)
            .record(result.status);
        match result.status {
            Status::Valid => self.valid_examples += 1,
            Status::Invalid => self.invalid_examples += 1,
            Status::Overrun => self.overrun_examples += 1,
            Status::Interesting => {}
        }

        let result = if result.status == Status::Overrun {
            Rc::clone(&self.overrun)
        } else {
            let result = Rc::new(result);
            self.cache_result(result.buffer.clone(), Rc::clone(&result));
            result
        };

        if result.status >= Status::Valid {
            self.update_targets(&result);
            self.update_pareto_front(&result);
        }
        if result.status == Status::Interesting {
            self.record_interesting(&result);
        }
        self.check_limits()?;
        Ok(result)
    }

    fn check_limits(&self) -> Result<(), Halt> {
        if self.shrinks >= self.settings.max_shrinks {
            return Err(Halt::Complete(ExitReason::MaxShrinks));
        }
        if let Some(timeout) = self.settings.timeout
            && self.start_time.elapsed() >= timeout
        {
            return Err(Halt::Complete(ExitReason::Timeout));
        }
        if self.interesting_examples.is_empty() {
            if self.valid_examples >= self.settings.max_examples {
                return Err(Halt::Complete(ExitReason::MaxExamples));
            }
            if self.call_count >= self.settings.max_iterations {
                return Err(Halt::Complete(ExitReason::MaxIterations));
            }
        }
        Ok(())
    }

    fn cache_result(&mut self, key: Vec<u8>, result: Rc<ConjectureResult>) {
        if let Err(err) = self.cache.insert(key, result) {
            trace!("Result not cached: {}", err);
        }
    }

    /// Result of running the test on `buffer`, without re-running it if
    /// this buffer or its behaviour has been seen before.
    ///
    /// The same buffer returns the same shared result while it stays cached.
    pub fn cached_test_function(&mut self, buffer: &[u8]) -> Result<Rc<ConjectureResult>, Halt> {
        let buffer = &buffer[..buffer.len().min(self.settings.buffer_size)];
        let key = buffer.to_vec();
        if let Some(result) = self.cache.get(&key) {
            let result = Rc::clone(result);
            self.statistics.phase_mut(self.current_phase).cache_hits += 1;
            return Ok(result);
        }

        let mut data = ConjectureData::for_buffer(buffer);
        if let Ok(()) = self.tree.simulate_test_function(&mut data) {
            let known = if data.status() == Status::Overrun {
                Some(Rc::clone(&self.overrun))
            } else {
                self.cache.get(&data.buffer().to_vec()).cloned()
            };
            if let Some(result) = known {
                self.statistics.phase_mut(self.current_phase).cache_hits += 1;
                self.cache_result(key, Rc::clone(&result));
                return Ok(result);
            }
        }

        let result = self.test_function(ByteSource::for_buffer(buffer))?;
        self.cache_result(key, Rc::clone(&result));
        Ok(result)
    }

    fn update_targets(&mut self, result: &Rc<ConjectureResult>) {
        for (label, &score) in &result.target_observations {
            let best = self.best_observed_targets.entry(label.clone()).or_insert(score);
            *best = best.max(score);
            let improved = self
                .best_examples_of_observed_targets
                .get(label)
                .is_none_or(|existing| existing.target_observations[label] < score);
            if improved {
                self.best_examples_of_observed_targets
                    .insert(label.clone(), Rc::clone(result));
            }
        }
    }

    fn update_pareto_front(&mut self, result: &Rc<ConjectureResult>) {
        if let Some(evicted) = self.pareto_front.add(Rc::clone(result)) {
            self.db_save(PARETO_SUFFIX, &result.buffer);
            for old in evicted {
                self.db_delete(PARETO_SUFFIX, &old.buffer);
            }
        }
    }

    /// Keep `result` if it is the first or the smallest reproduction of its origin
    fn record_interesting(&mut self, result: &Rc<ConjectureResult>) {
        let origin = result.interesting_origin.clone();
        self.last_bug_found_at = Some(self.call_count);
        if self.first_bug_found_at.is_none() {
            self.first_bug_found_at = Some(self.call_count);
        }

        match self.interesting_examples.get(&origin) {
            None => {
                debug!(
                    "Found new interesting origin {:?} after {} calls",
                    origin, self.call_count
                );
            }
            Some(existing) if sort_key(&result.buffer) < sort_key(&existing.buffer) => {
                let existing = Rc::clone(existing);
                self.shrinks += 1;
                trace!(
                    "Shrunk {:?} from {} to {} bytes",
                    origin,
                    existing.buffer.len(),
                    result.buffer.len()
                );
                self.db_move("", SECONDARY_SUFFIX, &existing.buffer);
                if self.cache.is_pinned(&existing.buffer) {
                    let _ = self.cache.unpin(&existing.buffer);
                }
                self.shrunk_examples.remove(&origin);
            }
            Some(_) => return,
        }
        self.db_save("", &result.buffer);
        if let Err(err) = self.cache.pin(result.buffer.clone(), Rc::clone(result)) {
            trace!("Interesting result not pinned: {}", err);
        }
        self.interesting_examples.insert(origin, Rc::clone(result));
    }

    fn db_key(&self, suffix: &str) -> Option<(&dyn ExampleDatabase, Vec<u8>)> {
        let database = self.database.as_deref()?;
        let mut key = self.settings.database_key.clone()?;
        key.extend_from_slice(suffix.as_bytes());
        Some((database, key))
    }

    fn db_fetch(&self, suffix: &str) -> Vec<Vec<u8>> {
        let Some((database, key)) = self.db_key(suffix) else {
            return Vec::new();
        };
        database.fetch(&key).unwrap_or_else(|err| {
            warn!("Failed to fetch examples from the database: {}", err);
            Vec::new()
        })
    }

    fn db_save(&self, suffix: &str, value: &[u8]) {
        if let Some((database, key)) = self.db_key(suffix)
            && let Err(err) = database.save(&key, value)
        {
            warn!("Failed to save an example to the database: {}", err);
        }
    }

    fn db_delete(&self, suffix: &str, value: &[u8]) {
        if let Some((database, key)) = self.db_key(suffix)
            && let Err(err) = database.delete(&key, value)
        {
            warn!("Failed to delete an example from the database: {}", err);
        }
    }

    fn db_move(&self, from: &str, to: &str, value: &[u8]) {
        if let (Some((database, src)), Some((_, dest))) = (self.db_key(from), self.db_key(to))
            && let Err(err) = database.move_value(&src, &dest, value)
        {
            warn!("Failed to move an example in the database: {}", err);
        }
    }

    fn sorted_by_shortlex(mut buffers: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        buffers.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        buffers
    }

    /// Replay saved examples, smallest first, and drop the stale ones
    fn reuse_existing_examples(&mut self) -> Result<(), Halt> {
        if !self.settings.has_phase(Phase::Reuse) || self.db_key("").is_none() {
            return Ok(());
        }
        self.enter_phase(Phase::Reuse);

        let mut corpus: Vec<(Vec<u8>, bool)> = Self::sorted_by_shortlex(self.db_fetch(""))
            .into_iter()
            .map(|buffer| (buffer, true))
            .collect();
        let desired = self.settings.max_examples.div_ceil(10).max(2);
        if corpus.len() < desired {
            let mut extra = self.db_fetch(SECONDARY_SUFFIX);
            let shortfall = desired - corpus.len();
            if extra.len() > shortfall {
                extra.shuffle(&mut self.random);
                extra.truncate(shortfall);
            }
            corpus.extend(
                Self::sorted_by_shortlex(extra)
                    .into_iter()
                    .map(|buffer| (buffer, false)),
            );
        }
        debug!("Reusing {} saved examples", corpus.len());

        for (existing, primary) in corpus {
            let result = self.cached_test_function(&existing)?;
            let kept = result.status == Status::Interesting
                && self
                    .interesting_examples
                    .get(&result.interesting_origin)
                    .is_some_and(|best| best.buffer == existing);
            if kept {
                continue;
            }
            if primary {
                self.db_move("", SECONDARY_SUFFIX, &existing);
            } else if result.status != Status::Interesting {
                self.db_delete(SECONDARY_SUFFIX, &existing);
            }
        }

        for existing in Self::sorted_by_shortlex(self.db_fetch(PARETO_SUFFIX)) {
            let result = self.cached_test_function(&existing)?;
            if result.buffer != existing || !self.pareto_front.contains(&existing) {
                self.db_delete(PARETO_SUFFIX, &existing);
            }
        }
        Ok(())
    }

    fn should_generate_more(&self) -> bool {
        if self.valid_examples >= self.settings.max_examples
            || self.call_count >= self.settings.max_iterations
        {
            return false;
        }
        let (Some(first), Some(last)) = (self.first_bug_found_at, self.last_bug_found_at) else {
            return true;
        };
        if !self.settings.report_multiple_bugs {
            return false;
        }
        // Keep looking for other bugs while new ones keep turning up
        self.call_count < MIN_TEST_CALLS || self.call_count < (first + 1000).min(last * 2)
    }

    fn new_parameters(&mut self) -> GenerationParameters {
        GenerationParameters::new(create_seeded_rng(self.random.r#gen()))
    }

    fn generate_new_examples(&mut self) -> Result<(), Halt> {
        if !self.settings.has_phase(Phase::Generate) {
            return Ok(());
        }
        self.enter_phase(Phase::Generate);

        let buffer_size = self.settings.buffer_size;
        let zero = self.cached_test_function(&vec![0u8; buffer_size])?;
        if zero.status == Status::Overrun {
            warn!("The all-zero example overruns the {} byte buffer", buffer_size);
        } else if zero.status == Status::Valid && zero.buffer.len() * 2 > buffer_size {
            warn!(
                "The smallest natural example takes {} of {} bytes, which leaves little room \
                 for generation and shrinking",
                zero.buffer.len(),
                buffer_size
            );
        }
        if self.tree.is_exhausted() {
            debug!("The all-zero example is the only possible test case");
            return Ok(());
        }

        let optimise_at = (self.settings.max_examples / 2).max(1);
        let mut ran_optimisations = false;
        let mut pool: Vec<Rc<ConjectureResult>> = Vec::new();
        let mut attempts = 0;
        while self.should_generate_more() {
            if self.tree.is_exhausted() {
                debug!("Choice tree exhausted after {} calls", self.call_count);
                break;
            }
            attempts += 1;
            let mutate =
                attempts > MUTATION_WARMUP && !pool.is_empty() && self.random.gen_bool(0.5);
            let result = if mutate {
                let origin = Rc::clone(&pool[self.random.gen_range(0..pool.len())]);
                let mutated = self.mutate(&origin);
                self.cached_test_function(&mutated)?
            } else {
                let prefix = self.tree.generate_novel_prefix(&mut self.random)?;
                let parameters = self.new_parameters();
                let source = ByteSource::generating(&prefix, buffer_size, parameters);
                self.test_function(source)?
            };

            if result.status == Status::Valid && !result.blocks.is_empty() {
                if pool.len() < MUTATION_POOL_SIZE {
                    pool.push(result);
                } else {
                    let i = self.random.gen_range(0..pool.len());
                    pool[i] = result;
                }
            }

            if !ran_optimisations && self.valid_examples >= optimise_at {
                ran_optimisations = true;
                self.optimise_targets()?;
                self.enter_phase(Phase::Generate);
            }
        }
        Ok(())
    }

    /// A copy of `origin` with one random change, followed by fresh bytes.
    ///
    /// The change copies an example over another of the same length, flips
    /// a bit of a block, or redraws everything from the last block on.
    fn mutate(&mut self, origin: &ConjectureResult) -> Vec<u8> {
        let mut buffer = origin.buffer.clone();
        match self.random.gen_range(0..4) {
            0 | 1 => {
                if !duplicate_span(&mut self.random, origin, &mut buffer) {
                    flip_bit(&mut self.random, origin, &mut buffer);
                }
            }
            2 => flip_bit(&mut self.random, origin, &mut buffer),
            _ => {
                if let Some(last) = origin.blocks.last() {
                    buffer.truncate(last.start);
                }
            }
        }
        let padding = (origin.buffer.len() + MUTATION_PADDING).saturating_sub(buffer.len());
        let mut parameters = self.new_parameters();
        buffer.extend(parameters.draw_bytes(padding));
        buffer
    }

    /// Hill-climb each observed target from its best example so far
    fn optimise_targets(&mut self) -> Result<(), Halt> {
        if !self.settings.has_phase(Phase::Target)
            || self.best_examples_of_observed_targets.is_empty()
        {
            return Ok(());
        }
        self.enter_phase(Phase::Target);
        let targets: Vec<String> = self.best_examples_of_observed_targets.keys().cloned().collect();
        for target in targets {
            let Some(initial) = self.best_examples_of_observed_targets.get(&target).cloned() else {
                continue;
            };
            let max_failures = self.settings.optimiser_max_failures;
            let mut optimiser = Optimiser::new(self, initial, target, max_failures);
            optimiser.run()?;
        }
        Ok(())
    }

    fn shrink_interesting_examples(&mut self) -> Result<(), Halt> {
        if !self.settings.has_phase(Phase::Shrink) || self.interesting_examples.is_empty() {
            return Ok(());
        }
        self.enter_phase(Phase::Shrink);

        let mut previous: Vec<Rc<ConjectureResult>> =
            self.interesting_examples.values().cloned().collect();
        previous.sort_by(|a, b| sort_key(&a.buffer).cmp(&sort_key(&b.buffer)));
        for example in previous {
            let replayed = self.test_function(ByteSource::for_buffer(&example.buffer))?;
            if replayed.status != Status::Interesting {
                warn!(
                    "Interesting example for {:?} did not reproduce, status was {}",
                    example.interesting_origin, replayed.status
                );
                return Err(Halt::Complete(ExitReason::Flaky));
            }
        }

        self.clear_secondary_key()?;

        if !self.settings.report_multiple_bugs {
            // Shrink only the smallest failure, letting it slip to any other bug
            let smallest = self
                .interesting_examples
                .values()
                .min_by(|a, b| sort_key(&a.buffer).cmp(&sort_key(&b.buffer)))
                .cloned();
            if let Some(target) = smallest {
                self.shrink(target, true)?;
            }
            return Ok(());
        }

        loop {
            let next = self
                .interesting_examples
                .iter()
                .filter(|(origin, _)| !self.shrunk_examples.contains(*origin))
                .min_by(|a, b| sort_key(&a.1.buffer).cmp(&sort_key(&b.1.buffer)))
                .map(|(origin, result)| (origin.clone(), Rc::clone(result)));
            let Some((origin, target)) = next else {
                return Ok(());
            };
            self.shrink(target, false)?;
            self.shrunk_examples.insert(origin);
        }
    }

    /// Replay secondary entries no larger than the worst primary example.
    ///
    /// Each one either becomes a primary example or is no longer needed.
    fn clear_secondary_key(&mut self) -> Result<(), Halt> {
        for candidate in Self::sorted_by_shortlex(self.db_fetch(SECONDARY_SUFFIX)) {
            let cap = self
                .interesting_examples
                .values()
                .map(|result| &result.buffer)
                .max_by(|a, b| sort_key(a).cmp(&sort_key(b)));
            match cap {
                Some(cap) if sort_key(&candidate) <= sort_key(cap) => {}
                _ => break,
            }
            self.cached_test_function(&candidate)?;
            self.db_delete(SECONDARY_SUFFIX, &candidate);
        }
        Ok(())
    }

    fn shrink(&mut self, target: Rc<ConjectureResult>, any_origin: bool) -> Result<(), Halt> {
        let origin = target.interesting_origin.clone();
        debug!("Shrinking {:?} from {} bytes", origin, target.buffer.len());
        let predicate = move |result: &ConjectureResult| {
            result.status == Status::Interesting
                && (any_origin || result.interesting_origin == origin)
        };
        let random = create_seeded_rng(self.random.r#gen());
        let settings = self.settings.shrink.clone();
        let mut shrinker = TestCaseShrinker::new(self, target, predicate, settings, random);
        let outcome = shrinker.shrink();
        debug!(
            "Shrinker made {} changes in {} calls, final size {} bytes",
            shrinker.changes(),
            shrinker.calls(),
            shrinker.shrink_target().buffer.len()
        );
        outcome
    }
}

impl<F> TestCaseExecutor for ConjectureRunner<F>
where
    F: FnMut(&mut ConjectureData<'_>) -> DrawResult<()>,
{
    type Error = Halt;

    fn cached_test_function(&mut self, buffer: &[u8]) -> Result<Rc<ConjectureResult>, Halt> {
        ConjectureRunner::cached_test_function(self, buffer)
    }
}

impl<F> OptimiserEngine for ConjectureRunner<F>
where
    F: FnMut(&mut ConjectureData<'_>) -> DrawResult<()>,
{
    type Error = Halt;

    fn random(&mut self) -> &mut StdRng {
        &mut self.random
    }

    fn cached_test_function(&mut self, buffer: &[u8]) -> Result<Rc<ConjectureResult>, Halt> {
        ConjectureRunner::cached_test_function(self, buffer)
    }

    fn test_novel_extension(
        &mut self,
        prefix: &[u8],
        parameters: GenerationParameters,
    ) -> Result<Option<Rc<ConjectureResult>>, Halt> {
        // A prefix that already determines the outcome has nothing to explore
        match self.tree.rewrite(prefix) {
            (_, Some(status)) if status != Status::Overrun => return Ok(None),
            _ => {}
        }
        let source = ByteSource::generating(prefix, self.settings.buffer_size, parameters);
        self.test_function(source).map(Some)
    }
}
