//! Shrinking a whole test case while it stays interesting.
//!
//! [`TestCaseShrinker`] repeatedly runs a fixed list of passes over the
//! examples and blocks of its current target, each pass proposing smaller
//! buffers to the executor. It stops when a full round of passes changes
//! nothing or its budget runs out. The best buffer found so far is kept in
//! the shrink target at every point, so an interrupted shrink loses nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use log::{debug, trace};
use rand::Rng;
use rand::rngs::StdRng;

use crate::config::ShrinkSettings;
use crate::data::{ConjectureResult, Status};
use crate::rng::create_seeded_rng;
use crate::shrinking::{Integer, Length, Minimizer, shrink_towards};
use crate::utils::{int_from_bytes, int_to_bytes, replace_all, sort_key, try_find_integer};

/// Runs buffers through the test function, with caching.
pub trait TestCaseExecutor {
    type Error;

    /// Result of running the test on `buffer`. Repeated calls with the same
    /// buffer should return the same result.
    fn cached_test_function(&mut self, buffer: &[u8]) -> Result<Rc<ConjectureResult>, Self::Error>;
}

/// Why a pass stopped early
#[derive(Debug)]
pub enum ShrinkInterrupt<E> {
    /// The call or time budget of this shrinker is used up
    BudgetExhausted,
    /// The executor refused to continue
    Halted(E),
}

/// The passes run in each round, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShrinkPass {
    RemoveDiscarded,
    AdaptiveExampleDeletion,
    ZeroExamples,
    MinimizeDuplicatedBlocks,
    MinimizeIndividualBlocks,
    LowerBlocksShifted,
    LowerCommonBlockOffset,
    ExampleDeletionWithBlockLowering,
    PassToDescendant,
    ReorderExamples,
    AlphabetMinimize,
}

impl ShrinkPass {
    pub const ALL: [ShrinkPass; 11] = [
        ShrinkPass::RemoveDiscarded,
        ShrinkPass::AdaptiveExampleDeletion,
        ShrinkPass::ZeroExamples,
        ShrinkPass::MinimizeDuplicatedBlocks,
        ShrinkPass::MinimizeIndividualBlocks,
        ShrinkPass::LowerBlocksShifted,
        ShrinkPass::LowerCommonBlockOffset,
        ShrinkPass::ExampleDeletionWithBlockLowering,
        ShrinkPass::PassToDescendant,
        ShrinkPass::ReorderExamples,
        ShrinkPass::AlphabetMinimize,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShrinkPass::RemoveDiscarded => "remove_discarded",
            ShrinkPass::AdaptiveExampleDeletion => "adaptive_example_deletion",
            ShrinkPass::ZeroExamples => "zero_examples",
            ShrinkPass::MinimizeDuplicatedBlocks => "minimize_duplicated_blocks",
            ShrinkPass::MinimizeIndividualBlocks => "minimize_individual_blocks",
            ShrinkPass::LowerBlocksShifted => "lower_blocks_shifted",
            ShrinkPass::LowerCommonBlockOffset => "lower_common_block_offset",
            ShrinkPass::ExampleDeletionWithBlockLowering => "example_deletion_with_block_lowering",
            ShrinkPass::PassToDescendant => "pass_to_descendant",
            ShrinkPass::ReorderExamples => "reorder_examples",
            ShrinkPass::AlphabetMinimize => "alphabet_minimize",
        }
    }
}

impl fmt::Display for ShrinkPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type PassResult<E> = Result<(), ShrinkInterrupt<E>>;

/// Shrinks one interesting test case.
///
/// `predicate` decides whether a result is still an acceptable replacement,
/// usually "interesting with the same origin". Only shortlex-smaller
/// buffers are ever proposed.
pub struct TestCaseShrinker<'e, X, P> {
    executor: &'e mut X,
    predicate: P,
    shrink_target: Rc<ConjectureResult>,
    settings: ShrinkSettings,
    random: StdRng,
    calls: usize,
    changes: usize,
    /// Blocks whose bytes changed while the block layout stayed the same
    changed_blocks: BTreeSet<usize>,
    started: Instant,
}

impl<'e, X, P> TestCaseShrinker<'e, X, P>
where
    X: TestCaseExecutor,
    P: FnMut(&ConjectureResult) -> bool,
{
    pub fn new(
        executor: &'e mut X,
        initial: Rc<ConjectureResult>,
        predicate: P,
        settings: ShrinkSettings,
        random: StdRng,
    ) -> Self {
        Self {
            executor,
            predicate,
            shrink_target: initial,
            settings,
            random,
            calls: 0,
            changes: 0,
            changed_blocks: BTreeSet::new(),
            started: Instant::now(),
        }
    }

    /// Best result found so far
    pub fn shrink_target(&self) -> &Rc<ConjectureResult> {
        &self.shrink_target
    }

    /// Test function calls requested by this shrinker
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Number of times the shrink target was replaced
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Run passes until a round makes no progress or the budget runs out.
    ///
    /// Only an executor halt is reported as an error. Running out of budget
    /// is a normal way to finish.
    pub fn shrink(&mut self) -> Result<(), X::Error> {
        match self.greedy_shrink() {
            Ok(()) => Ok(()),
            Err(ShrinkInterrupt::BudgetExhausted) => {
                debug!(
                    "Shrink budget exhausted after {} calls and {} changes",
                    self.calls, self.changes
                );
                Ok(())
            }
            Err(ShrinkInterrupt::Halted(err)) => Err(err),
        }
    }

    fn greedy_shrink(&mut self) -> PassResult<X::Error> {
        let mut prev = None;
        while prev != Some(self.changes) {
            prev = Some(self.changes);
            for pass in ShrinkPass::ALL {
                let (calls, changes) = (self.calls, self.changes);
                self.run_pass(pass)?;
                if self.changes > changes {
                    trace!(
                        "{} made {} changes in {} calls, buffer now {} bytes",
                        pass,
                        self.changes - changes,
                        self.calls - calls,
                        self.shrink_target.buffer.len()
                    );
                }
            }
        }
        Ok(())
    }

    /// Run a single pass once
    pub fn run_pass(&mut self, pass: ShrinkPass) -> PassResult<X::Error> {
        match pass {
            ShrinkPass::RemoveDiscarded => self.remove_discarded(),
            ShrinkPass::AdaptiveExampleDeletion => self.adaptive_example_deletion(),
            ShrinkPass::ZeroExamples => self.zero_examples(),
            ShrinkPass::MinimizeDuplicatedBlocks => self.minimize_duplicated_blocks(),
            ShrinkPass::MinimizeIndividualBlocks => self.minimize_individual_blocks(),
            ShrinkPass::LowerBlocksShifted => self.lower_blocks_shifted(),
            ShrinkPass::LowerCommonBlockOffset => self.lower_common_block_offset(),
            ShrinkPass::ExampleDeletionWithBlockLowering => {
                self.example_deletion_with_block_lowering()
            }
            ShrinkPass::PassToDescendant => self.pass_to_descendant(),
            ShrinkPass::ReorderExamples => self.reorder_examples(),
            ShrinkPass::AlphabetMinimize => self.alphabet_minimize(),
        }
    }

    fn check_budget(&self) -> PassResult<X::Error> {
        if self.calls >= self.settings.max_calls {
            return Err(ShrinkInterrupt::BudgetExhausted);
        }
        if let Some(timeout) = self.settings.timeout
            && self.started.elapsed() >= timeout
        {
            return Err(ShrinkInterrupt::BudgetExhausted);
        }
        Ok(())
    }

    /// Try `buffer` and adopt its result if it is acceptable and smaller.
    ///
    /// Returns whether the predicate accepted the result.
    pub fn consider_new_buffer(
        &mut self,
        buffer: &[u8],
    ) -> Result<bool, ShrinkInterrupt<X::Error>> {
        let current = &self.shrink_target.buffer;
        let buffer = &buffer[..buffer.len().min(current.len())];
        if buffer == current.as_slice() {
            return Ok(true);
        }
        if sort_key(buffer) >= sort_key(current) {
            return Ok(false);
        }
        let result = self.run_buffer(buffer)?;
        if !(self.predicate)(&result) {
            return Ok(false);
        }
        if sort_key(&result.buffer) < sort_key(&self.shrink_target.buffer) {
            self.update_shrink_target(result);
        }
        Ok(true)
    }

    /// Run `buffer` against the budget, whatever its size
    fn run_buffer(
        &mut self,
        buffer: &[u8],
    ) -> Result<Rc<ConjectureResult>, ShrinkInterrupt<X::Error>> {
        self.check_budget()?;
        self.calls += 1;
        self.executor
            .cached_test_function(buffer)
            .map_err(ShrinkInterrupt::Halted)
    }

    fn update_shrink_target(&mut self, result: Rc<ConjectureResult>) {
        let previous = std::mem::replace(&mut self.shrink_target, result);
        let current = &self.shrink_target;
        let same_layout = previous.blocks.len() == current.blocks.len()
            && previous
                .blocks
                .iter()
                .zip(&current.blocks)
                .all(|(a, b)| a.start == b.start && a.end == b.end);
        if same_layout {
            for (i, (a, b)) in previous.blocks.iter().zip(&current.blocks).enumerate() {
                if previous.block_bytes(a) != current.block_bytes(b) {
                    self.changed_blocks.insert(i);
                }
            }
        } else {
            self.changed_blocks.clear();
        }
        self.changes += 1;
    }

    /// Replace the bytes of the given blocks of the current target with `value`
    fn try_replace_blocks(
        &mut self,
        indices: &[usize],
        value: &[u8],
    ) -> Result<bool, ShrinkInterrupt<X::Error>> {
        let target = Rc::clone(&self.shrink_target);
        let mut replacements = Vec::with_capacity(indices.len());
        for &i in indices {
            match target.blocks.get(i) {
                Some(block) if block.len() == value.len() => {
                    replacements.push((block.start, block.end, value.to_vec()));
                }
                _ => return Ok(false),
            }
        }
        self.consider_new_buffer(&replace_all(&target.buffer, &replacements))
    }

    /// Delete every discarded example at once
    fn remove_discarded(&mut self) -> PassResult<X::Error> {
        while self.shrink_target.has_discards {
            let target = Rc::clone(&self.shrink_target);
            let mut deletions: Vec<(usize, usize, Vec<u8>)> = Vec::new();
            for ex in &target.examples {
                let disjoint = deletions.last().is_none_or(|(_, end, _)| ex.start >= *end);
                if ex.discarded && !ex.is_empty() && disjoint {
                    deletions.push((ex.start, ex.end, Vec::new()));
                }
            }
            if deletions.is_empty()
                || !self.consider_new_buffer(&replace_all(&target.buffer, &deletions))?
            {
                break;
            }
        }
        Ok(())
    }

    /// Delete single examples, runs of following siblings, and then any
    /// subset of the children of each example
    fn adaptive_example_deletion(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.examples.len() {
            let target = Rc::clone(&self.shrink_target);
            let ex = &target.examples[i];
            if ex.is_empty() {
                i += 1;
                continue;
            }
            let delete_to =
                |end: usize| replace_all(&target.buffer, &[(ex.start, end, Vec::new())]);
            if !self.consider_new_buffer(&delete_to(ex.end))? {
                i += 1;
                continue;
            }
            let sibling_ends: Vec<usize> = target.examples[i + 1..]
                .iter()
                .filter(|other| other.parent == ex.parent && other.start >= ex.end)
                .map(|other| other.end)
                .collect();
            try_find_integer(|k| match sibling_ends.get(k.wrapping_sub(1)) {
                Some(&end) if k > 0 => self.consider_new_buffer(&delete_to(end)),
                _ => Ok(false),
            })?;
        }

        let mut parent = 0;
        while parent < self.shrink_target.examples.len() {
            self.delete_child_subsets(parent)?;
            parent += 1;
        }
        Ok(())
    }

    /// Run the length shrinker over the children of one example
    fn delete_child_subsets(&mut self, parent: usize) -> PassResult<X::Error> {
        let target = Rc::clone(&self.shrink_target);
        let children: Vec<usize> = target
            .examples
            .iter()
            .enumerate()
            .filter(|(_, ex)| ex.parent == Some(parent) && !ex.is_empty())
            .map(|(j, _)| j)
            .collect();
        if children.len() < 2 {
            return Ok(());
        }
        let mut random = create_seeded_rng(self.random.r#gen());
        Length::shrink(
            children.clone(),
            |kept: &Vec<usize>| {
                let deletions: Vec<(usize, usize, Vec<u8>)> = children
                    .iter()
                    .filter(|j| !kept.contains(j))
                    .map(|&j| (target.examples[j].start, target.examples[j].end, Vec::new()))
                    .collect();
                self.consider_new_buffer(&replace_all(&target.buffer, &deletions))
            },
            &mut random,
            false,
        )?;
        Ok(())
    }

    /// Replace each non-trivial example with zeros
    fn zero_examples(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.examples.len() {
            let target = Rc::clone(&self.shrink_target);
            let ex = &target.examples[i];
            if !ex.trivial && !ex.is_empty() {
                let zeros = vec![0; ex.len()];
                let zeroed = replace_all(&target.buffer, &[(ex.start, ex.end, zeros)]);
                self.consider_new_buffer(&zeroed)?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Lower blocks that share the same bytes together
    fn minimize_duplicated_blocks(&mut self) -> PassResult<X::Error> {
        let target = Rc::clone(&self.shrink_target);
        let mut groups: BTreeMap<&[u8], Vec<usize>> = BTreeMap::new();
        for (i, block) in target.blocks.iter().enumerate() {
            let bytes = target.block_bytes(block);
            if !block.forced && bytes.iter().any(|&b| b != 0) {
                groups.entry(bytes).or_default().push(i);
            }
        }
        let mut duplicated: Vec<&Vec<usize>> =
            groups.values().filter(|indices| indices.len() > 1).collect();
        duplicated.sort_by_key(|indices| indices[0]);

        for indices in duplicated {
            let initial = target.block_bytes(&target.blocks[indices[0]]).to_vec();
            Minimizer::shrink(
                &initial,
                |value: &Vec<u8>| self.try_replace_blocks(indices, value),
                false,
            )?;
        }
        Ok(())
    }

    /// Lexicographically minimise each block on its own
    fn minimize_individual_blocks(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.blocks.len() {
            let target = Rc::clone(&self.shrink_target);
            let block = &target.blocks[i];
            let bytes = target.block_bytes(block);
            if !block.forced && bytes.iter().any(|&b| b != 0) {
                Minimizer::shrink(
                    bytes,
                    |value: &Vec<u8>| self.try_replace_blocks(&[i], value),
                    false,
                )?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Lower each block as an integer, mostly by shifting it right
    fn lower_blocks_shifted(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.blocks.len() {
            let target = Rc::clone(&self.shrink_target);
            let block = &target.blocks[i];
            let size = block.len();
            let value = int_from_bytes(target.block_bytes(block));
            if !block.forced && value > 0 && size <= 8 {
                Integer::shrink(
                    value,
                    |v: &u64| self.try_replace_blocks(&[i], &int_to_bytes(*v, size)),
                    false,
                )?;
            }
            i += 1;
        }
        Ok(())
    }

    /// Lower every recently changed block by a common offset.
    ///
    /// Blocks that can only shrink together, such as two values that must
    /// stay close, would otherwise take a round per small step.
    fn lower_common_block_offset(&mut self) -> PassResult<X::Error> {
        if self.changed_blocks.len() <= 1 {
            return Ok(());
        }
        let target = Rc::clone(&self.shrink_target);
        let changed: Vec<(usize, u64)> = self
            .changed_blocks
            .iter()
            .filter_map(|&i| {
                let block = target.blocks.get(i)?;
                let value = int_from_bytes(target.block_bytes(block));
                (!block.forced && value > 0 && block.len() <= 8).then_some((i, value))
            })
            .collect();
        let Some(offset) = changed.iter().map(|&(_, value)| value).min() else {
            self.changed_blocks.clear();
            return Ok(());
        };
        let reoffset = |o: u64| -> Vec<(usize, usize, Vec<u8>)> {
            changed
                .iter()
                .map(|&(i, value)| {
                    let block = &target.blocks[i];
                    (block.start, block.end, int_to_bytes(value - offset + o, block.len()))
                })
                .collect()
        };
        shrink_towards(offset, 0, |o| {
            self.consider_new_buffer(&replace_all(&target.buffer, &reoffset(o)))
        })?;
        self.changed_blocks.clear();
        Ok(())
    }

    /// Lower a block by one while deleting a later example.
    ///
    /// Handles a count that has to drop together with one of the items it
    /// counts. Only blocks whose lowering alone makes the test read less
    /// are tried.
    fn example_deletion_with_block_lowering(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.blocks.len() {
            let target = Rc::clone(&self.shrink_target);
            let block = &target.blocks[i];
            let size = block.len();
            let value = int_from_bytes(target.block_bytes(block));
            if block.forced || value == 0 || size > 8 {
                i += 1;
                continue;
            }
            let lowered = int_to_bytes(value - 1, size);
            let alone = replace_all(&target.buffer, &[(block.start, block.end, lowered.clone())]);
            let result = self.run_buffer(&alone)?;
            if (self.predicate)(&result) && sort_key(&result.buffer) < sort_key(&target.buffer) {
                self.update_shrink_target(result);
                continue;
            }
            if result.status == Status::Overrun || result.buffer.len() >= target.buffer.len() {
                i += 1;
                continue;
            }

            let mut shrunk = false;
            for ex in &target.examples {
                if ex.start < block.end || ex.is_empty() {
                    continue;
                }
                let attempt = replace_all(
                    &target.buffer,
                    &[
                        (block.start, block.end, lowered.clone()),
                        (ex.start, ex.end, Vec::new()),
                    ],
                );
                if self.consider_new_buffer(&attempt)? {
                    shrunk = true;
                    break;
                }
            }
            if !shrunk {
                i += 1;
            }
        }
        Ok(())
    }

    /// Replace each example with a smaller descendant carrying the same label
    fn pass_to_descendant(&mut self) -> PassResult<X::Error> {
        let mut i = 0;
        while i < self.shrink_target.examples.len() {
            let target = Rc::clone(&self.shrink_target);
            let ancestor = &target.examples[i];
            let mut shrunk = false;
            // Examples are stored in start order, so descendants follow directly
            let descendants = target.examples[i + 1..]
                .iter()
                .take_while(|ex| ex.start < ancestor.end)
                .filter(|ex| ex.label == ancestor.label && ex.len() < ancestor.len());
            for descendant in descendants {
                let lifted = replace_all(
                    &target.buffer,
                    &[(ancestor.start, ancestor.end, target.example_bytes(descendant).to_vec())],
                );
                if self.consider_new_buffer(&lifted)? {
                    shrunk = true;
                    break;
                }
            }
            if !shrunk {
                i += 1;
            }
        }
        Ok(())
    }

    /// Sort runs of sibling examples with the same label
    fn reorder_examples(&mut self) -> PassResult<X::Error> {
        let mut group = 0;
        loop {
            let target = Rc::clone(&self.shrink_target);
            let mut groups: BTreeMap<(Option<usize>, u64), Vec<usize>> = BTreeMap::new();
            for (j, ex) in target.examples.iter().enumerate() {
                if ex.parent.is_some() {
                    groups.entry((ex.parent, ex.label)).or_default().push(j);
                }
            }
            let Some(members) = groups.into_values().filter(|m| m.len() > 1).nth(group) else {
                return Ok(());
            };
            group += 1;

            let contents: Vec<&[u8]> = members
                .iter()
                .map(|&j| target.example_bytes(&target.examples[j]))
                .collect();
            let mut sorted = contents.clone();
            sorted.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
            if sorted == contents {
                continue;
            }
            let replacements: Vec<(usize, usize, Vec<u8>)> = members
                .iter()
                .zip(&sorted)
                .map(|(&j, bytes)| {
                    let ex = &target.examples[j];
                    (ex.start, ex.end, bytes.to_vec())
                })
                .collect();
            if self.consider_new_buffer(&replace_all(&target.buffer, &replacements))? {
                continue;
            }

            // Fall back to swapping out-of-order neighbours
            for k in 0..members.len() - 1 {
                if sort_key(contents[k + 1]) < sort_key(contents[k]) {
                    let (a, b) = (&target.examples[members[k]], &target.examples[members[k + 1]]);
                    let swapped = [
                        (a.start, a.end, contents[k + 1].to_vec()),
                        (b.start, b.end, contents[k].to_vec()),
                    ];
                    if self.consider_new_buffer(&replace_all(&target.buffer, &swapped))? {
                        break;
                    }
                }
            }
        }
    }

    /// Replace every occurrence of one byte value with a smaller one
    fn alphabet_minimize(&mut self) -> PassResult<X::Error> {
        let alphabet: BTreeSet<u8> = self.shrink_target.buffer.iter().copied().collect();
        for c in alphabet.into_iter().filter(|&c| c > 0) {
            let target = Rc::clone(&self.shrink_target);
            if !target.buffer.contains(&c) {
                continue;
            }
            Integer::shrink(
                c,
                |&d: &u8| {
                    let replaced: Vec<u8> = target
                        .buffer
                        .iter()
                        .map(|&b| if b == c { d } else { b })
                        .collect();
                    self.consider_new_buffer(&replaced)
                },
                false,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ConjectureData, Status};
    use crate::error::DrawResult;
    use crate::utils::calc_label_from_name;
    use std::convert::Infallible;

    struct DirectExecutor<F> {
        test: F,
        calls: usize,
    }

    impl<F> TestCaseExecutor for DirectExecutor<F>
    where
        F: FnMut(&mut ConjectureData) -> DrawResult<()>,
    {
        type Error = Infallible;

        fn cached_test_function(
            &mut self,
            buffer: &[u8],
        ) -> Result<Rc<ConjectureResult>, Infallible> {
            self.calls += 1;
            let mut data = ConjectureData::for_buffer(buffer);
            let _ = (self.test)(&mut data);
            let _ = data.freeze();
            Ok(Rc::new(data.as_result()))
        }
    }

    fn is_interesting(result: &ConjectureResult) -> bool {
        result.status == Status::Interesting
    }

    fn shrink_with<F>(test: F, initial: &[u8]) -> Vec<u8>
    where
        F: FnMut(&mut ConjectureData) -> DrawResult<()>,
    {
        let mut executor = DirectExecutor { test, calls: 0 };
        let initial = executor.cached_test_function(initial).unwrap();
        assert!(is_interesting(&initial));
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings::default(),
            create_seeded_rng(0),
        );
        shrinker.shrink().unwrap();
        let result = shrinker.shrink_target().buffer.clone();
        assert!(executor.calls > 0);
        result
    }

    fn sum_at_least_100(data: &mut ConjectureData) -> DrawResult<()> {
        let a = data.draw_bits(8, None)?;
        let b = data.draw_bits(8, None)?;
        if a + b >= 100 {
            match data.mark_interesting(None)? {}
        }
        Ok(())
    }

    #[test]
    fn test_shrinks_sum_of_two_bytes() {
        assert_eq!(shrink_with(sum_at_least_100, &[200, 200]), vec![0, 100]);
    }

    #[test]
    fn test_removes_discarded_examples() {
        fn test(data: &mut ConjectureData) -> DrawResult<()> {
            let label = calc_label_from_name("retry");
            loop {
                data.start_example(label)?;
                let v = data.draw_bits(8, None)?;
                if v % 2 == 1 {
                    data.stop_example(true)?;
                    continue;
                }
                data.stop_example(false)?;
                break;
            }
            if data.draw_bits(8, None)? >= 10 {
                match data.mark_interesting(None)? {}
            }
            Ok(())
        }
        assert_eq!(shrink_with(test, &[1, 3, 2, 50]), vec![0, 10]);
    }

    #[test]
    fn test_deletes_list_elements() {
        fn test(data: &mut ConjectureData) -> DrawResult<()> {
            let label = calc_label_from_name("element");
            let mut nonzero = 0;
            loop {
                data.start_example(label)?;
                if data.draw_bits(1, None)? == 0 {
                    data.stop_example(false)?;
                    break;
                }
                if data.draw_bits(8, None)? > 0 {
                    nonzero += 1;
                }
                data.stop_example(false)?;
            }
            if nonzero >= 3 {
                match data.mark_interesting(None)? {}
            }
            Ok(())
        }
        let initial = [1, 9, 1, 0, 1, 7, 1, 3, 1, 0, 1, 200, 0];
        assert_eq!(shrink_with(test, &initial), vec![1, 1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_minimizes_duplicated_blocks_together() {
        fn test(data: &mut ConjectureData) -> DrawResult<()> {
            let a = data.draw_bits(16, None)?;
            let b = data.draw_bits(16, None)?;
            if a == b && a >= 1000 {
                match data.mark_interesting(None)? {}
            }
            Ok(())
        }
        assert_eq!(shrink_with(test, &[0xAB, 0xCD, 0xAB, 0xCD]), vec![0x03, 0xE8, 0x03, 0xE8]);
    }

    #[test]
    fn test_reorders_examples() {
        fn test(data: &mut ConjectureData) -> DrawResult<()> {
            let label = calc_label_from_name("item");
            let mut values = Vec::new();
            for _ in 0..2 {
                data.start_example(label)?;
                values.push(data.draw_bits(8, None)?);
                data.stop_example(false)?;
            }
            if values.contains(&5) && values.contains(&1) {
                match data.mark_interesting(None)? {}
            }
            Ok(())
        }
        assert_eq!(shrink_with(test, &[5, 1]), vec![1, 5]);
    }

    /// Run each of `passes` once, in order
    fn run_passes<F>(test: F, initial: &[u8], passes: &[ShrinkPass]) -> Vec<u8>
    where
        F: FnMut(&mut ConjectureData) -> DrawResult<()>,
    {
        let mut executor = DirectExecutor { test, calls: 0 };
        let initial = executor.cached_test_function(initial).unwrap();
        assert!(is_interesting(&initial));
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings::default(),
            create_seeded_rng(0),
        );
        for &pass in passes {
            shrinker.run_pass(pass).unwrap();
        }
        shrinker.shrink_target().buffer.clone()
    }

    fn all_but(pass: ShrinkPass) -> Vec<ShrinkPass> {
        ShrinkPass::ALL.into_iter().filter(|&other| other != pass).collect()
    }

    #[test]
    fn test_pass_names_are_unique() {
        let names: BTreeSet<&str> = ShrinkPass::ALL.iter().map(|pass| pass.name()).collect();
        assert_eq!(names.len(), ShrinkPass::ALL.len());
    }

    fn has_large_leaf(data: &mut ConjectureData) -> DrawResult<()> {
        fn node(data: &mut ConjectureData) -> DrawResult<bool> {
            data.start_example(calc_label_from_name("tree"))?;
            let large = if data.draw_bits(1, None)? == 1 {
                let left = node(data)?;
                let right = node(data)?;
                left || right
            } else {
                data.draw_bits(8, None)? >= 100
            };
            data.stop_example(false)?;
            Ok(large)
        }
        if node(data)? {
            match data.mark_interesting(None)? {}
        }
        Ok(())
    }

    #[test]
    fn test_pass_to_descendant_collapses_tree_to_leaf() {
        // (leaf 5, (leaf 200, leaf 7))
        let initial = [1, 0, 5, 1, 0, 200, 0, 7];
        let shrunk = run_passes(has_large_leaf, &initial, &[ShrinkPass::PassToDescendant]);
        assert_eq!(shrunk, vec![0, 200]);
    }

    fn adjacent_pair(data: &mut ConjectureData) -> DrawResult<()> {
        let a = data.draw_bits(8, None)?;
        let b = data.draw_bits(8, None)?;
        if b == a + 1 {
            match data.mark_interesting(None)? {}
        }
        Ok(())
    }

    #[test]
    fn test_lower_common_block_offset_moves_blocks_together() {
        let pass = ShrinkPass::LowerCommonBlockOffset;
        let mut executor = DirectExecutor {
            test: adjacent_pair,
            calls: 0,
        };
        let initial = executor.cached_test_function(&[201, 202]).unwrap();
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings::default(),
            create_seeded_rng(0),
        );
        // Both blocks change here, which is what the pass looks for
        assert!(shrinker.consider_new_buffer(&[200, 201]).unwrap());
        for other in all_but(pass) {
            shrinker.run_pass(other).unwrap();
        }
        assert_eq!(shrinker.shrink_target().buffer, vec![200, 201]);
        shrinker.run_pass(pass).unwrap();
        assert_eq!(shrinker.shrink_target().buffer, vec![0, 1]);
    }

    fn counted_list_ending_large(data: &mut ConjectureData) -> DrawResult<()> {
        let label = calc_label_from_name("element");
        let n = data.draw_bits(8, None)?;
        let mut last = None;
        for _ in 0..n {
            data.start_example(label)?;
            last = Some(data.draw_bits(8, None)?);
            data.stop_example(false)?;
        }
        if last.is_some_and(|value| value >= 50) {
            match data.mark_interesting(None)? {}
        }
        Ok(())
    }

    #[test]
    fn test_example_deletion_with_block_lowering_drops_counted_item() {
        let pass = ShrinkPass::ExampleDeletionWithBlockLowering;
        let initial = [2, 0, 50];
        assert_eq!(run_passes(counted_list_ending_large, &initial, &all_but(pass)), initial);
        assert_eq!(run_passes(counted_list_ending_large, &initial, &[pass]), vec![1, 50]);
    }

    fn repeated_byte(data: &mut ConjectureData) -> DrawResult<()> {
        let a = data.draw_bits(8, None)?;
        let b = data.draw_bits(16, None)?;
        if a != 0 && b == a * 0x0101 {
            match data.mark_interesting(None)? {}
        }
        Ok(())
    }

    #[test]
    fn test_alphabet_minimize_lowers_byte_across_blocks() {
        let pass = ShrinkPass::AlphabetMinimize;
        let initial = [9, 9, 9];
        assert_eq!(run_passes(repeated_byte, &initial, &all_but(pass)), initial);
        assert_eq!(run_passes(repeated_byte, &initial, &[pass]), vec![1, 1, 1]);
    }

    #[test]
    fn test_respects_call_budget() {
        let mut executor = DirectExecutor {
            test: sum_at_least_100,
            calls: 0,
        };
        let initial = executor.cached_test_function(&[255, 255]).unwrap();
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings {
                max_calls: 3,
                timeout: None,
            },
            create_seeded_rng(0),
        );
        shrinker.shrink().unwrap();
        assert!(shrinker.calls() <= 3);
        assert!(is_interesting(shrinker.shrink_target()));
    }

    #[test]
    fn test_executor_halt_is_propagated() {
        struct Halting {
            remaining: usize,
        }
        impl TestCaseExecutor for Halting {
            type Error = &'static str;

            fn cached_test_function(
                &mut self,
                buffer: &[u8],
            ) -> Result<Rc<ConjectureResult>, &'static str> {
                if self.remaining == 0 {
                    return Err("halted");
                }
                self.remaining -= 1;
                let mut data = ConjectureData::for_buffer(buffer);
                let _ = sum_at_least_100(&mut data);
                let _ = data.freeze();
                Ok(Rc::new(data.as_result()))
            }
        }

        let mut executor = Halting { remaining: 5 };
        let initial = executor.cached_test_function(&[255, 255]).unwrap();
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings::default(),
            create_seeded_rng(0),
        );
        assert_eq!(shrinker.shrink(), Err("halted"));
        assert!(is_interesting(shrinker.shrink_target()));
    }

    #[test]
    fn test_never_accepts_larger_buffers() {
        let mut executor = DirectExecutor {
            test: sum_at_least_100,
            calls: 0,
        };
        let initial = executor.cached_test_function(&[50, 50]).unwrap();
        let mut shrinker = TestCaseShrinker::new(
            &mut executor,
            initial,
            is_interesting,
            ShrinkSettings::default(),
            create_seeded_rng(0),
        );
        assert_eq!(shrinker.consider_new_buffer(&[60, 60]).unwrap(), false);
        assert_eq!(shrinker.consider_new_buffer(&[50, 50]).unwrap(), true);
        assert_eq!(shrinker.calls(), 0);
        assert_eq!(shrinker.consider_new_buffer(&[0, 100]).unwrap(), true);
        assert_eq!(shrinker.shrink_target().buffer, vec![0, 100]);
        assert_eq!(shrinker.changes(), 1);
    }
}
