//! A single test-case execution over a byte buffer.
//!
//! [`ConjectureData`] hands out bits from a [`ByteSource`], records every
//! answer in its buffer, tracks the nested example spans drawn so far and
//! moves through a one-shot status state machine. Once frozen it can be
//! snapshotted into an owned [`ConjectureResult`].

use std::collections::{BTreeMap, HashSet};
use std::convert::Infallible;
use std::fmt;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
#[cfg(feature = "persistence")]
use serde::{Deserialize, Serialize};

use crate::config::IntegerRangeBias;
use crate::error::{DataError, DrawResult};
use crate::source::ByteSource;
use crate::utils::{bits_to_bytes, calc_label_from_name, int_from_bytes, int_to_bytes};

/// Label of the example spanning the whole test case
pub static TOP_LABEL: LazyLock<u64> = LazyLock::new(|| calc_label_from_name("top"));

/// Label of the example wrapping every `draw_bits` call
pub static DRAW_BITS_LABEL: LazyLock<u64> = LazyLock::new(|| calc_label_from_name("draw_bits()"));

static GLOBAL_TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of a test case, ordered from least to most informative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub enum Status {
    /// The test case needed more bytes than were available
    Overrun,
    /// The test case rejected its input
    Invalid,
    /// The test case ran to completion without failing
    Valid,
    /// The test case failed
    Interesting,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Overrun => "OVERRUN",
            Status::Invalid => "INVALID",
            Status::Valid => "VALID",
            Status::Interesting => "INTERESTING",
        };
        write!(f, "{}", name)
    }
}

/// Identifies a distinct failure. Two interesting test cases with the same
/// origin are treated as the same bug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "persistence", derive(Serialize, Deserialize))]
pub struct InterestingOrigin(String);

impl InterestingOrigin {
    pub fn new(origin: impl Into<String>) -> Self {
        Self(origin.into())
    }
}

impl fmt::Display for InterestingOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single `draw_bits` record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    /// The drawn value, after masking to the requested bit width
    pub value: u64,
    /// Whether the value was supplied by the caller rather than read from the source
    pub forced: bool,
}

impl Block {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A labelled span of the buffer, produced by `start_example`/`stop_example`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub label: u64,
    pub start: usize,
    pub end: usize,
    pub depth: usize,
    pub parent: Option<usize>,
    /// Closed with `discard = true`, e.g. a rejected draw
    pub discarded: bool,
    /// Every byte in the span is zero
    pub trivial: bool,
}

impl Example {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Receives the draw stream of a `ConjectureData` as it happens.
pub trait DataObserver {
    /// Called after every draw with the final value
    fn draw_bits(&mut self, n_bits: u32, forced: bool, value: u64) -> DrawResult<()>;

    /// Called exactly once, when the data is frozen
    fn conclude_test(
        &mut self,
        status: Status,
        interesting_origin: Option<&InterestingOrigin>,
    ) -> DrawResult<()>;

    /// Mark the rest of the current path as not worth exploring
    fn kill_branch(&mut self) -> DrawResult<()>;
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DataObserver for NoopObserver {
    fn draw_bits(&mut self, _n_bits: u32, _forced: bool, _value: u64) -> DrawResult<()> {
        Ok(())
    }

    fn conclude_test(
        &mut self,
        _status: Status,
        _interesting_origin: Option<&InterestingOrigin>,
    ) -> DrawResult<()> {
        Ok(())
    }

    fn kill_branch(&mut self) -> DrawResult<()> {
        Ok(())
    }
}

/// Owned, read-only snapshot of a frozen test case.
#[derive(Debug, Clone, PartialEq)]
pub struct ConjectureResult {
    pub buffer: Vec<u8>,
    pub status: Status,
    pub interesting_origin: Option<InterestingOrigin>,
    pub blocks: Vec<Block>,
    pub examples: Vec<Example>,
    pub target_observations: BTreeMap<String, f64>,
    pub has_discards: bool,
    /// Byte indices written by forced draws
    pub forced_indices: HashSet<usize>,
}

impl ConjectureResult {
    /// The canonical overrun result
    pub fn overrun() -> Self {
        Self {
            buffer: Vec::new(),
            status: Status::Overrun,
            interesting_origin: None,
            blocks: Vec::new(),
            examples: Vec::new(),
            target_observations: BTreeMap::new(),
            has_discards: false,
            forced_indices: HashSet::new(),
        }
    }

    /// Bytes of `block`
    pub fn block_bytes(&self, block: &Block) -> &[u8] {
        &self.buffer[block.start..block.end]
    }

    /// Bytes of `example`
    pub fn example_bytes(&self, example: &Example) -> &[u8] {
        &self.buffer[example.start..example.end]
    }
}

/// State of one attempt at running the test function.
pub struct ConjectureData<'a> {
    source: ByteSource,
    buffer: Vec<u8>,
    status: Status,
    frozen: bool,
    testcounter: u64,
    blocks: Vec<Block>,
    examples: Vec<Example>,
    example_stack: Vec<usize>,
    max_depth: usize,
    interesting_origin: Option<InterestingOrigin>,
    target_observations: BTreeMap<String, f64>,
    forced_indices: HashSet<usize>,
    has_discards: bool,
    integer_range_bias: IntegerRangeBias,
    observer: Box<dyn DataObserver + 'a>,
}

impl fmt::Debug for ConjectureData<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConjectureData")
            .field("testcounter", &self.testcounter)
            .field("status", &self.status)
            .field("frozen", &self.frozen)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl ConjectureData<'static> {
    /// Data that replays exactly `buffer` with no observer attached
    pub fn for_buffer(buffer: &[u8]) -> Self {
        ConjectureData::new(ByteSource::for_buffer(buffer), Box::new(NoopObserver))
    }
}

impl<'a> ConjectureData<'a> {
    /// Create data drawing from `source` and reporting to `observer`
    pub fn new(source: ByteSource, observer: Box<dyn DataObserver + 'a>) -> Self {
        let mut data = Self {
            source,
            buffer: Vec::new(),
            status: Status::Valid,
            frozen: false,
            testcounter: GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::Relaxed),
            blocks: Vec::new(),
            examples: Vec::new(),
            example_stack: Vec::new(),
            max_depth: 100,
            interesting_origin: None,
            target_observations: BTreeMap::new(),
            forced_indices: HashSet::new(),
            has_discards: false,
            integer_range_bias: IntegerRangeBias::default(),
            observer,
        };
        data.push_example(*TOP_LABEL);
        data
    }

    /// Set the maximum example nesting depth
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the distribution constants used by `integer_range`
    pub fn with_integer_range_bias(mut self, bias: IntegerRangeBias) -> Self {
        self.integer_range_bias = bias;
        self
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Tag carried by the `StopTest` signals of this attempt
    pub fn testcounter(&self) -> u64 {
        self.testcounter
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn interesting_origin(&self) -> Option<&InterestingOrigin> {
        self.interesting_origin.as_ref()
    }

    pub fn target_observations(&self) -> &BTreeMap<String, f64> {
        &self.target_observations
    }

    pub fn integer_range_bias(&self) -> &IntegerRangeBias {
        &self.integer_range_bias
    }

    /// Current example nesting depth, 0 for the top-level example
    pub fn depth(&self) -> usize {
        self.example_stack.len().saturating_sub(1)
    }

    fn assert_not_frozen(&self) -> DrawResult<()> {
        if self.frozen {
            return Err(DataError::Frozen);
        }
        Ok(())
    }

    fn push_example(&mut self, label: u64) -> usize {
        let index = self.examples.len();
        self.examples.push(Example {
            label,
            start: self.buffer.len(),
            end: self.buffer.len(),
            depth: self.example_stack.len(),
            parent: self.example_stack.last().copied(),
            discarded: false,
            trivial: false,
        });
        self.example_stack.push(index);
        index
    }

    /// Open a labelled span. Exceeding the maximum depth marks the data invalid.
    pub fn start_example(&mut self, label: u64) -> DrawResult<()> {
        self.assert_not_frozen()?;
        self.push_example(label);
        if self.depth() > self.max_depth {
            self.mark_invalid()?;
        }
        Ok(())
    }

    /// Close the innermost open span
    pub fn stop_example(&mut self, discard: bool) -> DrawResult<()> {
        self.assert_not_frozen()?;
        // The top-level example is only closed by `freeze`
        if self.example_stack.len() <= 1 {
            warn!("Ignoring stop_example without a matching start_example");
            return Ok(());
        }
        if let Some(index) = self.example_stack.pop() {
            let example = &mut self.examples[index];
            example.end = self.buffer.len();
            example.discarded = discard;
            self.has_discards |= discard;
        }
        Ok(())
    }

    /// Draw an `n_bits`-bit unsigned integer.
    ///
    /// With `forced`, that value is recorded as if it had been drawn.
    pub fn draw_bits(&mut self, n_bits: u32, forced: Option<u64>) -> DrawResult<u64> {
        self.assert_not_frozen()?;
        assert!(n_bits <= 64, "draw_bits supports at most 64 bits, got {}", n_bits);
        if n_bits == 0 {
            return Ok(0);
        }
        let n_bytes = bits_to_bytes(n_bits);
        let start = self.buffer.len();

        self.start_example(*DRAW_BITS_LABEL)?;
        let mut bytes = match forced {
            Some(value) => int_to_bytes(value, n_bytes),
            None => match self.source.read(start, n_bytes) {
                Some(bytes) => bytes,
                None => match self.mark_overrun()? {},
            },
        };
        if n_bits % 8 != 0 {
            bytes[0] &= (1u8 << (n_bits % 8)) - 1;
        }
        let value = int_from_bytes(&bytes);

        self.observer.draw_bits(n_bits, forced.is_some(), value)?;

        self.buffer.extend_from_slice(&bytes);
        let end = self.buffer.len();
        if forced.is_some() {
            self.forced_indices.extend(start..end);
        }
        self.blocks.push(Block {
            start,
            end,
            value,
            forced: forced.is_some(),
        });
        self.stop_example(false)?;
        Ok(value)
    }

    /// Draw `n` bytes as a run of blocks of at most 8 bytes each
    pub fn draw_bytes(&mut self, n: usize) -> DrawResult<Vec<u8>> {
        let mut result = Vec::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(8);
            let value = self.draw_bits((chunk * 8) as u32, None)?;
            result.extend_from_slice(&int_to_bytes(value, chunk));
            remaining -= chunk;
        }
        Ok(result)
    }

    /// Write `bytes` as forced draws, so replay reproduces them exactly
    pub fn write(&mut self, bytes: &[u8]) -> DrawResult<()> {
        for chunk in bytes.chunks(8) {
            self.draw_bits((chunk.len() * 8) as u32, Some(int_from_bytes(chunk)))?;
        }
        Ok(())
    }

    /// Record a score to maximise for `label`.
    ///
    /// Each label may be observed once per test case.
    pub fn target(&mut self, label: impl Into<String>, score: f64) -> DrawResult<()> {
        self.assert_not_frozen()?;
        let label = label.into();
        if let Some(previous) = self.target_observations.get(&label) {
            return Err(DataError::InvalidArgument(format!(
                "Calling target({:?}, {}) would overwrite target({:?}, {})",
                label, score, label, previous
            )));
        }
        self.target_observations.insert(label, score);
        Ok(())
    }

    /// Declare that nothing after the current point is worth exploring
    pub fn kill_branch(&mut self) -> DrawResult<()> {
        self.assert_not_frozen()?;
        self.observer.kill_branch()
    }

    fn conclude_test(
        &mut self,
        status: Status,
        interesting_origin: Option<InterestingOrigin>,
    ) -> DataError {
        if self.frozen {
            return DataError::Frozen;
        }
        self.status = status;
        self.interesting_origin = interesting_origin;
        match self.freeze() {
            Ok(()) => DataError::StopTest {
                testcounter: self.testcounter,
            },
            Err(err) => err,
        }
    }

    /// End the attempt as a failure
    pub fn mark_interesting(
        &mut self,
        interesting_origin: Option<InterestingOrigin>,
    ) -> DrawResult<Infallible> {
        Err(self.conclude_test(Status::Interesting, interesting_origin))
    }

    /// End the attempt as rejected input
    pub fn mark_invalid(&mut self) -> DrawResult<Infallible> {
        Err(self.conclude_test(Status::Invalid, None))
    }

    /// End the attempt for running out of bytes
    pub fn mark_overrun(&mut self) -> DrawResult<Infallible> {
        Err(self.conclude_test(Status::Overrun, None))
    }

    /// Close every open example and make the buffer immutable. Idempotent.
    pub fn freeze(&mut self) -> DrawResult<()> {
        if self.frozen {
            return Ok(());
        }
        let end = self.buffer.len();
        while let Some(index) = self.example_stack.pop() {
            self.examples[index].end = end;
        }
        for example in &mut self.examples {
            example.trivial = self.buffer[example.start..example.end]
                .iter()
                .all(|&b| b == 0);
        }
        self.frozen = true;
        self.observer
            .conclude_test(self.status, self.interesting_origin.as_ref())
    }

    /// Snapshot of a frozen test case
    pub fn as_result(&self) -> ConjectureResult {
        debug_assert!(self.frozen, "as_result called on unfrozen data");
        if self.status == Status::Overrun {
            return ConjectureResult::overrun();
        }
        ConjectureResult {
            buffer: self.buffer.clone(),
            status: self.status,
            interesting_origin: self.interesting_origin.clone(),
            blocks: self.blocks.clone(),
            examples: self.examples.clone(),
            target_observations: self.target_observations.clone(),
            has_discards: self.has_discards,
            forced_indices: self.forced_indices.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::create_seeded_rng;
    use crate::source::GenerationParameters;
    use rand::Rng;

    fn draw_fixed_sequence(data: &mut ConjectureData) -> DrawResult<Vec<u64>> {
        let mut values = Vec::new();
        values.push(data.draw_bits(8, None)?);
        values.push(data.draw_bits(16, None)?);
        data.start_example(calc_label_from_name("pair"))?;
        values.push(data.draw_bits(3, None)?);
        values.push(data.draw_bits(64, None)?);
        data.stop_example(false)?;
        Ok(values)
    }

    #[test]
    fn test_draw_bits_reads_big_endian() {
        let mut data = ConjectureData::for_buffer(&[1, 2, 3]);
        assert_eq!(data.draw_bits(8, None), Ok(1));
        assert_eq!(data.draw_bits(16, None), Ok(0x0203));
        assert_eq!(data.buffer(), &[1, 2, 3]);
    }

    #[test]
    fn test_draw_bits_masks_partial_bytes() {
        let mut data = ConjectureData::for_buffer(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(data.draw_bits(3, None), Ok(7));
        assert_eq!(data.draw_bits(12, None), Ok(0x0FFF));
        assert_eq!(data.buffer(), &[0x07, 0x0F, 0xFF]);
    }

    #[test]
    fn test_zero_bit_draw_is_free() {
        let mut data = ConjectureData::for_buffer(&[]);
        assert_eq!(data.draw_bits(0, None), Ok(0));
        assert!(data.buffer().is_empty());
        assert!(data.blocks().is_empty());
    }

    #[test]
    fn test_overrun_stops_and_freezes() {
        let mut data = ConjectureData::for_buffer(&[1]);
        let testcounter = data.testcounter();
        assert_eq!(data.draw_bits(16, None), Err(DataError::StopTest { testcounter }));
        assert_eq!(data.status(), Status::Overrun);
        assert!(data.is_frozen());
        assert_eq!(data.as_result().status, Status::Overrun);
    }

    #[test]
    fn test_draw_after_freeze_is_frozen_error() {
        let mut data = ConjectureData::for_buffer(&[1, 2]);
        data.draw_bits(8, None).unwrap();
        data.freeze().unwrap();
        assert_eq!(data.draw_bits(8, None), Err(DataError::Frozen));
        assert_eq!(data.mark_invalid(), Err(DataError::Frozen));
        assert_eq!(data.status(), Status::Valid);
    }

    #[test]
    fn test_mark_interesting_sets_status_once() {
        let mut data = ConjectureData::for_buffer(&[0]);
        let origin = InterestingOrigin::new("boom");
        let err = data.mark_interesting(Some(origin.clone())).unwrap_err();
        assert!(matches!(err, DataError::StopTest { .. }));
        assert_eq!(data.status(), Status::Interesting);
        assert_eq!(data.interesting_origin(), Some(&origin));
        assert_eq!(data.mark_invalid(), Err(DataError::Frozen));
        assert_eq!(data.status(), Status::Interesting);
    }

    #[test]
    fn test_testcounters_are_distinct() {
        let a = ConjectureData::for_buffer(&[]);
        let b = ConjectureData::for_buffer(&[]);
        assert_ne!(a.testcounter(), b.testcounter());
    }

    #[test]
    fn test_forced_draws_are_recorded() {
        let mut data = ConjectureData::for_buffer(&[]);
        assert_eq!(data.draw_bits(16, Some(0x1234)), Ok(0x1234));
        data.freeze().unwrap();
        let result = data.as_result();
        assert_eq!(result.buffer, vec![0x12, 0x34]);
        assert!(result.blocks[0].forced);
        assert!(result.forced_indices.contains(&0) && result.forced_indices.contains(&1));
    }

    #[test]
    fn test_write_replays_bytes() {
        let mut data = ConjectureData::for_buffer(&[]);
        data.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(data.buffer(), &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(data.blocks().len(), 2);
    }

    #[test]
    fn test_draw_bytes_chunks() {
        let buffer: Vec<u8> = (0..20).collect();
        let mut data = ConjectureData::for_buffer(&buffer);
        assert_eq!(data.draw_bytes(20).unwrap(), buffer);
        assert_eq!(data.blocks().len(), 3);
    }

    #[test]
    fn test_round_trip_buffer() {
        let mut rng = create_seeded_rng(11);
        for _ in 0..50 {
            let mut buffer: Vec<u8> = (0..12).map(|_| rng.r#gen()).collect();
            // The 3-bit draw masks its byte, so only masked buffers round-trip
            buffer[3] &= 0x07;
            let mut data = ConjectureData::for_buffer(&buffer);
            draw_fixed_sequence(&mut data).unwrap();
            assert_eq!(data.buffer(), &buffer[..]);
        }
    }

    #[test]
    fn test_determinism() {
        let mut rng = create_seeded_rng(12);
        for _ in 0..50 {
            let buffer: Vec<u8> = (0..12).map(|_| rng.r#gen()).collect();
            let mut first = ConjectureData::for_buffer(&buffer);
            let mut second = ConjectureData::for_buffer(&buffer);
            assert_eq!(
                draw_fixed_sequence(&mut first).unwrap(),
                draw_fixed_sequence(&mut second).unwrap()
            );
        }
    }

    #[test]
    fn test_examples_are_nested_and_closed_on_freeze() {
        let label = calc_label_from_name("outer");
        let mut data = ConjectureData::for_buffer(&[1, 2, 3]);
        data.start_example(label).unwrap();
        data.draw_bits(8, None).unwrap();
        data.start_example(label).unwrap();
        data.draw_bits(8, None).unwrap();
        // Both examples are left open
        data.freeze().unwrap();

        let result = data.as_result();
        let top = &result.examples[0];
        assert_eq!((top.start, top.end, top.depth), (0, 2, 0));
        for example in &result.examples {
            assert!(example.start <= example.end && example.end <= 2);
            if let Some(parent) = example.parent {
                let parent = &result.examples[parent];
                assert!(parent.start <= example.start && example.end <= parent.end);
                assert_eq!(parent.depth + 1, example.depth);
            }
        }
        let outer: Vec<_> = result.examples.iter().filter(|e| e.label == label).collect();
        assert_eq!(outer.len(), 2);
        assert_eq!((outer[0].start, outer[0].end), (0, 2));
        assert_eq!((outer[1].start, outer[1].end), (1, 2));
    }

    #[test]
    fn test_discarded_examples_are_tracked() {
        let mut data = ConjectureData::for_buffer(&[0, 5]);
        data.start_example(1).unwrap();
        data.draw_bits(8, None).unwrap();
        data.stop_example(true).unwrap();
        data.freeze().unwrap();
        let result = data.as_result();
        assert!(result.has_discards);
        let discarded = result.examples.iter().find(|e| e.label == 1).unwrap();
        assert!(discarded.discarded && discarded.trivial);
    }

    #[test]
    fn test_unbalanced_stop_example_is_ignored() {
        let mut data = ConjectureData::for_buffer(&[5]);
        assert_eq!(data.stop_example(true), Ok(()));
        assert_eq!(data.draw_bits(8, None), Ok(5));
        assert_eq!(data.stop_example(false), Ok(()));
        data.freeze().unwrap();
        let result = data.as_result();
        assert!(!result.has_discards);
        assert_eq!(result.examples[0].start, 0);
        assert_eq!(result.examples[0].end, 1);
        assert_eq!(result.examples.len(), 2);
    }

    #[test]
    fn test_max_depth_marks_invalid() {
        let mut data = ConjectureData::for_buffer(&[]).with_max_depth(2);
        data.start_example(1).unwrap();
        data.start_example(1).unwrap();
        assert!(matches!(data.start_example(1), Err(DataError::StopTest { .. })));
        assert_eq!(data.status(), Status::Invalid);
    }

    #[test]
    fn test_target_observations() {
        let mut data = ConjectureData::for_buffer(&[]);
        data.target("score", 1.5).unwrap();
        assert!(matches!(data.target("score", 2.0), Err(DataError::InvalidArgument(_))));
        data.target("other", -1.0).unwrap();
        data.freeze().unwrap();
        assert_eq!(data.as_result().target_observations.len(), 2);
        assert_eq!(data.target("late", 0.0), Err(DataError::Frozen));
    }

    #[test]
    fn test_generating_source_extends_past_prefix() {
        let params = GenerationParameters::new(create_seeded_rng(4));
        let source = ByteSource::generating(&[9], 100, params);
        let mut data = ConjectureData::new(source, Box::new(NoopObserver));
        assert_eq!(data.draw_bits(8, None), Ok(9));
        for _ in 0..10 {
            data.draw_bits(32, None).unwrap();
        }
        assert_eq!(data.buffer().len(), 41);
    }
}
