//! Lexicographic minimisation of fixed-length byte blocks.
//!
//! Given a block and a predicate accepting it, [`Minimizer`] searches for a
//! lexicographically smaller block of the same length that the predicate
//! still accepts. When run to a fixed point it guarantees that:
//!
//! 1. the lexicographic predecessor of the result is rejected, and
//! 2. no single byte of the result can be lowered on its own.

use super::{ShrinkCore, Shrinker, minimize_int};

/// Blocks up to this many bytes are minimised as a single integer
const MAX_INTEGER_BYTES: usize = 16;

pub struct Minimizer<E, F> {
    core: ShrinkCore<Vec<u8>, E, F>,
    size: usize,
    full: bool,
}

impl<E, F> Minimizer<E, F>
where
    F: FnMut(&Vec<u8>) -> Result<bool, E>,
{
    pub fn new(initial: &[u8], predicate: F, full: bool) -> Self {
        Self {
            core: ShrinkCore::new(initial.to_vec(), predicate, |left, right| left < right),
            size: initial.len(),
            full,
        }
    }

    /// Minimise `initial` and return the best block found
    pub fn shrink(initial: &[u8], predicate: F, full: bool) -> Result<Vec<u8>, E> {
        let mut minimizer = Self::new(initial, predicate, full);
        minimizer.run()?;
        Ok(minimizer.into_current())
    }

    pub fn calls(&self) -> usize {
        self.core.calls()
    }

    fn incorporate(&mut self, buffer: Vec<u8>) -> Result<bool, E> {
        debug_assert_eq!(buffer.len(), self.size);
        self.core.incorporate(buffer)
    }

    fn block(&self) -> &[u8] {
        self.core.current()
    }

    fn sort(&mut self) -> Result<bool, E> {
        let mut sorted = self.block().to_vec();
        sorted.sort_unstable();
        self.incorporate(sorted)
    }

    /// Shift individual bytes right as far as they go
    fn shift(&mut self) -> Result<(), E> {
        let mut prev = None;
        while prev != Some(self.core.changes()) {
            prev = Some(self.core.changes());
            for i in 0..self.size {
                let mut block = self.block().to_vec();
                let c = block[i];
                let bit_length = 8 - c.leading_zeros();
                for k in (1..=bit_length).rev() {
                    block[i] = c.checked_shr(k).unwrap_or(0);
                    if self.incorporate(block.clone())? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Lower each byte independently
    fn shrink_indices(&mut self) -> Result<(), E> {
        for i in 0..self.size {
            let prefix = self.block()[..i].to_vec();
            let suffix = self.block()[i + 1..].to_vec();
            let c = self.block()[i];
            minimize_int(c, |b| {
                if self.core.current()[i] == b {
                    return Ok(true);
                }
                let mut candidate = prefix.clone();
                candidate.push(b);
                candidate.extend_from_slice(&suffix);
                self.incorporate(candidate)
            })?;
        }
        Ok(())
    }

    /// Move a prefix of the significant bytes to the end
    fn rotate_suffixes(&mut self) -> Result<(), E> {
        let Some(significant) = self.block().iter().position(|&b| b != 0) else {
            return Ok(());
        };
        for i in 1..self.size - significant {
            let current = self.block();
            let mut rotated = vec![0u8; significant];
            rotated.extend_from_slice(&current[significant + i..]);
            rotated.extend_from_slice(&current[significant..significant + i]);
            if rotated.as_slice() < current {
                self.incorporate(rotated)?;
            }
        }
        Ok(())
    }

    /// Treat the whole block as one big-endian integer and lower it
    fn minimize_as_integer(&mut self) -> Result<(), E> {
        let size = self.size;
        if size > MAX_INTEGER_BYTES {
            if let Some(predecessor) = predecessor(self.block()) {
                self.incorporate(predecessor)?;
            }
            return Ok(());
        }
        let value = bytes_to_u128(self.block());
        minimize_int(value, |c| {
            if bytes_to_u128(self.core.current()) == c {
                return Ok(true);
            }
            self.incorporate(u128_to_bytes(c, size))
        })?;
        Ok(())
    }

    /// Bubble out-of-order neighbours without carrying values across
    /// positions that refuse to move
    fn partial_sort(&mut self) -> Result<bool, E> {
        let mut any_sorting_done = false;
        let mut ps = self.block().to_vec();
        for i in 0..self.size.saturating_sub(1) {
            let mut j = i + 1;
            while j > 0 && ps[j - 1] > ps[j] {
                ps.swap(j, j - 1);
                if self.incorporate(ps.clone())? {
                    any_sorting_done = true;
                } else {
                    ps.swap(j, j - 1);
                }
                j -= 1;
            }
        }
        Ok(any_sorting_done)
    }
}

impl<E, F> Shrinker for Minimizer<E, F>
where
    F: FnMut(&Vec<u8>) -> Result<bool, E>,
{
    type Value = Vec<u8>;
    type Error = E;

    fn changes(&self) -> usize {
        self.core.changes()
    }

    fn full(&self) -> bool {
        self.full
    }

    fn short_circuit(&mut self) -> Result<bool, E> {
        if self.block().iter().all(|&b| b == 0) {
            return Ok(true);
        }
        if self.size == 1 {
            self.minimize_as_integer()?;
            return Ok(true);
        }

        // The two smallest blocks of this length
        if self.incorporate(vec![0; self.size])? {
            return Ok(true);
        }
        let mut one = vec![0; self.size];
        one[self.size - 1] = 1;
        if self.incorporate(one)? {
            return Ok(true);
        }

        // Replace as long an initial segment with zeros as we can find.
        // The property is not monotone, so this only finds some such segment.
        let base = self.block().to_vec();
        let can_zero = base.iter().take_while(|&&b| b == 0).count();
        binsearch(can_zero, self.size, |mid| {
            let mut candidate = vec![0; mid];
            candidate.extend_from_slice(&base[mid..]);
            self.core.consider(candidate)
        })?;

        let base = self.block().to_vec();
        let size = self.size;
        binsearch(0, size, |mid| {
            if mid == 0 {
                return Ok(true);
            }
            if mid == size {
                return Ok(false);
            }
            let mut candidate = vec![0; mid];
            candidate.extend_from_slice(&base[..size - mid]);
            self.core.consider(candidate)
        })?;
        Ok(false)
    }

    fn run_step(&mut self) -> Result<(), E> {
        self.sort()?;
        self.shift()?;
        self.shrink_indices()?;
        self.rotate_suffixes()?;
        self.minimize_as_integer()?;
        self.partial_sort()?;
        Ok(())
    }

    fn current(&self) -> &Vec<u8> {
        self.core.current()
    }

    fn into_current(self) -> Vec<u8> {
        self.core.into_current()
    }
}

/// Find the point between `lo` and `hi` where `f` changes value, for its
/// side effects on the shrinker. Does nothing if `f(lo) == f(hi)`.
fn binsearch<E>(
    mut lo: usize,
    mut hi: usize,
    mut f: impl FnMut(usize) -> Result<bool, E>,
) -> Result<(), E> {
    let lo_value = f(lo)?;
    let hi_value = f(hi)?;
    if lo_value == hi_value {
        return Ok(());
    }
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if f(mid)? == lo_value {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(())
}

fn bytes_to_u128(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0u128, |acc, &b| (acc << 8) | u128::from(b))
}

fn u128_to_bytes(value: u128, size: usize) -> Vec<u8> {
    let be = value.to_be_bytes();
    be[be.len() - size..].to_vec()
}

/// The largest block of the same length that is smaller than `bytes`
fn predecessor(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut result = bytes.to_vec();
    for byte in result.iter_mut().rev() {
        if *byte > 0 {
            *byte -= 1;
            return Some(result);
        }
        *byte = 0xFF;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn minimize(initial: &[u8], mut f: impl FnMut(&[u8]) -> bool) -> Vec<u8> {
        let result: Result<Vec<u8>, Infallible> =
            Minimizer::shrink(initial, |b: &Vec<u8>| Ok(f(b.as_slice())), true);
        match result {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    fn sum(bytes: &[u8]) -> u32 {
        bytes.iter().map(|&b| u32::from(b)).sum()
    }

    #[test]
    fn test_shrink_to_sum_threshold() {
        assert_eq!(minimize(&[0xFF; 8], |b| sum(b) > 10), vec![0, 0, 0, 0, 0, 0, 0, 11]);
    }

    #[test]
    fn test_shrink_to_zero() {
        assert_eq!(minimize(&[1, 2, 3], |_| true), vec![0, 0, 0]);
    }

    #[test]
    fn test_shrink_to_smallest_nonzero() {
        assert_eq!(minimize(&[9, 9, 9], |b| b.iter().any(|&x| x > 0)), vec![0, 0, 1]);
    }

    #[test]
    fn test_single_byte_uses_integer_search() {
        assert_eq!(minimize(&[200], |b| b[0] >= 37), vec![37]);
    }

    #[test]
    fn test_can_sort_bytes() {
        assert_eq!(
            minimize(&[5, 3, 1], |b| {
                let mut sorted = b.to_vec();
                sorted.sort();
                sorted == [1, 3, 5]
            }),
            vec![1, 3, 5]
        );
    }

    #[test]
    fn test_minimizes_wide_blocks() {
        let initial = vec![0xAB; 24];
        let result = minimize(&initial, |b| b[3] >= 4);
        let mut expected = vec![0u8; 24];
        expected[3] = 4;
        assert_eq!(result, expected);
    }

    #[test]
    fn test_fixed_point_guarantees() {
        let predicate = |b: &[u8]| u32::from(b[0]) * 3 + u32::from(b[1]) >= 100 && b[1] % 2 == 1;
        let result = minimize(&[0xFF, 0xFF], predicate);
        assert!(predicate(&result[..]));
        if let Some(previous) = predecessor(&result) {
            assert!(!predicate(&previous[..]));
        }
        for i in 0..result.len() {
            for lower in 0..result[i] {
                let mut candidate = result.clone();
                candidate[i] = lower;
                assert!(
                    !predicate(&candidate[..]),
                    "{:?} can be lowered to {:?}",
                    result,
                    candidate
                );
            }
        }
    }

    #[test]
    fn test_never_calls_predicate_twice_on_same_block() {
        let mut seen = std::collections::HashSet::new();
        minimize(&[0x80, 0x40, 0x20, 0x10], |b| {
            assert!(seen.insert(b.to_vec()), "duplicate call for {:?}", b);
            sum(b) > 50
        });
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(predecessor(&[1, 0]), Some(vec![0, 0xFF]));
        assert_eq!(predecessor(&[0, 0]), None);
    }
}
