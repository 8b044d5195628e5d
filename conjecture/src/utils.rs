//! Small helpers shared by the data, tree and shrinking modules.

use std::convert::Infallible;

use rand::Rng;
use sha2::{Digest, Sha256};

/// Number of bytes needed to hold `n_bits` bits
pub fn bits_to_bytes(n_bits: u32) -> usize {
    n_bits.div_ceil(8) as usize
}

/// Big-endian decode. Bytes beyond the low 8 shift out of the result.
pub fn int_from_bytes(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Big-endian encode of `value` into exactly `size` bytes.
///
/// Bits of `value` that do not fit into `size` bytes are dropped.
pub fn int_to_bytes(value: u64, size: usize) -> Vec<u8> {
    let mut result = vec![0u8; size];
    let be = value.to_be_bytes();
    let n = size.min(8);
    result[size - n..].copy_from_slice(&be[8 - n..]);
    result
}

/// Shortlex ordering key: shorter buffers first, then lexicographic
pub fn sort_key(buffer: &[u8]) -> (usize, &[u8]) {
    (buffer.len(), buffer)
}

/// Apply non-overlapping `(start, end, bytes)` replacements to `buffer`.
///
/// Replacements may change the length of the buffer. They are applied in
/// order of their start index.
pub fn replace_all(buffer: &[u8], replacements: &[(usize, usize, Vec<u8>)]) -> Vec<u8> {
    let mut sorted: Vec<&(usize, usize, Vec<u8>)> = replacements.iter().collect();
    sorted.sort_by_key(|(start, _, _)| *start);

    let mut result = Vec::with_capacity(buffer.len());
    let mut prev = 0;
    for (start, end, bytes) in sorted {
        debug_assert!(*start >= prev && start <= end && *end <= buffer.len());
        result.extend_from_slice(&buffer[prev..*start]);
        result.extend_from_slice(bytes);
        prev = *end;
    }
    result.extend_from_slice(&buffer[prev..]);
    result
}

/// Find a (hopefully large) `n` such that `f(n)` is true and `f(n + 1)` is false.
///
/// `f(0)` is assumed true and never checked. Small answers cost a linear
/// scan; larger ones are found by exponential search and bisection.
pub fn find_integer(mut f: impl FnMut(usize) -> bool) -> usize {
    match try_find_integer(|n| Ok::<bool, Infallible>(f(n))) {
        Ok(n) => n,
        Err(never) => match never {},
    }
}

/// [`find_integer`] for predicates that can fail.
pub fn try_find_integer<E>(mut f: impl FnMut(usize) -> Result<bool, E>) -> Result<usize, E> {
    for i in 1..5 {
        if !f(i)? {
            return Ok(i - 1);
        }
    }

    let mut lo = 4;
    let mut hi = 5;
    while f(hi)? {
        lo = hi;
        hi *= 2;
    }

    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if f(mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Binary search in `[lo, hi)` for `n` with `f(n) == f(lo)` and `f(n + 1) != f(lo)`.
///
/// Assumes without checking that `f(hi) != f(lo)`.
pub fn binary_search(mut lo: usize, mut hi: usize, mut f: impl FnMut(usize) -> bool) -> usize {
    let reference = f(lo);
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if f(mid) == reference {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Remove and return a uniformly chosen element in O(1), disturbing order.
pub fn pop_random<T, R: Rng + ?Sized>(rng: &mut R, values: &mut Vec<T>) -> Option<T> {
    if values.is_empty() {
        return None;
    }
    let i = rng.gen_range(0..values.len());
    Some(values.swap_remove(i))
}

/// Stable 64-bit label for a named region of a test case
pub fn calc_label_from_name(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    int_from_bytes(&digest[..8])
}

/// Combine several labels into one, order-sensitively
pub fn combine_labels(labels: &[u64]) -> u64 {
    labels
        .iter()
        .fold(0u64, |label, &l| label.rotate_left(1) ^ l)
}
