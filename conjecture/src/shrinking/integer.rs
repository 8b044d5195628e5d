//! Shrinking unsigned integers towards zero or towards a target.

use std::hash::Hash;

use num_traits::{PrimInt, Unsigned};

use super::{ShrinkCore, Shrinker};
use crate::utils::try_find_integer;

/// Shrinks an unsigned integer towards zero.
///
/// Tries masking off high bits, shifting right, and subtracting multiples
/// of small constants, each sized with `find_integer`.
pub struct Integer<T, E, F> {
    core: ShrinkCore<T, E, F>,
    full: bool,
}

impl<T, E, F> Integer<T, E, F>
where
    T: PrimInt + Unsigned + Hash,
    F: FnMut(&T) -> Result<bool, E>,
{
    pub fn new(initial: T, predicate: F, full: bool) -> Self {
        Self {
            core: ShrinkCore::new(initial, predicate, |left, right| left < right),
            full,
        }
    }

    /// Run to completion and return the smallest accepted value
    pub fn shrink(initial: T, predicate: F, full: bool) -> Result<T, E> {
        let mut shrinker = Self::new(initial, predicate, full);
        shrinker.run()?;
        Ok(shrinker.into_current())
    }

    pub fn calls(&self) -> usize {
        self.core.calls()
    }

    fn bit_length(&self) -> usize {
        let bits = T::zero().count_zeros() as usize;
        bits - self.core.current().leading_zeros() as usize
    }

    fn mask_high_bits(&mut self) -> Result<(), E> {
        let base = *self.core.current();
        let n = self.bit_length();
        try_find_integer(|k| {
            if k >= n {
                return Ok(false);
            }
            let mask = (T::one() << (n - k)) - T::one();
            self.core.consider(base & mask)
        })?;
        Ok(())
    }

    fn shift_right(&mut self) -> Result<(), E> {
        let base = *self.core.current();
        let size = self.bit_length();
        try_find_integer(|k| {
            if k > size {
                return Ok(false);
            }
            let shifted = if k >= T::zero().count_zeros() as usize {
                T::zero()
            } else {
                base >> k
            };
            self.core.consider(shifted)
        })?;
        Ok(())
    }

    fn shrink_by_multiples(&mut self, k: T) -> Result<(), E> {
        let base = *self.core.current();
        try_find_integer(|n| {
            let attempt = T::from(n)
                .and_then(|n| n.checked_mul(&k))
                .and_then(|delta| base.checked_sub(&delta));
            match attempt {
                Some(attempt) => self.core.consider(attempt),
                None => Ok(false),
            }
        })?;
        Ok(())
    }
}

impl<T, E, F> Shrinker for Integer<T, E, F>
where
    T: PrimInt + Unsigned + Hash,
    F: FnMut(&T) -> Result<bool, E>,
{
    type Value = T;
    type Error = E;

    fn changes(&self) -> usize {
        self.core.changes()
    }

    fn full(&self) -> bool {
        self.full
    }

    fn short_circuit(&mut self) -> Result<bool, E> {
        for i in [T::zero(), T::one()] {
            if self.core.consider(i)? {
                return Ok(true);
            }
        }
        self.mask_high_bits()?;
        let size = self.bit_length();
        if size > 8 {
            // See if the value fits into a single byte
            let base = *self.core.current();
            self.core.consider(base >> (size - 8))?;
            self.core.consider(base & T::from(0xFFu8).unwrap_or_else(T::max_value))?;
        }
        Ok(*self.core.current() == T::one() + T::one())
    }

    fn run_step(&mut self) -> Result<(), E> {
        self.shift_right()?;
        let two = T::one() + T::one();
        self.shrink_by_multiples(two)?;
        self.shrink_by_multiples(T::one())
    }

    fn current(&self) -> &T {
        self.core.current()
    }

    fn into_current(self) -> T {
        self.core.into_current()
    }
}

/// Move `current` as close to `target` as `predicate` allows.
///
/// `predicate(current)` is assumed true. If `target` itself is rejected,
/// bisects between the two on the assumption that the predicate is monotone
/// in that range. The assumption is not checked.
pub fn shrink_towards<T, E>(
    current: T,
    target: T,
    mut predicate: impl FnMut(T) -> Result<bool, E>,
) -> Result<T, E>
where
    T: PrimInt,
{
    if current == target || predicate(target)? {
        return Ok(target);
    }
    // `bad` is rejected and `good` is accepted, with no known boundary between
    let (mut bad, mut good) = (target, current);
    loop {
        // Floor of the average, without forming `bad + good` or `good - bad`
        let mid = (bad & good) + ((bad ^ good) >> 1);
        if mid == bad || mid == good {
            return Ok(good);
        }
        if predicate(mid)? {
            good = mid;
        } else {
            bad = mid;
        }
    }
}
