//! Generic shrinkers over a value and an acceptance predicate.
//!
//! Every shrinker owns a [`ShrinkCore`] holding the best value found so far,
//! the predicate, and a memo of values already tried. Predicates are
//! fallible so that a caller can abort a shrink (budget exhausted, test
//! halted) with the best-known value intact. For infallible predicates use
//! `Infallible` as the error type.

use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;

use num_traits::{PrimInt, Unsigned};

pub mod integer;
pub mod length;
pub mod lexical;

pub use integer::{Integer, shrink_towards};
pub use length::Length;
pub use lexical::Minimizer;

/// Shared state of a shrinker: the current best value and the predicate.
pub struct ShrinkCore<T, E, F> {
    current: T,
    predicate: F,
    better: fn(&T, &T) -> bool,
    seen: HashSet<T>,
    changes: usize,
    calls: usize,
    _error: PhantomData<fn() -> E>,
}

impl<T, E, F> ShrinkCore<T, E, F>
where
    T: Clone + Eq + Hash,
    F: FnMut(&T) -> Result<bool, E>,
{
    /// `better(left, right)` must hold when `left` is strictly simpler than `right`
    pub fn new(initial: T, predicate: F, better: fn(&T, &T) -> bool) -> Self {
        Self {
            current: initial,
            predicate,
            better,
            seen: HashSet::new(),
            changes: 0,
            calls: 0,
            _error: PhantomData,
        }
    }

    pub fn current(&self) -> &T {
        &self.current
    }

    pub fn into_current(self) -> T {
        self.current
    }

    /// Number of accepted improvements
    pub fn changes(&self) -> usize {
        self.changes
    }

    /// Number of predicate evaluations
    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Try `value` as a replacement for the current value.
    ///
    /// Values that are not strictly better, or that were tried before, are
    /// rejected without calling the predicate.
    pub fn incorporate(&mut self, value: T) -> Result<bool, E> {
        if !(self.better)(&value, &self.current) || self.seen.contains(&value) {
            return Ok(false);
        }
        self.seen.insert(value.clone());
        self.calls += 1;
        if (self.predicate)(&value)? {
            self.changes += 1;
            self.current = value;
            return Ok(true);
        }
        Ok(false)
    }

    /// Like `incorporate`, but the current value itself counts as accepted
    pub fn consider(&mut self, value: T) -> Result<bool, E> {
        if value == self.current {
            return Ok(true);
        }
        self.incorporate(value)
    }
}

/// Common driver loop of the shrinkers in this module.
pub trait Shrinker {
    type Value;
    type Error;

    /// Accepted improvements so far
    fn changes(&self) -> usize;

    /// Whether `run` should iterate to a fixed point
    fn full(&self) -> bool;

    /// Cheap attempts made before the main loop. Returning true ends the run.
    fn short_circuit(&mut self) -> Result<bool, Self::Error>;

    /// One pass of the main loop
    fn run_step(&mut self) -> Result<(), Self::Error>;

    fn current(&self) -> &Self::Value;

    fn into_current(self) -> Self::Value;

    /// Improve the current value. In full mode, repeat until a step changes nothing.
    fn run(&mut self) -> Result<(), Self::Error> {
        if self.short_circuit()? {
            return Ok(());
        }
        if self.full() {
            let mut prev = None;
            while prev != Some(self.changes()) {
                prev = Some(self.changes());
                self.run_step()?;
            }
        } else {
            self.run_step()?;
        }
        Ok(())
    }
}

/// Smallest `x <= c` with `f(x)` true, assuming `f(c)` holds.
///
/// Tries 0, 1, `c - 1` and `c - 2` directly and then bisects, betting that
/// `f` is monotone below `c`.
pub fn minimize_int<T, E>(c: T, mut f: impl FnMut(T) -> Result<bool, E>) -> Result<T, E>
where
    T: PrimInt + Unsigned,
{
    let one = T::one();
    let two = one + one;
    if c.is_zero() || f(T::zero())? {
        return Ok(T::zero());
    }
    if c == one || f(one)? {
        return Ok(one);
    }
    if c == two {
        return Ok(two);
    }
    let mut hi = if f(c - one)? {
        c - one
    } else if f(c - two)? {
        c - two
    } else {
        return Ok(c);
    };
    let mut lo = one;
    while lo + one < hi {
        let mid = lo + (hi - lo) / two;
        if f(mid)? {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Ok(hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn ok(b: bool) -> Result<bool, Infallible> {
        Ok(b)
    }

    #[test]
    fn test_minimize_int_finds_threshold() {
        assert_eq!(minimize_int(200u8, |x| ok(x >= 37)), Ok(37));
        assert_eq!(minimize_int(200u64, |x| ok(x >= 199)), Ok(199));
        assert_eq!(minimize_int(5u32, |_| ok(true)), Ok(0));
        assert_eq!(minimize_int(0u16, |_| ok(false)), Ok(0));
    }

    #[test]
    fn test_minimize_int_stops_when_neighbours_fail() {
        assert_eq!(minimize_int(100u8, |x| ok(x == 100)), Ok(100));
    }

    #[test]
    fn test_minimize_int_propagates_errors() {
        let result: Result<u8, &str> =
            minimize_int(50, |x| if x < 10 { Ok(false) } else { Err("stop") });
        assert_eq!(result, Err("stop"));
    }

    #[test]
    fn test_core_skips_seen_and_worse_values() {
        let mut calls = 0;
        let mut core = ShrinkCore::new(10u32, |_: &u32| {
            calls += 1;
            ok(false)
        }, |a, b| a < b);
        assert_eq!(core.incorporate(12), Ok(false));
        assert_eq!(core.incorporate(5), Ok(false));
        assert_eq!(core.incorporate(5), Ok(false));
        assert_eq!(core.consider(10), Ok(true));
        assert_eq!(core.calls(), 1);
        drop(core);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_core_tolerates_flaky_predicate() {
        let mut flip = false;
        let mut core = ShrinkCore::new(10u32, |_: &u32| {
            flip = !flip;
            ok(flip)
        }, |a, b| a < b);
        assert_eq!(core.incorporate(4), Ok(true));
        assert_eq!(core.incorporate(3), Ok(false));
        assert_eq!(*core.current(), 4);
        assert_eq!(core.changes(), 1);
    }
}
