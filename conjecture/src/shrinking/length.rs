//! Deleting elements from a sequence while a predicate still holds.
//!
//! Finding the shortest accepted subsequence is exponential in general.
//! [`Length`] instead makes linearly many predicate calls per pass and,
//! at a fixed point, guarantees that no single element and no adjacent pair
//! of elements can be deleted.

use std::hash::Hash;

use rand::Rng;

use super::{ShrinkCore, Shrinker};
use crate::utils::{pop_random, try_find_integer};

pub struct Length<'r, T, E, F, R: ?Sized> {
    core: ShrinkCore<Vec<T>, E, F>,
    random: &'r mut R,
    full: bool,
}

impl<'r, T, E, F, R> Length<'r, T, E, F, R>
where
    T: Clone + Eq + Hash,
    F: FnMut(&Vec<T>) -> Result<bool, E>,
    R: Rng + ?Sized,
{
    pub fn new(initial: Vec<T>, predicate: F, random: &'r mut R, full: bool) -> Self {
        Self {
            core: ShrinkCore::new(initial, predicate, |left, right| left.len() < right.len()),
            random,
            full,
        }
    }

    /// Shrink `initial` and return the shortest accepted sequence found
    pub fn shrink(
        initial: Vec<T>,
        predicate: F,
        random: &'r mut R,
        full: bool,
    ) -> Result<Vec<T>, E> {
        let mut shrinker = Self::new(initial, predicate, random, full);
        shrinker.run()?;
        Ok(shrinker.into_current())
    }

    pub fn calls(&self) -> usize {
        self.core.calls()
    }

    /// Delete as long a run as possible starting at `position`.
    ///
    /// Returns the number of elements removed.
    fn delete_run_at(&mut self, position: usize) -> Result<usize, E> {
        let base = self.core.current().clone();
        let mut accepted = 0;
        try_find_integer(|k| {
            if position + k > base.len() {
                return Ok(false);
            }
            let mut candidate = base[..position].to_vec();
            candidate.extend_from_slice(&base[position + k..]);
            let ok = self.core.consider(candidate)?;
            if ok {
                accepted = accepted.max(k);
            }
            Ok(ok)
        })?;
        Ok(accepted)
    }

    fn delete_pair_at(&mut self, position: usize) -> Result<bool, E> {
        let current = self.core.current();
        if position + 2 > current.len() {
            return Ok(false);
        }
        let mut candidate = current[..position].to_vec();
        candidate.extend_from_slice(&current[position + 2..]);
        self.core.consider(candidate)
    }
}

impl<T, E, F, R> Shrinker for Length<'_, T, E, F, R>
where
    T: Clone + Eq + Hash,
    F: FnMut(&Vec<T>) -> Result<bool, E>,
    R: Rng + ?Sized,
{
    type Value = Vec<T>;
    type Error = E;

    fn changes(&self) -> usize {
        self.core.changes()
    }

    fn full(&self) -> bool {
        self.full
    }

    fn short_circuit(&mut self) -> Result<bool, E> {
        Ok(self.core.consider(Vec::new())? || self.core.current().len() <= 1)
    }

    /// One pass over every element in random order.
    ///
    /// Elements are tracked by their position at the start of the pass so
    /// that deletions do not disturb the candidate set. An element that
    /// could not be deleted is not tried again until the next pass.
    fn run_step(&mut self) -> Result<(), E> {
        let mut live: Vec<usize> = (0..self.core.current().len()).collect();
        let mut candidates = live.clone();

        while let Some(element) = pop_random(self.random, &mut candidates) {
            let Ok(position) = live.binary_search(&element) else {
                continue;
            };
            let removed = self.delete_run_at(position)?;
            if removed > 0 {
                live.drain(position..position + removed);
                continue;
            }
            if self.delete_pair_at(position)? {
                live.drain(position..position + 2);
            }
        }
        Ok(())
    }

    fn current(&self) -> &Vec<T> {
        self.core.current()
    }

    fn into_current(self) -> Vec<T> {
        self.core.into_current()
    }
}
