//! Deterministic finite automata over bytes, and a shortlex indexer for
//! the languages they accept.
//!
//! [`Indexer`] numbers the accepted strings 0, 1, 2, ... in shortlex order
//! (shorter first, then lexicographically), so a bounded language can be
//! enumerated exhaustively or sampled by drawing an index.

use crate::error::ConjectureError;

/// One state: whether it accepts, and `(start, end, target)` byte ranges
/// (inclusive) with the state each range leads to. Bytes not covered by
/// any range lead to the dead state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfaState {
    pub accepting: bool,
    pub transitions: Vec<(u8, u8, usize)>,
}

/// Explicit DFA with state 0 as the start state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteDfa {
    states: Vec<DfaState>,
}

impl ConcreteDfa {
    /// Build a DFA from `(accepting, transitions)` pairs.
    ///
    /// Fails if there are no states, a range is reversed, ranges of one
    /// state overlap, or a transition targets a missing state.
    pub fn new(states: Vec<(bool, Vec<(u8, u8, usize)>)>) -> Result<Self, ConjectureError> {
        if states.is_empty() {
            return Err(ConjectureError::invalid_argument("a DFA needs a start state"));
        }
        let n = states.len();
        let mut built = Vec::with_capacity(n);
        for (i, (accepting, mut transitions)) in states.into_iter().enumerate() {
            transitions.sort_unstable();
            for &(start, end, target) in &transitions {
                if start > end {
                    return Err(ConjectureError::invalid_argument(format!(
                        "state {} has reversed range {}..={}",
                        i, start, end
                    )));
                }
                if target >= n {
                    return Err(ConjectureError::invalid_argument(format!(
                        "state {} transitions to missing state {}",
                        i, target
                    )));
                }
            }
            if transitions.windows(2).any(|w| w[0].1 >= w[1].0) {
                return Err(ConjectureError::invalid_argument(format!(
                    "state {} has overlapping transitions",
                    i
                )));
            }
            built.push(DfaState {
                accepting,
                transitions,
            });
        }
        Ok(Self { states: built })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[DfaState] {
        &self.states
    }

    pub fn is_accepting(&self, state: usize) -> bool {
        self.states[state].accepting
    }

    /// State reached from `state` on `c`, or `None` for the dead state
    pub fn transition(&self, state: usize, c: u8) -> Option<usize> {
        let transitions = &self.states[state].transitions;
        let i = transitions.partition_point(|&(start, _, _)| start <= c);
        let (start, end, target) = *transitions.get(i.checked_sub(1)?)?;
        (start <= c && c <= end).then_some(target)
    }

    /// Whether `s` is accepted
    pub fn matches(&self, s: &[u8]) -> bool {
        let mut state = 0;
        for &c in s {
            match self.transition(state, c) {
                Some(next) => state = next,
                None => return false,
            }
        }
        self.is_accepting(state)
    }

    /// For each state, whether some accepting state is reachable from it
    fn live_states(&self) -> Vec<bool> {
        let mut live: Vec<bool> = self.states.iter().map(|s| s.accepting).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (i, state) in self.states.iter().enumerate() {
                if !live[i] && state.transitions.iter().any(|&(_, _, j)| live[j]) {
                    live[i] = true;
                    changed = true;
                }
            }
        }
        live
    }

    /// Length of the longest accepted string, or `None` if the language is
    /// infinite
    pub fn max_length(&self) -> Option<usize> {
        #[derive(Clone, Copy, PartialEq)]
        enum Visit {
            New,
            Active,
            Done(usize),
        }

        fn longest(
            dfa: &ConcreteDfa,
            live: &[bool],
            visits: &mut [Visit],
            i: usize,
        ) -> Option<usize> {
            match visits[i] {
                Visit::Done(n) => return Some(n),
                Visit::Active => return None,
                Visit::New => {}
            }
            visits[i] = Visit::Active;
            let mut best = 0;
            for &(_, _, j) in &dfa.states[i].transitions {
                if live[j] {
                    best = best.max(longest(dfa, live, visits, j)? + 1);
                }
            }
            visits[i] = Visit::Done(best);
            Some(best)
        }

        let live = self.live_states();
        if !live[0] {
            return Some(0);
        }
        let mut visits = vec![Visit::New; self.states.len()];
        longest(self, &live, &mut visits, 0)
    }
}

/// Bijection between accepted strings of bounded length and `0..len()`,
/// in shortlex order.
#[derive(Debug, Clone)]
pub struct Indexer<'d> {
    dfa: &'d ConcreteDfa,
    max_length: usize,
    /// `counts[k][state]`: accepted strings of length `k` starting from `state`
    counts: Vec<Vec<u128>>,
    len: u128,
}

impl<'d> Indexer<'d> {
    /// Index the whole language, which must be finite
    pub fn new(dfa: &'d ConcreteDfa) -> Result<Self, ConjectureError> {
        let max_length = dfa.max_length().ok_or_else(|| {
            ConjectureError::invalid_argument("cannot index an infinite language without a bound")
        })?;
        Self::with_max_length(dfa, max_length)
    }

    /// Index the accepted strings of at most `max_length` bytes
    pub fn with_max_length(
        dfa: &'d ConcreteDfa,
        max_length: usize,
    ) -> Result<Self, ConjectureError> {
        let too_large = || ConjectureError::invalid_argument("language too large to index");
        let mut counts: Vec<Vec<u128>> = Vec::with_capacity(max_length + 1);
        counts.push(dfa.states.iter().map(|s| u128::from(s.accepting)).collect());
        for k in 1..=max_length {
            let previous = &counts[k - 1];
            let mut row = Vec::with_capacity(dfa.states.len());
            for state in &dfa.states {
                let mut total: u128 = 0;
                for &(start, end, target) in &state.transitions {
                    let width = u128::from(end - start) + 1;
                    let n = previous[target].checked_mul(width).ok_or_else(too_large)?;
                    total = total.checked_add(n).ok_or_else(too_large)?;
                }
                row.push(total);
            }
            counts.push(row);
        }
        let mut len: u128 = 0;
        for row in &counts {
            len = len.checked_add(row[0]).ok_or_else(too_large)?;
        }
        Ok(Self {
            dfa,
            max_length,
            counts,
            len,
        })
    }

    /// Number of indexed strings
    pub fn len(&self) -> u128 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Position of `s` in shortlex order, or `None` if it is not indexed
    pub fn index(&self, s: &[u8]) -> Option<u128> {
        if s.len() > self.max_length || !self.dfa.matches(s) {
            return None;
        }
        let mut index: u128 = self.counts[..s.len()].iter().map(|row| row[0]).sum();
        let mut state = 0;
        for (i, &c) in s.iter().enumerate() {
            let remaining = &self.counts[s.len() - i - 1];
            for &(start, end, target) in &self.dfa.states[state].transitions {
                if start >= c {
                    break;
                }
                let below = u128::from(end.min(c - 1) - start) + 1;
                index += below * remaining[target];
            }
            state = self.dfa.transition(state, c)?;
        }
        Some(index)
    }

    /// String at position `index` in shortlex order
    pub fn get(&self, mut index: u128) -> Option<Vec<u8>> {
        if index >= self.len {
            return None;
        }
        let mut length = 0;
        while index >= self.counts[length][0] {
            index -= self.counts[length][0];
            length += 1;
        }

        let mut result = Vec::with_capacity(length);
        let mut state = 0;
        for i in 0..length {
            let remaining = &self.counts[length - i - 1];
            let mut next = None;
            for &(start, end, target) in &self.dfa.states[state].transitions {
                let per_byte = remaining[target];
                if per_byte == 0 {
                    continue;
                }
                let block = per_byte * (u128::from(end - start) + 1);
                if index < block {
                    let offset = u8::try_from(index / per_byte).ok()?;
                    next = Some((start + offset, target));
                    index %= per_byte;
                    break;
                }
                index -= block;
            }
            let (c, target) = next?;
            result.push(c);
            state = target;
        }
        Some(result)
    }

    /// Every indexed string, in shortlex order
    pub fn iter(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        (0..self.len).map_while(|i| self.get(i))
    }
}
