//! Pareto front of valid and interesting test cases.
//!
//! A result dominates another when it is at least as good in every way:
//! shortlex-smaller buffer, status at least as high, the same interesting
//! origin, and no target score lower than the other's.

use std::rc::Rc;

use crate::data::{ConjectureResult, Status};
use crate::utils::sort_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominanceRelation {
    NoDominance,
    Equal,
    LeftDominates,
    RightDominates,
}

/// Dominance relation between `left` and `right`
pub fn dominance(left: &ConjectureResult, right: &ConjectureResult) -> DominanceRelation {
    if left.buffer == right.buffer {
        return DominanceRelation::Equal;
    }
    if sort_key(&right.buffer) < sort_key(&left.buffer) {
        return match dominance(right, left) {
            DominanceRelation::LeftDominates => DominanceRelation::RightDominates,
            other => other,
        };
    }

    // `left` is shortlex-smaller, so it either dominates or is incomparable
    if left.status < right.status {
        return DominanceRelation::NoDominance;
    }
    if left.status == Status::Interesting && left.interesting_origin != right.interesting_origin {
        return DominanceRelation::NoDominance;
    }
    for (target, score) in &right.target_observations {
        match left.target_observations.get(target) {
            Some(left_score) if left_score >= score => {}
            _ => return DominanceRelation::NoDominance,
        }
    }
    DominanceRelation::LeftDominates
}

/// Exact Pareto front, kept in shortlex order of buffers.
///
/// Only results with status at least `Valid` are admitted.
#[derive(Debug, Default)]
pub struct ParetoFront {
    front: Vec<Rc<ConjectureResult>>,
}

impl ParetoFront {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.front.len()
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<ConjectureResult>> {
        self.front.iter()
    }

    pub fn contains(&self, buffer: &[u8]) -> bool {
        self.position(buffer).is_ok()
    }

    fn position(&self, buffer: &[u8]) -> Result<usize, usize> {
        self.front
            .binary_search_by(|existing| sort_key(&existing.buffer).cmp(&sort_key(buffer)))
    }

    /// Try to add `result` to the front.
    ///
    /// Returns `None` if it was rejected, because it is below `Valid`, is
    /// already present, or is dominated. Otherwise returns the members it
    /// displaced.
    pub fn add(&mut self, result: Rc<ConjectureResult>) -> Option<Vec<Rc<ConjectureResult>>> {
        if result.status < Status::Valid {
            return None;
        }
        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(self.front.len() + 1);
        for existing in &self.front {
            match dominance(existing, &result) {
                DominanceRelation::Equal | DominanceRelation::LeftDominates => return None,
                DominanceRelation::RightDominates => evicted.push(Rc::clone(existing)),
                DominanceRelation::NoDominance => kept.push(Rc::clone(existing)),
            }
        }
        self.front = kept;
        match self.position(&result.buffer) {
            Ok(_) => return None,
            Err(i) => self.front.insert(i, result),
        }
        Some(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(buffer: &[u8], status: Status, targets: &[(&str, f64)]) -> Rc<ConjectureResult> {
        let mut result = ConjectureResult::overrun();
        result.buffer = buffer.to_vec();
        result.status = status;
        for (label, score) in targets {
            result.target_observations.insert(label.to_string(), *score);
        }
        Rc::new(result)
    }

    #[test]
    fn test_smaller_valid_dominates() {
        let left = result(&[0], Status::Valid, &[]);
        let right = result(&[1, 0], Status::Valid, &[]);
        assert_eq!(dominance(&left, &right), DominanceRelation::LeftDominates);
        assert_eq!(dominance(&right, &left), DominanceRelation::RightDominates);
        assert_eq!(dominance(&left, &left), DominanceRelation::Equal);
    }

    #[test]
    fn test_higher_score_prevents_dominance() {
        let small = result(&[0], Status::Valid, &[("x", 1.0)]);
        let large = result(&[5, 5], Status::Valid, &[("x", 2.0)]);
        assert_eq!(dominance(&small, &large), DominanceRelation::NoDominance);

        let unscored = result(&[0], Status::Valid, &[]);
        assert_eq!(dominance(&unscored, &large), DominanceRelation::NoDominance);
    }

    #[test]
    fn test_higher_status_prevents_dominance() {
        let valid = result(&[0], Status::Valid, &[]);
        let interesting = result(&[1], Status::Interesting, &[]);
        assert_eq!(dominance(&valid, &interesting), DominanceRelation::NoDominance);
    }

    #[test]
    fn test_different_origins_are_incomparable() {
        let mut a = ConjectureResult::overrun();
        a.buffer = vec![0];
        a.status = Status::Interesting;
        a.interesting_origin = Some(crate::data::InterestingOrigin::new("a"));
        let mut b = a.clone();
        b.buffer = vec![1];
        b.interesting_origin = Some(crate::data::InterestingOrigin::new("b"));
        assert_eq!(dominance(&a, &b), DominanceRelation::NoDominance);
    }

    #[test]
    fn test_front_rejects_invalid_and_duplicates() {
        let mut front = ParetoFront::new();
        assert!(front.add(result(&[1], Status::Invalid, &[])).is_none());
        assert_eq!(front.add(result(&[1], Status::Valid, &[])), Some(vec![]));
        assert!(front.add(result(&[1], Status::Valid, &[])).is_none());
        assert_eq!(front.len(), 1);
    }

    #[test]
    fn test_front_evicts_dominated() {
        let mut front = ParetoFront::new();
        front.add(result(&[3, 3], Status::Valid, &[("x", 1.0)]));
        front.add(result(&[2, 2], Status::Valid, &[("y", 1.0)]));
        assert_eq!(front.len(), 2);

        let evicted = front
            .add(result(&[1], Status::Valid, &[("x", 1.0), ("y", 1.0)]))
            .unwrap();
        assert_eq!(evicted.len(), 2);
        assert_eq!(front.len(), 1);
        assert!(front.contains(&[1]));
    }

    #[test]
    fn test_front_is_mutually_non_dominating() {
        let mut front = ParetoFront::new();
        for i in 0..20u8 {
            let score = f64::from(i % 7);
            front.add(result(&[i, i], Status::Valid, &[("x", score)]));
            front.add(result(&[i], Status::Valid, &[("y", f64::from(i))]));
        }
        let members: Vec<_> = front.iter().cloned().collect();
        for a in &members {
            for b in &members {
                if !Rc::ptr_eq(a, b) {
                    assert_eq!(dominance(a, b), DominanceRelation::NoDominance);
                }
            }
        }
        for pair in members.windows(2) {
            assert!(sort_key(&pair[0].buffer) < sort_key(&pair[1].buffer));
        }
    }
}
