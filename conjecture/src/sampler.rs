//! Weighted sampling with Vose's alias method.

use std::sync::LazyLock;

use rand::Rng;

use crate::data::ConjectureData;
use crate::error::{ConjectureError, DrawResult};
use crate::primitives::{biased_coin, integer_range};
use crate::utils::calc_label_from_name;

pub static SAMPLE_IN_SAMPLER_LABEL: LazyLock<u64> =
    LazyLock::new(|| calc_label_from_name("a sample() in Sampler"));

/// One row of the alias table: pick `base`, or `alternate` with `alternate_chance`.
#[derive(Debug, Clone, PartialEq)]
struct AliasEntry {
    base: usize,
    alternate: usize,
    alternate_chance: f64,
}

/// O(1) weighted sampler over `0..n`.
///
/// The table is sorted by `(base, alternate)` and every row has
/// `base <= alternate`, so lowering either of the two draws made by
/// [`Sampler::sample`] never raises the chosen index.
#[derive(Debug, Clone)]
pub struct Sampler {
    table: Vec<AliasEntry>,
}

impl Sampler {
    /// Build the alias table for `weights`.
    ///
    /// Requires at least two finite, non-negative weights, at least one of
    /// them nonzero.
    pub fn new(weights: &[f64]) -> Result<Self, ConjectureError> {
        let n = weights.len();
        if n < 2 {
            return Err(ConjectureError::invalid_argument(format!(
                "Sampler needs at least two weights, got {}",
                n
            )));
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConjectureError::invalid_argument(
                "Sampler weights must be finite and non-negative",
            ));
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(ConjectureError::invalid_argument(
                "Sampler needs at least one nonzero weight",
            ));
        }
        let heaviest = weights
            .iter()
            .enumerate()
            .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });

        let mut scaled: Vec<f64> = weights.iter().map(|w| w / total * n as f64).collect();
        let mut alternate: Vec<Option<usize>> = vec![None; n];
        let mut chance: Vec<Option<f64>> = vec![None; n];

        let mut small = Vec::new();
        let mut large = Vec::new();
        for (i, &p) in scaled.iter().enumerate() {
            if p == 1.0 {
                chance[i] = Some(0.0);
            } else if p < 1.0 {
                small.push(i);
            } else {
                large.push(i);
            }
        }
        // Pop the smallest indices first so that rows pair up deterministically
        small.reverse();
        large.reverse();

        while let (Some(&lo), Some(&hi)) = (small.last(), large.last()) {
            small.pop();
            large.pop();
            alternate[lo] = Some(hi);
            chance[lo] = Some(1.0 - scaled[lo]);
            scaled[hi] = (scaled[hi] + scaled[lo]) - 1.0;

            if scaled[hi] < 1.0 {
                insert_sorted_desc(&mut small, hi);
            } else if scaled[hi] == 1.0 {
                chance[hi] = Some(0.0);
            } else {
                insert_sorted_desc(&mut large, hi);
            }
        }
        for i in large {
            chance[i] = Some(0.0);
        }
        // Rounding can leave zero-weight rows unpaired; route them to the
        // heaviest index instead of letting them select themselves.
        for i in small {
            if weights[i] == 0.0 {
                alternate[i] = Some(heaviest);
                chance[i] = Some(1.0);
            } else {
                chance[i] = Some(0.0);
            }
        }

        let mut table: Vec<AliasEntry> = (0..n)
            .map(|i| {
                let mut entry = AliasEntry {
                    base: i,
                    alternate: alternate[i].unwrap_or(i),
                    alternate_chance: chance[i].unwrap_or(0.0),
                };
                if entry.alternate < entry.base {
                    std::mem::swap(&mut entry.base, &mut entry.alternate);
                    entry.alternate_chance = 1.0 - entry.alternate_chance;
                }
                entry
            })
            .collect();
        table.sort_by(|a, b| (a.base, a.alternate).cmp(&(b.base, b.alternate)));

        Ok(Self { table })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Draw an index from test-case data
    pub fn sample(&self, data: &mut ConjectureData) -> DrawResult<usize> {
        data.start_example(*SAMPLE_IN_SAMPLER_LABEL)?;
        let i = integer_range(data, 0, (self.table.len() - 1) as u64, None)? as usize;
        let entry = &self.table[i];
        let use_alternate = biased_coin(data, entry.alternate_chance)?;
        data.stop_example(false)?;
        Ok(if use_alternate {
            entry.alternate
        } else {
            entry.base
        })
    }

    /// Draw an index from a plain RNG
    pub fn sample_with_rng<R: Rng + ?Sized>(&self, random: &mut R) -> usize {
        let entry = &self.table[random.gen_range(0..self.table.len())];
        if random.r#gen::<f64>() < entry.alternate_chance {
            entry.alternate
        } else {
            entry.base
        }
    }
}

fn insert_sorted_desc(stack: &mut Vec<usize>, value: usize) {
    let position = stack.partition_point(|&x| x > value);
    stack.insert(position, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NoopObserver;
    use crate::rng::create_seeded_rng;
    use crate::source::{ByteSource, GenerationParameters};

    #[test]
    fn test_rejects_degenerate_weights() {
        assert!(Sampler::new(&[]).is_err());
        assert!(Sampler::new(&[1.0]).is_err());
        assert!(Sampler::new(&[0.0, 0.0]).is_err());
        assert!(Sampler::new(&[1.0, -1.0]).is_err());
        assert!(Sampler::new(&[1.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_table_invariants() {
        let sampler = Sampler::new(&[1.0, 5.0, 0.0, 2.0, 2.0]).unwrap();
        assert_eq!(sampler.len(), 5);
        for entry in &sampler.table {
            assert!(entry.base <= entry.alternate);
            assert!((0.0..=1.0).contains(&entry.alternate_chance));
        }
        let keys: Vec<_> = sampler.table.iter().map(|e| (e.base, e.alternate)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_never_returns_zero_weight_index() {
        let weights = [0.0, 3.0, 0.0, 1.0, 0.0, 0.5];
        let sampler = Sampler::new(&weights).unwrap();

        let mut rng = create_seeded_rng(7);
        for _ in 0..5000 {
            assert_ne!(weights[sampler.sample_with_rng(&mut rng)], 0.0);
        }

        for seed in 0..500 {
            let params = GenerationParameters::new(create_seeded_rng(seed));
            let mut data = ConjectureData::new(
                ByteSource::generating(&[], 1024, params),
                Box::new(NoopObserver),
            );
            assert_ne!(weights[sampler.sample(&mut data).unwrap()], 0.0);
        }
    }

    #[test]
    fn test_distribution_is_proportional() {
        let weights = [1.0, 2.0, 3.0, 4.0];
        let sampler = Sampler::new(&weights).unwrap();
        let mut rng = create_seeded_rng(1);
        let mut counts = [0usize; 4];
        let samples = 100_000;
        for _ in 0..samples {
            counts[sampler.sample_with_rng(&mut rng)] += 1;
        }
        for (i, &count) in counts.iter().enumerate() {
            let expected = weights[i] / 10.0;
            let observed = count as f64 / samples as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "index {}: expected {}, observed {}",
                i,
                expected,
                observed
            );
        }
    }

    #[test]
    fn test_zero_bytes_sample_lowest_reachable_index() {
        let sampler = Sampler::new(&[1.0, 1.0, 1.0]).unwrap();
        let mut data = ConjectureData::for_buffer(&[0; 8]);
        assert_eq!(sampler.sample(&mut data).unwrap(), 0);
    }
}
