//! RNG construction for runners and parallel shards.

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Create a new RNG, seeded when `seed` is given and from entropy otherwise
pub fn create_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => create_seeded_rng(seed),
        None => StdRng::from_entropy(),
    }
}

/// Create a deterministic RNG from a seed
pub fn create_seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Seed for shard `shard` of a run seeded with `seed`
pub fn shard_seed(seed: u64, shard: usize) -> u64 {
    seed.wrapping_add(shard as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let mut a = create_rng(Some(12345));
        let mut b = create_seeded_rng(12345);
        for _ in 0..10 {
            assert_eq!(a.r#gen::<u64>(), b.r#gen::<u64>());
        }
    }

    #[test]
    fn test_shard_seeds_differ() {
        assert_eq!(shard_seed(10, 0), 10);
        assert_eq!(shard_seed(10, 3), 13);
        assert_eq!(shard_seed(u64::MAX, 1), 0);
    }
}
