//! Where the bytes of a test case come from.
//!
//! A [`ByteSource`] replays a fixed prefix and, in live generation mode,
//! continues with bytes from [`GenerationParameters`] once the prefix runs out.

use std::collections::HashMap;

use rand::Rng;
use rand::rngs::StdRng;

/// Average number of random entries in a per-width alphabet
const AVERAGE_ALPHABET_SIZE: f64 = 3.0;

/// Random generation profile for a single test case.
///
/// Each draw is either uniformly random or picked from a small alphabet of
/// values of that width. The alphabet always contains the all-zero and
/// all-`0xFF` values, so boundary values and duplicates show up far more
/// often than under a uniform distribution.
#[derive(Debug, Clone)]
pub struct GenerationParameters {
    random: StdRng,
    pure_chance: f64,
    alphabets: HashMap<usize, Vec<Vec<u8>>>,
}

impl GenerationParameters {
    /// Create parameters, sampling the uniform/alphabet mix from `random`
    pub fn new(mut random: StdRng) -> Self {
        let pure_chance = random.r#gen::<f64>();
        Self {
            random,
            pure_chance,
            alphabets: HashMap::new(),
        }
    }

    /// Chance that a draw bypasses the alphabet
    pub fn pure_chance(&self) -> f64 {
        self.pure_chance
    }

    /// Produce `n` fresh bytes
    pub fn draw_bytes(&mut self, n: usize) -> Vec<u8> {
        if n == 0 {
            return Vec::new();
        }
        if self.random.r#gen::<f64>() <= self.pure_chance {
            return uniform(&mut self.random, n);
        }

        let random = &mut self.random;
        let alphabet = self.alphabets.entry(n).or_insert_with(|| {
            let mut alphabet = vec![vec![0u8; n], vec![0xFFu8; n]];
            let continue_chance = 1.0 - 1.0 / AVERAGE_ALPHABET_SIZE;
            loop {
                alphabet.push(uniform(random, n));
                if random.r#gen::<f64>() > continue_chance {
                    break;
                }
            }
            alphabet
        });
        let i = self.random.gen_range(0..alphabet.len());
        alphabet[i].clone()
    }
}

fn uniform<R: Rng + ?Sized>(random: &mut R, n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    random.fill(&mut bytes[..]);
    bytes
}

/// Byte supply for one [`ConjectureData`](crate::data::ConjectureData).
#[derive(Debug)]
pub struct ByteSource {
    prefix: Vec<u8>,
    generator: Option<GenerationParameters>,
    max_length: usize,
}

impl ByteSource {
    /// Replay exactly `buffer`; running past its end is an overrun
    pub fn for_buffer(buffer: &[u8]) -> Self {
        Self {
            prefix: buffer.to_vec(),
            generator: None,
            max_length: buffer.len(),
        }
    }

    /// Replay `prefix`, then generate fresh bytes up to `max_length`
    pub fn generating(prefix: &[u8], max_length: usize, generator: GenerationParameters) -> Self {
        Self {
            prefix: prefix.to_vec(),
            generator: Some(generator),
            max_length,
        }
    }

    /// Replay `prefix` and allow at most `max_length` bytes in total
    pub fn with_max_length(prefix: &[u8], max_length: usize) -> Self {
        Self {
            prefix: prefix.to_vec(),
            generator: None,
            max_length: max_length.min(prefix.len()),
        }
    }

    /// Maximum number of bytes this source will hand out
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Bytes `[index, index + n)`, or `None` if that runs past the end.
    pub fn read(&mut self, index: usize, n: usize) -> Option<Vec<u8>> {
        if index + n > self.max_length {
            return None;
        }
        let end = (index + n).min(self.prefix.len());
        let mut bytes = if index < end {
            self.prefix[index..end].to_vec()
        } else {
            Vec::new()
        };
        if bytes.len() < n {
            let generator = self.generator.as_mut()?;
            let fresh = generator.draw_bytes(n - bytes.len());
            bytes.extend_from_slice(&fresh);
        }
        Some(bytes)
    }
}
