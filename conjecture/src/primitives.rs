//! Typed draw helpers built on `ConjectureData::draw_bits`.
//!
//! Every helper is a deterministic function of the bits it consumes, and an
//! all-zero bit stream always produces the simplest value (the center of an
//! integer range, `false` for coins, the minimum size for collections).

use std::sync::LazyLock;

use crate::data::ConjectureData;
use crate::error::DrawResult;
use crate::sampler::Sampler;
use crate::utils::calc_label_from_name;

pub static INTEGER_RANGE_DRAW_LABEL: LazyLock<u64> =
    LazyLock::new(|| calc_label_from_name("another draw in integer_range()"));
pub static BIASED_COIN_LABEL: LazyLock<u64> =
    LazyLock::new(|| calc_label_from_name("biased_coin()"));
pub static ONE_FROM_MANY_LABEL: LazyLock<u64> =
    LazyLock::new(|| calc_label_from_name("one more from many()"));

/// Draw an integer in `[lower, upper]` that shrinks towards `center`.
///
/// `center` defaults to `lower` and is clamped into the range. The first
/// draw picks a side of the center, the second draws the distance from it,
/// so zeroing the bits always lands exactly on the center.
///
/// # Panics
///
/// If `lower > upper`.
pub fn integer_range(
    data: &mut ConjectureData,
    lower: u64,
    upper: u64,
    center: Option<u64>,
) -> DrawResult<u64> {
    assert!(lower <= upper, "integer_range({}, {}): lower > upper", lower, upper);
    if lower == upper {
        // Write a bit even when the range is trivial, so that the stream stays
        // aligned when a bound depends on earlier draws.
        data.draw_bits(1, Some(0))?;
        return Ok(lower);
    }

    let center = center.unwrap_or(lower).clamp(lower, upper);
    let above = if center == upper {
        false
    } else if center == lower {
        true
    } else {
        let above_chance = data.integer_range_bias().above_chance;
        biased_coin(data, above_chance)?
    };

    let gap = if above { upper - center } else { center - lower };
    let mut bits = 64 - gap.leading_zeros();

    if bits > data.integer_range_bias().wide_range_bits && data.draw_bits(3, None)? != 0 {
        let bias = data.integer_range_bias().clone();
        if let Ok(sampler) = Sampler::new(&bias.size_weights) {
            let idx = sampler.sample(data)?;
            if let Some(&size) = bias.sizes.get(idx) {
                bits = bits.min(size);
            }
        }
    }

    let offset = loop {
        data.start_example(*INTEGER_RANGE_DRAW_LABEL)?;
        let offset = data.draw_bits(bits, None)?;
        data.stop_example(offset > gap)?;
        if offset <= gap {
            break offset;
        }
    };

    Ok(if above { center + offset } else { center - offset })
}

/// Draw a fair boolean
pub fn boolean(data: &mut ConjectureData) -> DrawResult<bool> {
    Ok(data.draw_bits(1, None)? == 1)
}

/// Return true with probability `p`, shrinking towards false.
pub fn biased_coin(data: &mut ConjectureData, p: f64) -> DrawResult<bool> {
    data.start_example(*BIASED_COIN_LABEL)?;
    let mut p = p;
    let result = loop {
        // Certain outcomes still write a bit so shrinking sees a stable stream
        if p <= 0.0 {
            data.draw_bits(1, Some(0))?;
            break false;
        }
        if p >= 1.0 {
            data.draw_bits(1, Some(1))?;
            break true;
        }

        // Partition [0, 1] into 256 parts. At most one straddles p; drawing
        // it (always labelled 255) retries with the straddled fraction.
        let scaled = p * 256.0;
        let mut truthy = scaled.floor() as u64;
        let mut falsey = ((1.0 - p) * 256.0).floor() as u64;
        let remainder = scaled - truthy as f64;

        let (bits, partial) = if falsey + truthy == 256 {
            let mut m = truthy;
            let mut n = 256u64;
            while m % 2 == 0 && n > 2 {
                m /= 2;
                n /= 2;
            }
            truthy = m;
            falsey = n - m;
            (n.trailing_zeros(), false)
        } else {
            (8, true)
        };

        let i = data.draw_bits(bits, None)?;
        if partial && i == 255 {
            p = remainder;
            continue;
        }
        if falsey == 0 {
            break true;
        }
        if truthy == 0 {
            break false;
        }
        // Zero is always false and one always true, so a truthy block can
        // always be lowered to 1.
        if i <= 1 {
            break i == 1;
        }
        break i > falsey;
    };
    data.stop_example(false)?;
    Ok(result)
}

/// Draw an index into a collection of `len` elements, shrinking towards 0.
pub fn choice(data: &mut ConjectureData, len: usize) -> DrawResult<usize> {
    assert!(len > 0, "choice from an empty collection");
    Ok(integer_range(data, 0, (len - 1) as u64, None)? as usize)
}

/// Decides how many elements a collection gets.
///
/// ```ignore
/// let mut elements = Many::new(0, 10, 3.0);
/// while elements.more(data)? {
///     values.push(data.draw_bits(8, None)?);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Many {
    min_size: usize,
    max_size: usize,
    p_continue: f64,
    count: usize,
    rejections: usize,
    drawn: bool,
    force_stop: bool,
    rejected: bool,
}

impl Many {
    pub fn new(min_size: usize, max_size: usize, average_size: f64) -> Self {
        debug_assert!(min_size <= max_size);
        Self {
            min_size,
            max_size,
            p_continue: 1.0 - 1.0 / (1.0 + average_size),
            count: 0,
            rejections: 0,
            drawn: false,
            force_stop: false,
            rejected: false,
        }
    }

    /// Number of elements accepted so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Should another element be drawn?
    pub fn more(&mut self, data: &mut ConjectureData) -> DrawResult<bool> {
        if self.max_size == 0 {
            return Ok(false);
        }
        if self.drawn {
            data.stop_example(self.rejected)?;
        }
        self.drawn = true;
        self.rejected = false;

        let should_continue = if self.min_size == self.max_size {
            self.count < self.min_size
        } else if self.force_stop {
            data.draw_bits(1, Some(0))?;
            false
        } else if self.count < self.min_size {
            data.draw_bits(1, Some(1))?;
            true
        } else if self.count >= self.max_size {
            data.draw_bits(1, Some(0))?;
            false
        } else {
            biased_coin(data, self.p_continue)?
        };

        if should_continue {
            data.start_example(*ONE_FROM_MANY_LABEL)?;
            self.count += 1;
        }
        Ok(should_continue)
    }

    /// Reject the last element so it does not count towards the size
    pub fn reject(&mut self, data: &mut ConjectureData) -> DrawResult<()> {
        debug_assert!(self.count > 0);
        self.count = self.count.saturating_sub(1);
        self.rejections += 1;
        self.rejected = true;
        if self.rejections > 2 * self.count {
            if self.count < self.min_size {
                data.mark_invalid()?;
            } else {
                self.force_stop = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{NoopObserver, Status};
    use crate::rng::create_seeded_rng;
    use crate::source::{ByteSource, GenerationParameters};

    fn random_data(seed: u64) -> ConjectureData<'static> {
        let params = GenerationParameters::new(create_seeded_rng(seed));
        ConjectureData::new(ByteSource::generating(&[], 8 * 1024, params), Box::new(NoopObserver))
    }

    #[test]
    fn test_integer_range_stays_in_bounds() {
        for seed in 0..200 {
            let mut data = random_data(seed);
            let value = integer_range(&mut data, 10, 1000, Some(500)).unwrap();
            assert!((10..=1000).contains(&value));
        }
    }

    #[test]
    fn test_integer_range_zero_bits_give_center() {
        let mut data = ConjectureData::for_buffer(&[0; 16]);
        assert_eq!(integer_range(&mut data, 0, 100, Some(42)).unwrap(), 42);
        let mut data = ConjectureData::for_buffer(&[0; 16]);
        assert_eq!(integer_range(&mut data, 5, 100, None).unwrap(), 5);
        let mut data = ConjectureData::for_buffer(&[0; 16]);
        assert_eq!(integer_range(&mut data, 5, 100, Some(100)).unwrap(), 100);
    }

    #[test]
    fn test_integer_range_trivial_still_writes() {
        let mut data = ConjectureData::for_buffer(&[0]);
        assert_eq!(integer_range(&mut data, 7, 7, None).unwrap(), 7);
        assert_eq!(data.buffer().len(), 1);
        assert!(data.blocks()[0].forced);
    }

    #[test]
    fn test_integer_range_is_deterministic() {
        let mut first = random_data(99);
        let a = integer_range(&mut first, 0, u64::MAX, Some(1 << 40)).unwrap();
        first.freeze().unwrap();
        let buffer = first.buffer().to_vec();

        let mut replay = ConjectureData::for_buffer(&buffer);
        let b = integer_range(&mut replay, 0, u64::MAX, Some(1 << 40)).unwrap();
        assert_eq!(a, b);
        assert_eq!(replay.buffer(), &buffer[..]);
    }

    #[test]
    fn test_integer_range_rejection_is_discarded() {
        // gap = 4 needs 3 bits; 7 is rejected, then 2 accepted
        let mut data = ConjectureData::for_buffer(&[7, 2]);
        assert_eq!(integer_range(&mut data, 0, 4, None).unwrap(), 2);
        data.freeze().unwrap();
        assert!(data.as_result().has_discards);
    }

    #[test]
    fn test_biased_coin_extremes_write_forced_bits() {
        let mut data = ConjectureData::for_buffer(&[]);
        assert!(!biased_coin(&mut data, 0.0).unwrap());
        assert!(biased_coin(&mut data, 1.0).unwrap());
        assert_eq!(data.buffer(), &[0, 1]);
    }

    #[test]
    fn test_biased_coin_half_uses_one_bit() {
        let mut data = ConjectureData::for_buffer(&[1]);
        assert!(biased_coin(&mut data, 0.5).unwrap());
        let mut data = ConjectureData::for_buffer(&[0]);
        assert!(!biased_coin(&mut data, 0.5).unwrap());
    }

    #[test]
    fn test_biased_coin_zero_is_false_one_is_true() {
        for p in [0.01, 0.3, 0.75, 0.9] {
            let mut data = ConjectureData::for_buffer(&[0]);
            assert!(!biased_coin(&mut data, p).unwrap());
            let mut data = ConjectureData::for_buffer(&[1]);
            assert!(biased_coin(&mut data, p).unwrap());
        }
    }

    #[test]
    fn test_biased_coin_frequency() {
        let mut trues = 0;
        for seed in 0..2000 {
            let params = GenerationParameters::new(create_seeded_rng(seed));
            let mut data = ConjectureData::new(
                ByteSource::generating(&[], 64, params),
                Box::new(NoopObserver),
            );
            if biased_coin(&mut data, 0.9).unwrap() {
                trues += 1;
            }
        }
        // Generation parameters skew bytes, so only check the broad shape
        assert!(trues > 1000, "got {} trues", trues);
    }

    #[test]
    fn test_choice() {
        let mut data = ConjectureData::for_buffer(&[0, 0]);
        assert_eq!(choice(&mut data, 5).unwrap(), 0);
        let mut data = ConjectureData::for_buffer(&[0]);
        assert_eq!(choice(&mut data, 1).unwrap(), 0);
    }

    #[test]
    fn test_many_respects_bounds() {
        for seed in 0..100 {
            let mut data = random_data(seed);
            let mut many = Many::new(2, 5, 3.0);
            let mut n = 0;
            while many.more(&mut data).unwrap() {
                data.draw_bits(8, None).unwrap();
                n += 1;
            }
            assert!((2..=5).contains(&n));
            assert_eq!(many.count(), n);
        }
    }

    #[test]
    fn test_many_zero_stream_gives_min_size() {
        let mut data = ConjectureData::for_buffer(&[0; 32]);
        let mut many = Many::new(1, 10, 5.0);
        let mut n = 0;
        while many.more(&mut data).unwrap() {
            data.draw_bits(8, None).unwrap();
            n += 1;
        }
        assert_eq!(n, 1);
    }

    #[test]
    fn test_many_rejections_can_invalidate() {
        let mut data = ConjectureData::for_buffer(&[0; 32]);
        let mut many = Many::new(3, 3, 3.0);
        assert!(many.more(&mut data).unwrap());
        assert!(many.reject(&mut data).is_err());
        assert_eq!(data.status(), Status::Invalid);
    }
}
