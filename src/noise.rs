//! Deterministic, crossover-filtered noise bank used for phase
//! reconstruction (§4.B step 5): turns a per-band energy envelope into a
//! physically plausible pressure IR by multiplying each band's envelope by
//! a band-limited noise carrier of unit variance.
//!
//! The carrier is generated once per listener from a fixed seed — never
//! from a time-based or OS source — so a render is bit-reproducible given
//! the same scene, matching the render path's general "no nondeterminism"
//! posture (§5, §8).

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::crossover::{Crossover, CrossoverHistory};
use crate::types::{BandVector, NUM_BANDS};

/// Seed for the noise carrier's PRNG. Fixed, not configurable: changing it
/// would only be useful for testing different noise realisations, which
/// isn't a rendering-time concern.
const NOISE_SEED: u64 = 0x736f756e64695253;

/// Window, in samples, over which `normalize_unit_variance` estimates each
/// band's mean/std-dev. Fixed rather than derived from the buffer's current
/// length: a length-dependent estimate would renormalize every sample each
/// time the buffer grows, quietly shifting the amplitude of noise-carrier
/// samples already in use by a running convolution. The buffer is always
/// regenerated at a whole multiple of this window so every window's
/// statistics depend only on that window's own (deterministic) raw samples,
/// never on how long the buffer happens to be.
const NORMALIZE_WINDOW: usize = 1024;

/// A band-limited white-noise carrier, long enough to cover the longest IR
/// seen so far. Regenerated (from scratch, same seed) only when a longer
/// buffer is needed, per §4.B step 5's "regenerated only if buffer grows".
#[derive(Debug, Default)]
pub struct NoiseBank {
    samples: Vec<BandVector>,
}

impl NoiseBank {
    pub fn new() -> Self {
        Self { samples: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ensures the carrier covers at least `len` samples, regenerating the
    /// whole buffer (with the same fixed seed) if it currently doesn't.
    pub fn ensure_len(&mut self, len: usize, crossover: &Crossover) {
        if self.samples.len() >= len {
            return;
        }
        self.regenerate(len, crossover);
    }

    fn regenerate(&mut self, len: usize, crossover: &Crossover) {
        // Round up to a full window so every chunk `normalize_unit_variance`
        // sees is complete, regardless of what `len` the caller asked for.
        let rounded_len = len.div_ceil(NORMALIZE_WINDOW) * NORMALIZE_WINDOW;

        let mut rng = ChaCha8Rng::seed_from_u64(NOISE_SEED);
        let mut white = vec![0.0f32; rounded_len];
        // Uniform(-1, 1) has variance 1/3; scale to unit variance before
        // band-splitting so each band's post-filter variance is comparable.
        let scale = 3.0f32.sqrt();
        for sample in &mut white {
            *sample = rng.gen_range(-1.0f32..=1.0f32) * scale;
        }

        let mut history = CrossoverHistory::new();
        let mut banded = vec![BandVector::ZERO; rounded_len];
        crossover.filter_scalar(&mut history, &white, &mut banded);

        for window in banded.chunks_mut(NORMALIZE_WINDOW) {
            normalize_unit_variance(window);
        }
        self.samples = banded;
    }

    /// The carrier's band vector at time index `t`, wrapped if `t` exceeds
    /// the current buffer (callers always call `ensure_len` first, so this
    /// only wraps in the degenerate empty-buffer case).
    pub fn sample(&self, t: usize) -> BandVector {
        if self.samples.is_empty() {
            return BandVector::ZERO;
        }
        self.samples[t % self.samples.len()]
    }
}

fn normalize_unit_variance(banded: &mut [BandVector]) {
    let n = banded.len() as f32;
    if n == 0.0 {
        return;
    }
    let mut mean = BandVector::ZERO;
    for v in banded.iter() {
        mean += *v;
    }
    mean = mean / n;

    let mut variance = BandVector::ZERO;
    for v in banded.iter() {
        let d = *v - mean;
        variance += d * d;
    }
    variance = variance / n;
    let std_dev = variance.sqrt();

    for v in banded.iter_mut() {
        for b in 0..NUM_BANDS {
            let s = if std_dev[b] > 1e-12 { std_dev[b] } else { 1.0 };
            v[b] = (v[b] - mean[b]) / s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrequencyBandConfig;

    #[test]
    fn noise_bank_is_deterministic_across_regenerations() {
        let crossover = Crossover::new(&FrequencyBandConfig::default(), 48_000.0);
        let mut a = NoiseBank::new();
        let mut b = NoiseBank::new();
        a.ensure_len(4096, &crossover);
        b.ensure_len(4096, &crossover);
        for t in 0..4096 {
            assert_eq!(a.sample(t), b.sample(t));
        }
    }

    #[test]
    fn noise_bank_has_unit_variance_per_band() {
        let crossover = Crossover::new(&FrequencyBandConfig::default(), 48_000.0);
        let mut bank = NoiseBank::new();
        bank.ensure_len(65_536, &crossover);

        for b in 0..NUM_BANDS {
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            for t in 0..bank.len() {
                let v = bank.sample(t)[b] as f64;
                sum += v;
                sum_sq += v * v;
            }
            let n = bank.len() as f64;
            let mean = sum / n;
            let variance = sum_sq / n - mean * mean;
            assert!((variance - 1.0).abs() < 0.1, "band {b} variance {variance}");
        }
    }

    #[test]
    fn growing_the_buffer_preserves_the_prefix() {
        let crossover = Crossover::new(&FrequencyBandConfig::default(), 48_000.0);
        let mut bank = NoiseBank::new();
        bank.ensure_len(1024, &crossover);
        let prefix: Vec<BandVector> = (0..1024).map(|t| bank.sample(t)).collect();
        bank.ensure_len(2048, &crossover);
        for (t, expected) in prefix.iter().enumerate() {
            assert_eq!(bank.sample(t), *expected);
        }
    }
}
