//! HRTF spherical-harmonic projector (component G, §4.G): compresses a
//! measured HRTF database into a compact SH expansion, then evaluates a
//! per-channel frequency-domain filter for an arbitrary query direction.
//!
//! Grounded on the teacher's `realfft`-planner idiom (`ir/convolver/fft.rs`)
//! for the forward transform of each measurement, and on `noise.rs`'s fixed-
//! seed `ChaCha8Rng` convention for the Monte-Carlo integration — the fit
//! must be reproducible given the same database.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;

use crate::types::Vector3;

const FIT_SEED: u64 = 0x4853_4f46_424d_5421;
const MONTE_CARLO_SAMPLES: usize = 2000;

/// One measured direction's per-channel time-domain HRIR, already resampled
/// to the system sample rate by the caller (§4.G "resample each IR to
/// `Fs`").
#[derive(Debug, Clone)]
pub struct HrtfMeasurement {
    pub direction: Vector3,
    /// `channels[c]` is channel `c`'s impulse response, length `<= l`.
    pub channels: Vec<Vec<f32>>,
}

/// A raw HRTF database: one [`HrtfMeasurement`] per sampled direction, all
/// sharing a channel count.
#[derive(Debug, Clone)]
pub struct HrtfDatabase {
    pub measurements: Vec<HrtfMeasurement>,
    pub channel_count: usize,
}

/// Number of real SH coefficients up to and including order `n`.
fn coeff_count(n: usize) -> usize {
    (n + 1) * (n + 1)
}

/// `(l, m)` pairs for every coefficient up to order `n`, in the fixed
/// ordering used to index `coeffs`.
fn lm_pairs(n: usize) -> Vec<(i32, i32)> {
    let mut pairs = Vec::with_capacity(coeff_count(n));
    for l in 0..=n as i32 {
        for m in -l..=l {
            pairs.push((l, m));
        }
    }
    pairs
}

/// Real (not complex) spherical harmonic basis function `Y_lm(direction)`,
/// in the "up = +y" convention shared with [`Vector3::azimuth_elevation`].
fn real_sh(l: i32, m: i32, direction: Vector3) -> f32 {
    let Some(unit) = direction.normalized() else {
        return if l == 0 { 1.0 / (2.0 * std::f64::consts::PI.sqrt()) as f32 } else { 0.0 };
    };
    let (azimuth, elevation) = unit.azimuth_elevation();
    let cos_theta = elevation.sin() as f64; // polar angle from the +y pole
    let phi = azimuth as f64;

    let am = m.unsigned_abs() as i32;
    let p = associated_legendre(l, am, cos_theta);
    let k = normalisation(l, am);

    let value = if m == 0 {
        k * p
    } else if m > 0 {
        std::f64::consts::SQRT_2 * k * (am as f64 * phi).cos() * p
    } else {
        std::f64::consts::SQRT_2 * k * (am as f64 * phi).sin() * p
    };
    value as f32
}

fn normalisation(l: i32, m: i32) -> f64 {
    ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI) * factorial_ratio(l, m)).sqrt()
}

/// `(l - m)! / (l + m)!`, computed as a running product to avoid overflow.
fn factorial_ratio(l: i32, m: i32) -> f64 {
    let mut ratio = 1.0;
    for k in (l - m + 1)..=(l + m) {
        ratio /= k as f64;
    }
    ratio
}

/// Associated Legendre polynomial `P_l^m(x)` via the standard three-term
/// recurrence (Sloan, "Stupid Spherical Harmonics Tricks").
fn associated_legendre(l: i32, m: i32, x: f64) -> f64 {
    let mut pmm = 1.0f64;
    if m > 0 {
        let somx2 = ((1.0 - x) * (1.0 + x)).max(0.0).sqrt();
        let mut fact = 1.0;
        for _ in 0..m {
            pmm *= -fact * somx2;
            fact += 2.0;
        }
    }
    if l == m {
        return pmm;
    }
    let pmm1 = x * (2 * m + 1) as f64 * pmm;
    if l == m + 1 {
        return pmm1;
    }
    let mut prev2 = pmm;
    let mut prev1 = pmm1;
    for ll in (m + 2)..=l {
        let cur = (x * (2 * ll - 1) as f64 * prev1 - (ll + m - 1) as f64 * prev2) / (ll - m) as f64;
        prev2 = prev1;
        prev1 = cur;
    }
    prev1
}

/// The fitted per-channel SH expansion: `coeffs[channel][lm][freq_bin]`.
#[derive(Debug, Clone)]
pub struct HrtfProjection {
    pub order: usize,
    pub filter_len: usize,
    pub channel_count: usize,
    coeffs: Vec<Vec<Vec<Complex<f32>>>>,
}

impl HrtfProjection {
    /// Fits an SH expansion to `db`, increasing order from 0 until L2 error
    /// drops below `max_error`, relative improvement drops below
    /// `convergence`, or `nmax` is reached; backtracks one order if error
    /// increased monotonically (§4.G).
    pub fn fit(db: &HrtfDatabase, sample_rate: f32, l: usize, nmax: usize, max_error: f32, convergence: f32) -> Self {
        let padded = 2 * l;
        let bins = l + 1;
        let spectra = forward_transform_all(db, padded, bins);

        let samples = monte_carlo_directions(MONTE_CARLO_SAMPLES);
        let interpolated: Vec<Vec<Vec<Complex<f32>>>> =
            samples.iter().map(|&d| interpolate_nearest(db, &spectra, d)).collect();

        let mut best: Option<(usize, Vec<Vec<Vec<Complex<f32>>>>, f32)> = None;
        let mut prev_error = f32::INFINITY;

        for n in 0..=nmax {
            let coeffs = fit_order(n, &samples, &interpolated, db.channel_count, bins, sample_rate);
            let error = l2_error(&coeffs, n, db, &spectra);

            if let Some((_, _, best_error)) = &best {
                if error > *best_error && error > prev_error {
                    // Error increased monotonically across two steps: the
                    // previous order was the better fit, stop growing.
                    break;
                }
            }

            let improved_enough = (prev_error - error).abs() > convergence * prev_error.max(1e-9);
            best = Some((n, coeffs, error));
            prev_error = error;

            if error < max_error || (n > 0 && !improved_enough) {
                break;
            }
        }

        let (order, coeffs, _) = best.unwrap_or_else(|| {
            let coeffs = fit_order(0, &samples, &interpolated, db.channel_count, bins, sample_rate);
            (0, coeffs, f32::INFINITY)
        });

        Self { order, filter_len: bins, channel_count: db.channel_count, coeffs }
    }

    /// Evaluates `F_c(f) = sum_lm c_{c,lm,f} * Y_lm(direction)` for every
    /// channel, producing the frequency-domain filter the assembler copies
    /// into the HRTF convolution instance's partition 0 (§4.B).
    pub fn evaluate(&self, direction: Vector3) -> Vec<Vec<Complex<f32>>> {
        let pairs = lm_pairs(self.order);
        let basis: Vec<f32> = pairs.iter().map(|&(l, m)| real_sh(l, m, direction)).collect();

        (0..self.channel_count)
            .map(|c| {
                let mut filter = vec![Complex::new(0.0, 0.0); self.filter_len];
                for (lm, &y) in basis.iter().enumerate() {
                    let coeffs = &self.coeffs[c][lm];
                    for (bin, &coeff) in coeffs.iter().enumerate() {
                        filter[bin] += coeff * y;
                    }
                }
                filter
            })
            .collect()
    }
}

fn forward_transform_all(db: &HrtfDatabase, padded: usize, bins: usize) -> Vec<Vec<Vec<Complex<f32>>>> {
    let mut planner = RealFftPlanner::<f32>::new();
    let r2c = planner.plan_fft_forward(padded);
    let mut scratch = r2c.make_scratch_vec();

    db.measurements
        .iter()
        .map(|m| {
            m.channels
                .iter()
                .map(|ir| {
                    let mut time = vec![0.0f32; padded];
                    let n = ir.len().min(padded);
                    time[..n].copy_from_slice(&ir[..n]);
                    let mut freq = vec![Complex::new(0.0, 0.0); bins];
                    let _ = r2c.process_with_scratch(&mut time, &mut freq, &mut scratch);
                    freq
                })
                .collect()
        })
        .collect()
}

fn monte_carlo_directions(count: usize) -> Vec<Vector3> {
    let mut rng = ChaCha8Rng::seed_from_u64(FIT_SEED);
    (0..count)
        .map(|_| {
            let cos_theta = rng.gen_range(-1.0f32..=1.0);
            let phi = rng.gen_range(0.0f32..std::f32::consts::TAU);
            let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
            Vector3::new(sin_theta * phi.cos(), cos_theta, sin_theta * phi.sin())
        })
        .collect()
}

/// Cosine-weighted interpolation from the three nearest measured directions
/// (§4.G "barycentric (or cosine-weighted) mixing").
fn interpolate_nearest(db: &HrtfDatabase, spectra: &[Vec<Vec<Complex<f32>>>], direction: Vector3) -> Vec<Vec<Complex<f32>>> {
    let mut ranked: Vec<(usize, f32)> = db
        .measurements
        .iter()
        .enumerate()
        .map(|(i, m)| (i, direction.dot(m.direction)))
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    ranked.truncate(3);

    let weights: Vec<f32> = ranked.iter().map(|&(_, d)| d.max(0.0)).collect();
    let total: f32 = weights.iter().sum();
    let weights: Vec<f32> = if total > 1e-6 { weights.iter().map(|w| w / total).collect() } else { vec![1.0 / ranked.len() as f32; ranked.len()] };

    let channel_count = db.channel_count;
    let bins = spectra.first().and_then(|m| m.first()).map(Vec::len).unwrap_or(0);
    let mut out = vec![vec![Complex::new(0.0, 0.0); bins]; channel_count];
    for (&(idx, _), &w) in ranked.iter().zip(&weights) {
        for c in 0..channel_count {
            for (bin, &v) in spectra[idx][c].iter().enumerate() {
                out[c][bin] += v * w;
            }
        }
    }
    out
}

/// Accumulates `c_{c,lm,f} = (4*pi/M) * sum_k Y_lm(d_k) * IR_{c,k}(f)` for
/// every `(l, m)` pair up to order `n`.
fn fit_order(
    n: usize,
    samples: &[Vector3],
    interpolated: &[Vec<Vec<Complex<f32>>>],
    channel_count: usize,
    bins: usize,
    _sample_rate: f32,
) -> Vec<Vec<Vec<Complex<f32>>>> {
    let pairs = lm_pairs(n);
    let m = samples.len() as f32;
    let scale = 4.0 * std::f32::consts::PI / m;

    let mut coeffs = vec![vec![vec![Complex::new(0.0, 0.0); bins]; pairs.len()]; channel_count];
    for (k, &d) in samples.iter().enumerate() {
        for (lm, &(l, mm)) in pairs.iter().enumerate() {
            let y = real_sh(l, mm, d) * scale;
            for c in 0..channel_count {
                for (bin, &v) in interpolated[k][c].iter().enumerate() {
                    coeffs[c][lm][bin] += v * y;
                }
            }
        }
    }
    coeffs
}

/// L2 error between the fitted expansion (at order `n`) and the original
/// measured spectra, used as the convergence criterion in `fit`.
fn l2_error(coeffs: &[Vec<Vec<Complex<f32>>>], n: usize, db: &HrtfDatabase, spectra: &[Vec<Vec<Complex<f32>>>]) -> f32 {
    let pairs = lm_pairs(n);
    let mut error_energy = 0.0f64;
    let mut signal_energy = 0.0f64;

    for (k, measurement) in db.measurements.iter().enumerate() {
        let basis: Vec<f32> = pairs.iter().map(|&(l, m)| real_sh(l, m, measurement.direction)).collect();
        for c in 0..db.channel_count {
            for (bin, &measured) in spectra[k][c].iter().enumerate() {
                let mut fitted = Complex::new(0.0f32, 0.0);
                for (lm, &y) in basis.iter().enumerate() {
                    fitted += coeffs[c][lm][bin] * y;
                }
                let diff = fitted - measured;
                error_energy += f64::from(diff.norm_sqr());
                signal_energy += f64::from(measured.norm_sqr());
            }
        }
    }

    if signal_energy < 1e-12 {
        0.0
    } else {
        (error_energy / signal_energy).sqrt() as f32
    }
}
