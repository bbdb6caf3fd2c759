//! SIMD linear-phase crossover (§4.F): a cascaded Linkwitz-Riley 4th-order
//! filter bank that splits a broadband signal into `NUM_BANDS` bands, or
//! smooths/realigns signals that are already band-interleaved.
//!
//! The coefficient cascade generalises the teacher's three-band low/mid/high
//! `LR4Filter` split (see DESIGN.md): each crossover point contributes one
//! low-pass/high-pass pair, and every band is padded with allpass
//! compensation stages (an LR4 low-pass and high-pass summed at the *same*
//! cutoff is an allpass) so every band has passed through the same number of
//! filter stages and stays phase-aligned when summed.

use crate::types::{BandVector, FrequencyBandConfig, NUM_BANDS};

const NUM_SPLITS: usize = NUM_BANDS - 1;

/// Coefficients for one 2nd-order Butterworth biquad. An LR4 stage cascades
/// two of these (the same coefficients twice) for a 4th-order Linkwitz-Riley
/// response with a flat summed magnitude at the crossover point.
#[derive(Debug, Clone, Copy, Default)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    fn lowpass(cutoff_hz: f32, sample_rate: f32) -> Self {
        let (b0, b1, b2, a1, a2) = butterworth_2pole(cutoff_hz, sample_rate, false);
        Self { b0, b1, b2, a1, a2 }
    }

    fn highpass(cutoff_hz: f32, sample_rate: f32) -> Self {
        let (b0, b1, b2, a1, a2) = butterworth_2pole(cutoff_hz, sample_rate, true);
        Self { b0, b1, b2, a1, a2 }
    }
}

fn butterworth_2pole(cutoff_hz: f32, sample_rate: f32, highpass: bool) -> (f32, f32, f32, f32, f32) {
    let q = std::f32::consts::FRAC_1_SQRT_2;
    let omega = 2.0 * std::f32::consts::PI * cutoff_hz / sample_rate;
    let sin_omega = omega.sin();
    let cos_omega = omega.cos();
    let alpha = sin_omega / (2.0 * q);
    let a0 = 1.0 + alpha;

    let (b0, b1, b2) = if highpass {
        (
            ((1.0 + cos_omega) / 2.0) / a0,
            (-(1.0 + cos_omega)) / a0,
            ((1.0 + cos_omega) / 2.0) / a0,
        )
    } else {
        (
            ((1.0 - cos_omega) / 2.0) / a0,
            (1.0 - cos_omega) / a0,
            ((1.0 - cos_omega) / 2.0) / a0,
        )
    };
    let a1 = (-2.0 * cos_omega) / a0;
    let a2 = (1.0 - alpha) / a0;
    (b0, b1, b2, a1, a2)
}

/// Mutable state of a single 2nd-order biquad.
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, coeffs: &BiquadCoeffs, input: f32) -> f32 {
        let output =
            coeffs.b0 * input + coeffs.b1 * self.x1 + coeffs.b2 * self.x2 - coeffs.a1 * self.y1 - coeffs.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }

    /// Clamps near-zero state to exactly zero (§5 denormal safety).
    #[inline]
    fn flush_denormals(&mut self) {
        if self.x1.abs() < f32::EPSILON {
            self.x1 = 0.0;
        }
        if self.x2.abs() < f32::EPSILON {
            self.x2 = 0.0;
        }
        if self.y1.abs() < f32::EPSILON {
            self.y1 = 0.0;
        }
        if self.y2.abs() < f32::EPSILON {
            self.y2 = 0.0;
        }
    }
}

/// Two cascaded biquad stages sharing one coefficient set: a 4th-order
/// Linkwitz-Riley section.
#[derive(Debug, Clone, Copy, Default)]
struct Lr4State {
    stage1: BiquadState,
    stage2: BiquadState,
}

impl Lr4State {
    #[inline]
    fn process(&mut self, coeffs: &BiquadCoeffs, input: f32) -> f32 {
        let y1 = self.stage1.process(coeffs, input);
        self.stage2.process(coeffs, y1)
    }

    fn flush_denormals(&mut self) {
        self.stage1.flush_denormals();
        self.stage2.flush_denormals();
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SplitCoeffs {
    lp: BiquadCoeffs,
    hp: BiquadCoeffs,
}

/// Immutable, shared crossover coefficients, derived from band centres and
/// `Fs` only. Cheap to clone; typically held once per listener and shared by
/// every cluster's `CrossoverHistory`.
#[derive(Debug, Clone)]
pub struct Crossover {
    splits: [SplitCoeffs; NUM_SPLITS],
    sample_rate: f32,
}

impl Crossover {
    pub fn new(bands: &FrequencyBandConfig, sample_rate: f32) -> Self {
        let mut splits = [SplitCoeffs::default(); NUM_SPLITS];
        for (i, split) in splits.iter_mut().enumerate() {
            let f = bands.edges_hz[i];
            split.lp = BiquadCoeffs::lowpass(f, sample_rate);
            split.hp = BiquadCoeffs::highpass(f, sample_rate);
        }
        Self { splits, sample_rate }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// `filterScalar`: broadband mono input, band-interleaved output. Each
    /// band passes through the crossover tree plus enough allpass
    /// compensation stages to match the deepest band's filter count, so the
    /// bands stay phase-aligned (needed for the round-trip reconstruction
    /// property in §8).
    pub fn filter_scalar(&self, history: &mut CrossoverHistory, input: &[f32], output: &mut [BandVector]) {
        assert_eq!(input.len(), output.len());
        for (i, &x) in input.iter().enumerate() {
            output[i] = self.split_sample(history, x);
        }
    }

    #[inline]
    fn split_sample(&self, history: &mut CrossoverHistory, input: f32) -> BandVector {
        let mut raw = [0.0f32; NUM_BANDS];
        let mut node = input;
        for k in 0..NUM_SPLITS {
            let lp = history.tree_lp[k].process(&self.splits[k].lp, node);
            let hp = history.tree_hp[k].process(&self.splits[k].hp, node);
            raw[k] = lp;
            node = hp;
        }
        raw[NUM_BANDS - 1] = node;

        let mut out = BandVector::ZERO;
        for band in 0..NUM_BANDS {
            let mut sample = raw[band];
            for (slot, split_idx) in (band + 1..NUM_SPLITS).enumerate() {
                let comp = &mut history.comp[band][slot];
                let lp = comp.0.process(&self.splits[split_idx].lp, sample);
                let hp = comp.1.process(&self.splits[split_idx].hp, sample);
                sample = lp + hp;
            }
            out[band] = sample;
        }
        out
    }

    /// `filterSIMD`: band-interleaved input and output, allpass sum. Applies
    /// only the phase-matching allpass compensation (no further band
    /// splitting) to signals that are already split, so summing the result
    /// across bands reconstructs a phase-coherent broadband signal.
    pub fn filter_simd(&self, history: &mut CompHistory, input: &[BandVector], output: &mut [BandVector]) {
        assert_eq!(input.len(), output.len());
        for (i, &bands) in input.iter().enumerate() {
            let mut out = BandVector::ZERO;
            for band in 0..NUM_BANDS {
                let mut sample = bands[band];
                for (slot, split_idx) in (band + 1..NUM_SPLITS).enumerate() {
                    let comp = &mut history.comp[band][slot];
                    let lp = comp.0.process(&self.splits[split_idx].lp, sample);
                    let hp = comp.1.process(&self.splits[split_idx].hp, sample);
                    sample = lp + hp;
                }
                out[band] = sample;
            }
            output[i] = out;
        }
    }

    /// `filterLowPass`: per-band low-pass only, used to smooth the IR
    /// assembler's energy histogram (§4.B step 4). Every band shares the
    /// same smoothing cutoff; history carries across partitions and FDLs as
    /// the caller keeps reusing the same `LowPassHistory`.
    pub fn filter_low_pass(
        &self,
        history: &mut LowPassHistory,
        smoothing_cutoff_hz: f32,
        input: &[BandVector],
        output: &mut [BandVector],
    ) {
        assert_eq!(input.len(), output.len());
        let coeffs = BiquadCoeffs::lowpass(smoothing_cutoff_hz, self.sample_rate);
        for (i, &bands) in input.iter().enumerate() {
            let mut out = BandVector::ZERO;
            for band in 0..NUM_BANDS {
                out[band] = history.state[band].process(&coeffs, bands[band]);
            }
            output[i] = out;
        }
    }
}

/// Caller-owned history for `filter_scalar`, allowing stateless re-entry of
/// the crossover across partitions and render blocks (§4.F).
#[derive(Debug, Clone, Default)]
pub struct CrossoverHistory {
    tree_lp: [Lr4State; NUM_SPLITS],
    tree_hp: [Lr4State; NUM_SPLITS],
    comp: [[(Lr4State, Lr4State); NUM_SPLITS]; NUM_BANDS],
}

impl CrossoverHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_denormals(&mut self) {
        for s in &mut self.tree_lp {
            s.flush_denormals();
        }
        for s in &mut self.tree_hp {
            s.flush_denormals();
        }
        for band in &mut self.comp {
            for (lp, hp) in band {
                lp.flush_denormals();
                hp.flush_denormals();
            }
        }
    }
}

/// Caller-owned history for `filter_simd`'s allpass-only compensation path.
#[derive(Debug, Clone, Default)]
pub struct CompHistory {
    comp: [[(Lr4State, Lr4State); NUM_SPLITS]; NUM_BANDS],
}

impl CompHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_denormals(&mut self) {
        for band in &mut self.comp {
            for (lp, hp) in band {
                lp.flush_denormals();
                hp.flush_denormals();
            }
        }
    }
}

/// Caller-owned history for `filter_low_pass`, one single-pole-equivalent
/// LR4 low-pass state per band.
#[derive(Debug, Clone, Default)]
pub struct LowPassHistory {
    state: [Lr4State; NUM_BANDS],
}

impl LowPassHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flush_denormals(&mut self) {
        for s in &mut self.state {
            s.flush_denormals();
        }
    }
}
