//! Synthetic late reverb (§4.E step 4): an optional, per-cluster feedback
//! delay network driven by the scene's global `reverbTime`, mixed
//! additively into the cluster's convolution+path output (§9 open question:
//! this spec normalises "reverb always mixes additively after convolution",
//! never replacing it).
//!
//! Grounded on the small `DiffusionAllpass`/`FDNDelayLine` building blocks of
//! the pack's algorithmic-reverb example, scaled down to four delay lines
//! with a Hadamard feedback mix — this core's reverb is a cheap ambience
//! layer, not the acoustically-modelled centrepiece those examples build.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Prime-ish delay lengths (samples @ 48 kHz), scaled to the actual sample
/// rate at construction time, chosen mutually co-prime to avoid comb-filter
/// coincidences between the four lines.
const BASE_DELAYS_48K: [usize; 4] = [1_687, 2_053, 2_399, 2_741];

/// One feedback-delay-network line: a single delay buffer with a one-pole
/// low-pass in the feedback path so the tail darkens as it decays, the way
/// a real room's high frequencies absorb faster.
struct DelayLine {
    buffer: Vec<f32>,
    write_pos: usize,
    lowpass_state: f32,
}

impl DelayLine {
    fn new(length: usize) -> Self {
        Self { buffer: vec![0.0; length.max(1)], write_pos: 0, lowpass_state: 0.0 }
    }

    #[inline]
    fn read(&self) -> f32 {
        self.buffer[self.write_pos]
    }

    #[inline]
    fn write(&mut self, value: f32, damping: f32) {
        self.lowpass_state += (value - self.lowpass_state) * (1.0 - damping);
        self.buffer[self.write_pos] = self.lowpass_state;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }

    fn flush_denormals(&mut self) {
        if self.lowpass_state.abs() < f32::EPSILON {
            self.lowpass_state = 0.0;
        }
    }
}

/// Per-cluster synthetic reverb: four delay lines mixed through a Hadamard
/// matrix for the feedback path, plus a small fixed dry/wet split applied
/// by the caller (the orchestrator, §4.E).
pub struct ClusterReverb {
    lines: [DelayLine; 4],
    feedback_gain: f32,
    damping: f32,
    /// A short diffusing pre-delay noise burst, so the reverb onset isn't a
    /// bare impulse through the FDN (which rings audibly on short IRs).
    predelay: Vec<f32>,
    predelay_pos: usize,
}

impl ClusterReverb {
    pub fn new(sample_rate: f32, reverb_time_s: f32) -> Self {
        let scale = sample_rate / 48_000.0;
        let lines = BASE_DELAYS_48K.map(|d| DelayLine::new(((d as f32) * scale).round() as usize));
        let predelay_len = (0.01 * sample_rate).round() as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(0x5245_5645_5242_2054);
        let predelay: Vec<f32> = (0..predelay_len.max(1)).map(|_| rng.gen_range(-1.0f32..=1.0) * 0.05).collect();

        let mut reverb = Self { lines, feedback_gain: 0.0, damping: 0.2, predelay, predelay_pos: 0 };
        reverb.set_reverb_time(reverb_time_s, sample_rate);
        reverb
    }

    /// Retunes the feedback gain so the energy in each line decays by 60 dB
    /// over `reverb_time_s` (the standard T60 comb-filter relationship),
    /// using the mean delay-line length as the loop period.
    pub fn set_reverb_time(&mut self, reverb_time_s: f32, sample_rate: f32) {
        if reverb_time_s <= 0.0 {
            self.feedback_gain = 0.0;
            return;
        }
        let mean_len = self.lines.iter().map(|l| l.buffer.len() as f32).sum::<f32>() / self.lines.len() as f32;
        let loop_seconds = mean_len / sample_rate;
        // g^(T60/loop) = 10^(-3) -> g = 10^(-3 * loop/T60)
        let gain = 10f32.powf(-3.0 * loop_seconds / reverb_time_s);
        self.feedback_gain = gain.clamp(0.0, 0.995);
    }

    /// Processes one mono cluster-output block in place, mixing the reverb
    /// tail in with `wet` proportion (dry stays untouched by this call; the
    /// caller applies its own dry/wet split before mixing into the listener
    /// bus, per §4.E step 4).
    pub fn process_block(&mut self, input: &mut [f32], wet: f32) {
        if self.feedback_gain <= 0.0 || wet <= 0.0 {
            return;
        }
        for sample in input.iter_mut() {
            let predelayed = self.predelay[self.predelay_pos];
            self.predelay_pos = (self.predelay_pos + 1) % self.predelay.len();
            let excite = *sample + predelayed * sample.abs();

            let reads = [self.lines[0].read(), self.lines[1].read(), self.lines[2].read(), self.lines[3].read()];
            let mixed = hadamard_mix(reads);

            for (line, &feedback_in) in self.lines.iter_mut().zip(&mixed) {
                line.write(excite * 0.25 + feedback_in * self.feedback_gain, self.damping);
            }

            let wet_sample: f32 = reads.iter().sum::<f32>() * 0.5;
            *sample += wet_sample * wet;
        }
    }

    pub fn flush_denormals(&mut self) {
        for line in &mut self.lines {
            line.flush_denormals();
        }
    }
}

/// 4x4 Hadamard matrix multiply, the standard lossless feedback mix for a
/// small FDN: every output is an equal-weighted +/- combination of every
/// input, which spreads energy between lines without amplifying it.
#[inline]
fn hadamard_mix(x: [f32; 4]) -> [f32; 4] {
    const NORM: f32 = 0.5; // 1/sqrt(4)
    [
        (x[0] + x[1] + x[2] + x[3]) * NORM,
        (x[0] - x[1] + x[2] - x[3]) * NORM,
        (x[0] + x[1] - x[2] - x[3]) * NORM,
        (x[0] - x[1] - x[2] + x[3]) * NORM,
    ]
}
