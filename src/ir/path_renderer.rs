//! Discrete-path delay-line renderer (component C, §4.C): a bank of
//! fractional-delay taps with per-channel, per-band gain interpolation for
//! early reflections and, optionally, the direct-to-HRTF path.

use std::collections::HashMap;

use crate::crossover::{Crossover, CrossoverHistory};
use crate::ir::model::SoundPath;
use crate::pan::{self};
use crate::request::ChannelLayout;
use crate::types::{BandVector, NUM_BANDS, SourceId};

/// Speed of sound, m/s, used to turn a path's relative speed into a delay
/// slew rate for Doppler (§4.C step 3).
const SPEED_OF_SOUND_M_S: f32 = 343.0;
/// Below this delay-rate magnitude (samples/sec) the Doppler estimate is
/// treated as noise and the block's own midpoint rate is used instead.
const DOPPLER_SIGNIFICANCE_THRESHOLD: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct GainLerp {
    current: f32,
    target: f32,
    step: f32,
}

impl GainLerp {
    fn retarget(&mut self, target: f32, ramp_samples: f32) {
        self.target = target;
        self.step = if ramp_samples > 0.0 { (target - self.current) / ramp_samples } else { target - self.current };
    }

    #[inline]
    fn advance(&mut self) -> f32 {
        let value = self.current;
        if (self.step > 0.0 && self.current < self.target) || (self.step < 0.0 && self.current > self.target) {
            self.current += self.step;
        } else {
            self.current = self.target;
        }
        value
    }
}

/// One tracked path's delay and per-band gain state, keyed by its stable
/// hash so state survives across frames for the *same* path (§8 "Ordering").
struct PathState {
    current_delay_samples: f32,
    target_delay_samples: f32,
    relative_speed: f32,
    is_hrtf: bool,
    gains: Vec<Vec<GainLerp>>, // [channel][band]
    last_seen_frame: u64,
    fading_out: bool,
}

/// Per-cluster discrete-path renderer state: the band-interleaved delay
/// ring plus every currently tracked [`PathState`].
pub struct PathRenderer {
    ring: Vec<BandVector>,
    write_idx: usize,
    crossover_history: CrossoverHistory,
    states: HashMap<u64, PathState>,
    channels: usize,
    max_delay_rate_samples_per_sec: f32,
    max_path_delay_samples: usize,
    path_fade_time: f32,
    convolution_latency_samples: usize,
    frame_counter: u64,
}

impl PathRenderer {
    pub fn new(
        channels: usize,
        max_path_delay_samples: usize,
        max_delay_rate_samples_per_sec: f32,
        path_fade_time: f32,
        convolution_latency_samples: usize,
    ) -> Self {
        let ring_len = (2 * max_path_delay_samples).max(4);
        Self {
            ring: vec![BandVector::ZERO; ring_len],
            write_idx: 0,
            crossover_history: CrossoverHistory::new(),
            states: HashMap::new(),
            channels,
            max_delay_rate_samples_per_sec,
            max_path_delay_samples,
            path_fade_time,
            convolution_latency_samples,
            frame_counter: 0,
        }
    }

    /// Starts a new propagation update for this cluster. Call once per
    /// update before any [`Self::consume_new_paths`] calls — a cluster may
    /// aggregate several sources, each contributing its own path list in a
    /// separate call, and all of them must be judged against the same
    /// frame boundary for staleness.
    pub fn begin_update(&mut self) {
        self.frame_counter += 1;
    }

    /// Ingests a fresh path list from the propagation update (§4.C step 2):
    /// allocates/updates a [`PathState`] per path by stable hash and retargets
    /// its delay and per-band gains. Any state not refreshed this call will
    /// begin fading out once `retire_stale` is called for the frame.
    pub fn consume_new_paths(&mut self, source: SourceId, paths: &[SoundPath], layout: &ChannelLayout, sample_rate: f32) {
        for (slot, path) in paths.iter().enumerate() {
            let hash = path.stable_hash(source, slot);
            let target_delay = path.delay_seconds * sample_rate
                + if path.is_hrtf() { 0.0 } else { self.convolution_latency_samples as f32 };
            let target_gains = target_gains_for(path, layout, self.channels);

            let ramp_samples = self.path_fade_time * sample_rate;
            let state = self.states.entry(hash).or_insert_with(|| PathState {
                current_delay_samples: target_delay,
                target_delay_samples: target_delay,
                relative_speed: path.relative_speed,
                is_hrtf: path.is_hrtf(),
                gains: vec![vec![GainLerp { current: 0.0, target: 0.0, step: 0.0 }; NUM_BANDS]; self.channels],
                last_seen_frame: self.frame_counter,
                fading_out: false,
            });
            state.target_delay_samples = target_delay;
            state.relative_speed = path.relative_speed;
            state.is_hrtf = path.is_hrtf();
            state.last_seen_frame = self.frame_counter;
            state.fading_out = false;
            for (c, channel_gains) in target_gains.iter().enumerate() {
                for (b, &g) in channel_gains.iter().enumerate() {
                    state.gains[c][b].retarget(g, ramp_samples);
                }
            }
        }
    }

    /// Starts a fade-to-zero for any path not refreshed this frame, and
    /// drops paths whose gain has reached zero (§4.C step 4).
    fn retire_stale(&mut self, sample_rate: f32) {
        let ramp_samples = self.path_fade_time * sample_rate;
        for state in self.states.values_mut() {
            if state.last_seen_frame < self.frame_counter && !state.fading_out {
                state.fading_out = true;
                for channel_gains in &mut state.gains {
                    for gain in channel_gains {
                        gain.retarget(0.0, ramp_samples);
                    }
                }
            }
        }
        self.states.retain(|_, state| !state.fading_out || state.gains.iter().flatten().any(|g| g.current.abs() > 1e-6));
    }

    /// Crossover-filters `cluster_input` into the delay ring, then renders
    /// every tracked path's contribution for this block into `output`
    /// (channel layout bus) and `hrtf_output` (direct-to-HRTF bus).
    pub fn render_block(
        &mut self,
        crossover: &Crossover,
        cluster_input: &[f32],
        output: &mut [Vec<f32>],
        hrtf_output: &mut [Vec<f32>],
        sample_rate: f32,
    ) {
        let n = cluster_input.len();
        let mut banded = vec![BandVector::ZERO; n];
        crossover.filter_scalar(&mut self.crossover_history, cluster_input, &mut banded);
        for &sample in &banded {
            self.ring[self.write_idx] = sample;
            self.write_idx = (self.write_idx + 1) % self.ring.len();
        }

        let ring_len = self.ring.len() as f32;
        for state in self.states.values_mut() {
            let delta = state.target_delay_samples - state.current_delay_samples;
            let midpoint_rate = delta * sample_rate / n as f32;
            let doppler_rate = -state.relative_speed * sample_rate / SPEED_OF_SOUND_M_S;
            let rate = if doppler_rate.abs() > DOPPLER_SIGNIFICANCE_THRESHOLD { doppler_rate } else { midpoint_rate };
            let rate = rate.clamp(-self.max_delay_rate_samples_per_sec, self.max_delay_rate_samples_per_sec);
            let per_sample_delta = rate / sample_rate;

            let bus: &mut [Vec<f32>] = if state.is_hrtf { hrtf_output } else { &mut *output };

            for i in 0..n {
                let write_pos_now = (self.write_idx as f32 - (n - i) as f32 + ring_len * 2.0) % ring_len;
                let read_pos = (write_pos_now - state.current_delay_samples + ring_len * 2.0) % ring_len;
                let sample = self.read_interpolated(read_pos);

                for (c, channel_gains) in state.gains.iter_mut().enumerate() {
                    let mut value = 0.0f32;
                    for (b, gain) in channel_gains.iter_mut().enumerate() {
                        value += sample[b] * gain.advance();
                    }
                    if let Some(out) = bus.get_mut(c).and_then(|ch| ch.get_mut(i)) {
                        *out += value;
                    }
                }

                state.current_delay_samples =
                    (state.current_delay_samples + per_sample_delta).clamp(0.0, self.max_path_delay_samples as f32);
            }
        }

        self.retire_stale(sample_rate);
    }

    fn read_interpolated(&self, pos: f32) -> BandVector {
        let len = self.ring.len();
        let base = pos.floor();
        let frac = pos - base;
        let i0 = (base as usize) % len;
        let i1 = (i0 + 1) % len;
        let a = self.ring[i0];
        let b = self.ring[i1];
        a * (1.0 - frac) + b * frac
    }

    pub fn active_path_count(&self) -> usize {
        self.states.len()
    }
}

/// Per-channel, per-band target gains for `path`: `IS_DIRECT` paths pan
/// equally to every channel, HRTF paths bypass the channel-layout panner
/// entirely (their energy is summed per-band, the pan work happens in the
/// HRTF evaluation instead), everything else uses the normal panner.
fn target_gains_for(path: &SoundPath, layout: &ChannelLayout, channels: usize) -> Vec<[f32; NUM_BANDS]> {
    // HRTF paths bypass the channel-layout panner entirely: the direction-
    // dependent shaping happens in the HRTF filter itself (§4.B), so every
    // bus channel here just carries the path's raw per-band energy.
    if path.is_hrtf() || path.flags.contains(crate::ir::model::PathFlags::IS_DIRECT) {
        let energy = path.energy.sqrt();
        return vec![*energy.as_slice(); channels];
    }
    let gains = pan::pan(path.direction, layout);
    let slice = gains.as_slice();
    let energy = path.energy.sqrt();
    (0..channels)
        .map(|c| {
            let g = slice.get(c).copied().unwrap_or(0.0);
            let mut out = [0.0f32; NUM_BANDS];
            for b in 0..NUM_BANDS {
                out[b] = energy[b] * g;
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::model::PathFlags;
    use crate::types::{FrequencyBandConfig, Vector3};

    #[test]
    fn direct_impulse_path_arrives_at_its_delay_plus_convolution_latency() {
        let sample_rate = 48_000.0;
        let l0 = 256;
        let mut renderer = PathRenderer::new(1, 48_000, 4_000.0, 0.0, 3 * l0);
        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, sample_rate);

        let path = SoundPath {
            energy: BandVector::splat(1.0),
            direction: Vector3::ZERO,
            delay_seconds: 1.0 / 343.0,
            relative_speed: 0.0,
            flags: PathFlags::IS_DIRECT,
        };
        renderer.begin_update();
        renderer.consume_new_paths(SourceId(1), &[path], &ChannelLayout::Mono, sample_rate);

        let total_samples = 3 * l0 + (sample_rate / 343.0).round() as usize + 16;
        let mut input = vec![0.0f32; total_samples];
        input[0] = 1.0;
        let mut output = vec![vec![0.0f32; total_samples]];
        let mut hrtf_bus = vec![vec![0.0f32; total_samples]];
        renderer.render_block(&crossover, &input, &mut output, &mut hrtf_bus, sample_rate);

        let expected = 3 * l0 + (sample_rate / 343.0).round() as usize;
        let peak = output[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!((peak as isize - expected as isize).unsigned_abs() <= 2, "expected peak near {expected}, got {peak}");
    }

    #[test]
    fn stale_path_fades_out_and_is_removed() {
        let sample_rate = 48_000.0;
        let mut renderer = PathRenderer::new(1, 4_800, 4_000.0, 0.01, 0);
        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, sample_rate);

        let path = SoundPath {
            energy: BandVector::splat(1.0),
            direction: Vector3::ZERO,
            delay_seconds: 0.0,
            relative_speed: 0.0,
            flags: PathFlags::IS_DIRECT,
        };
        renderer.begin_update();
        renderer.consume_new_paths(SourceId(1), &[path], &ChannelLayout::Mono, sample_rate);
        assert_eq!(renderer.active_path_count(), 1);

        // Refresh frame counter with an empty list for enough blocks that
        // the fade (10 ms) plus a safety margin completes.
        for _ in 0..20 {
            renderer.begin_update();
            renderer.consume_new_paths(SourceId(1), &[], &ChannelLayout::Mono, sample_rate);
            let input = vec![0.0f32; 512];
            let mut output = vec![vec![0.0f32; 512]];
            let mut hrtf_bus = vec![vec![0.0f32; 512]];
            renderer.render_block(&crossover, &input, &mut output, &mut hrtf_bus, sample_rate);
        }
        assert_eq!(renderer.active_path_count(), 0);
    }
}
