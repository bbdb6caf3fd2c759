//! Band-interleaved IR assembly (component B, §4.B): turns a cluster's
//! sampled energy IR plus its overflow paths into the per-channel,
//! per-partition frequency-domain partitions the convolution engine
//! expects, via panning, band smoothing, and noise-reconstructed phase.
//!
//! Runs entirely on the update thread pool (§5); never touches the render
//! thread except through [`UpolaEngine::submit_partitions`]'s lock-free
//! handoff.

use std::collections::HashMap;

use realfft::RealFftPlanner;
use rustfft::num_complex::Complex;

use crate::crossover::{Crossover, CrossoverHistory, LowPassHistory};
use crate::ir::convolver::{IrPartitions, PartitionPlan};
use crate::ir::model::{ListenerIr, SampledIr, SoundPath, SourceIr};
use crate::noise::NoiseBank;
use crate::pan::{self, PanGains};
use crate::request::ChannelLayout;
use crate::types::{BandVector, NUM_BANDS, SourceId};

/// Per-cluster assembly state that must persist across successive IR
/// updates: the smoothing filter history (carried across partitions *and*
/// FDLs, §4.B step 4), the noise carrier (regenerated only on growth, §4.B
/// step 5), and the per-source temporal-smoothing cache (the assembler's own
/// §4.B step 4 is spatial/band smoothing; this is a *temporal* cache of the
/// previous frame's energy, keyed by source identity — grounded in the
/// original propagation system's `IRCache::update()`).
pub struct IrAssembler {
    crossover: Crossover,
    low_pass_history: LowPassHistory,
    noise: NoiseBank,
    smoothing_cutoff_hz: f32,
    /// Single-pole IIR coefficient blending this frame's energy with the
    /// cached previous frame's energy, `0` (default) disables smoothing
    /// entirely and reproduces the incoming IR unchanged.
    temporal_smoothing: f32,
    /// Previous frame's (already-smoothed) per-sample energy, one entry per
    /// source that has contributed to this cluster. Discarded via
    /// `forget_source` once a source's membership gain reaches zero.
    energy_history: HashMap<SourceId, SampledIr>,
}

impl IrAssembler {
    pub fn new(crossover: Crossover, smoothing_cutoff_hz: f32) -> Self {
        Self::with_temporal_smoothing(crossover, smoothing_cutoff_hz, 0.0)
    }

    pub fn with_temporal_smoothing(crossover: Crossover, smoothing_cutoff_hz: f32, temporal_smoothing: f32) -> Self {
        Self {
            crossover,
            low_pass_history: LowPassHistory::new(),
            noise: NoiseBank::new(),
            smoothing_cutoff_hz,
            temporal_smoothing: temporal_smoothing.clamp(0.0, 1.0),
            energy_history: HashMap::new(),
        }
    }

    /// Drops the cached previous-frame energy for `source` (§4.B "Temporal
    /// IR smoothing": "discarded when a source's membership in every
    /// cluster reaches zero gain").
    pub fn forget_source(&mut self, source: SourceId) {
        self.energy_history.remove(&source);
    }

    /// Blends `sampled`'s per-sample energy with the cached previous frame's
    /// energy at the same absolute sample index: `energy' = (1-s)*energy +
    /// s*energyPrev` (§4.B "Temporal IR smoothing"). Directions are passed
    /// through unsmoothed — only energy exhibits the frame-to-frame
    /// stochastic variance this filter damps. Updates the cache with the
    /// blended result, matching `IRCache::update`'s "stored in both the
    /// cache and input/output IR".
    fn smooth_energy(&mut self, source: SourceId, sampled: &SampledIr) -> SampledIr {
        if self.temporal_smoothing <= 0.0 {
            return sampled.clone();
        }
        // No cached previous frame for this source yet: seed the cache with
        // the raw IR unchanged, matching the original cache's "first frame"
        // bypass rather than blending toward an assumed-silent history.
        let Some(prev) = self.energy_history.get(&source) else {
            self.energy_history.insert(source, sampled.clone());
            return sampled.clone();
        };
        let s = self.temporal_smoothing;
        let energies = sampled
            .energies
            .iter()
            .enumerate()
            .map(|(i, &energy)| {
                let t = sampled.start_sample + i;
                let prev_energy = prev.at(t).0;
                energy * (1.0 - s) + prev_energy * s
            })
            .collect::<Vec<_>>();
        let blended = SampledIr { start_sample: sampled.start_sample, energies, directions: sampled.directions.clone() };
        self.energy_history.insert(source, blended.clone());
        blended
    }

    /// Builds every FDL's partition set for `source`'s contribution to a
    /// cluster, under `layout`, rotated into `listener`'s local frame.
    /// `extra_paths` are paths that exceeded the discrete-path renderer's
    /// per-source budget and are folded directly into the sampled IR
    /// instead (§4.B step 3).
    pub fn assemble(
        &mut self,
        source: &SourceIr,
        extra_paths: &[SoundPath],
        listener: &ListenerIr,
        layout: &ChannelLayout,
        plan: &PartitionPlan,
        sample_rate: f32,
    ) -> Vec<IrPartitions> {
        let channels = layout.channel_count();
        let total_len = plan.offsets.last().copied().unwrap_or(0) + plan.fdl_sizes.last().copied().unwrap_or(0) * plan.partitions_per_fdl;
        self.noise.ensure_len(total_len, &self.crossover);

        let smoothed_sampled = self.smooth_energy(source.source, &source.sampled);
        let source = SourceIr { sampled: smoothed_sampled, ..source.clone() };

        plan.fdl_sizes
            .iter()
            .zip(&plan.offsets)
            .map(|(&size, &fdl_offset)| {
                self.assemble_fdl(&source, extra_paths, listener, layout, channels, size, fdl_offset, plan.partitions_per_fdl, sample_rate)
            })
            .collect()
    }

    fn assemble_fdl(
        &mut self,
        source: &SourceIr,
        extra_paths: &[SoundPath],
        listener: &ListenerIr,
        layout: &ChannelLayout,
        channels: usize,
        size: usize,
        fdl_offset: usize,
        k: usize,
        sample_rate: f32,
    ) -> IrPartitions {
        let padded = 2 * size;
        let bins = size + 1;
        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(padded);
        let mut scratch = r2c.make_scratch_vec();

        let mut partitions: IrPartitions = vec![vec![None; k]; channels];

        for p in 0..k {
            let t0 = fdl_offset + p * size;
            if t0 >= source.max_delay_samples(sample_rate) && extra_paths.is_empty() {
                continue;
            }

            let per_channel = self.assemble_partition(source, extra_paths, listener, layout, channels, t0, size, sample_rate);

            let mut any_nonzero = false;
            for (c, time_domain) in per_channel.into_iter().enumerate() {
                if time_domain.iter().all(|&v| v == 0.0) {
                    continue;
                }
                any_nonzero = true;
                let mut padded_time = vec![0.0f32; padded];
                padded_time[..size].copy_from_slice(&time_domain);
                let mut spectrum = vec![Complex::new(0.0, 0.0); bins];
                if r2c.process_with_scratch(&mut padded_time, &mut spectrum, &mut scratch).is_ok() {
                    partitions[c][p] = Some(spectrum);
                }
            }
            let _ = any_nonzero;
        }

        partitions
    }

    /// Steps 1-5 of §4.B for one partition `[t0, t0+size)`: pan, band weave,
    /// extra-path injection, low-pass smoothing, and noise-reconstructed
    /// phase. Returns one time-domain vector of length `size` per channel.
    fn assemble_partition(
        &mut self,
        source: &SourceIr,
        extra_paths: &[SoundPath],
        listener: &ListenerIr,
        layout: &ChannelLayout,
        channels: usize,
        t0: usize,
        size: usize,
        sample_rate: f32,
    ) -> Vec<Vec<f32>> {
        // Per-channel band-interleaved accumulation (`out[t][b]` per channel).
        let mut banded: Vec<Vec<BandVector>> = vec![vec![BandVector::ZERO; size]; channels];

        for i in 0..size {
            let t = t0 + i;
            let (energy, direction) = source.sampled.at(t);
            if energy.is_zero() && direction.is_zero() {
                continue;
            }
            let local_direction = listener.to_listener_local(direction);
            let gains = pan::pan(local_direction, layout);
            let weighted = energy.sqrt();
            for (c, &g) in gains.as_slice().iter().enumerate() {
                banded[c][i] = weighted * g;
            }
        }

        for path in extra_paths {
            let delay_samples = (path.delay_seconds * sample_rate).round() as isize;
            let idx = delay_samples - t0 as isize;
            if idx < 0 || idx as usize >= size {
                continue;
            }
            let local_direction = listener.to_listener_local(path.direction);
            let gains = pan_gains_for_layout(layout, local_direction, channels);
            let weighted = path.energy.sqrt();
            for (c, &g) in gains.iter().enumerate() {
                banded[c][idx as usize] += weighted * g;
            }
        }

        let mut smoothed: Vec<Vec<BandVector>> = vec![vec![BandVector::ZERO; size]; channels];
        for c in 0..channels {
            self.crossover.filter_low_pass(&mut self.low_pass_history, self.smoothing_cutoff_hz, &banded[c], &mut smoothed[c]);
        }

        (0..channels)
            .map(|c| {
                (0..size)
                    .map(|i| {
                        let noise = self.noise.sample(t0 + i);
                        (smoothed[c][i] * noise).sum()
                    })
                    .collect()
            })
            .collect()
    }
}

fn pan_gains_for_layout(layout: &ChannelLayout, direction: crate::types::Vector3, channels: usize) -> Vec<f32> {
    let gains: PanGains = pan::pan(direction, layout);
    let slice = gains.as_slice();
    if slice.len() == channels {
        slice.to_vec()
    } else {
        vec![0.0; channels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrequencyBandConfig, Vector3};

    fn plan() -> PartitionPlan {
        PartitionPlan::new(16.0 / 1000.0, 48_000.0, 0.05, 4096, 2)
    }

    #[test]
    fn silent_source_produces_no_partitions() {
        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, 48_000.0);
        let mut assembler = IrAssembler::new(crossover, 200.0);

        let source = SourceIr::default();
        let listener = ListenerIr { listener_forward: Vector3::new(0.0, 0.0, 1.0), listener_up: Vector3::new(0.0, 1.0, 0.0), ..Default::default() };
        let partitions = assembler.assemble(&source, &[], &listener, &ChannelLayout::Stereo, &plan(), 48_000.0);

        for fdl in partitions {
            for channel in fdl {
                assert!(channel.iter().all(Option::is_none));
            }
        }
    }

    #[test]
    fn impulse_source_produces_nonzero_first_partition() {
        use crate::ir::model::SampledIr;

        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, 48_000.0);
        let mut assembler = IrAssembler::new(crossover, 4_000.0);

        let mut energies = vec![BandVector::ZERO; 8];
        energies[0] = BandVector::splat(1.0);
        let source = SourceIr {
            sampled: SampledIr { start_sample: 0, energies, directions: vec![Vector3::new(0.0, 0.0, 1.0); 8] },
            ..SourceIr::new(crate::types::SourceId(1))
        };
        let listener = ListenerIr { listener_forward: Vector3::new(0.0, 0.0, 1.0), listener_up: Vector3::new(0.0, 1.0, 0.0), ..Default::default() };
        let partitions = assembler.assemble(&source, &[], &listener, &ChannelLayout::Mono, &plan(), 48_000.0);

        assert!(partitions[0][0][0].is_some());
    }

    #[test]
    fn temporal_smoothing_blends_toward_the_previous_frames_energy() {
        use crate::ir::model::SampledIr;

        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, 48_000.0);
        let mut assembler = IrAssembler::with_temporal_smoothing(crossover, 4_000.0, 0.5);

        let listener = ListenerIr { listener_forward: Vector3::new(0.0, 0.0, 1.0), listener_up: Vector3::new(0.0, 1.0, 0.0), ..Default::default() };
        let source_id = crate::types::SourceId(7);

        let frame = |value: f32| SourceIr {
            sampled: SampledIr { start_sample: 0, energies: vec![BandVector::splat(value)], directions: vec![Vector3::new(0.0, 0.0, 1.0)] },
            ..SourceIr::new(source_id)
        };

        // First frame: no history yet, passes through unchanged.
        let first = assembler.smooth_energy(source_id, &frame(1.0).sampled);
        assert_eq!(first.energies[0].sum(), BandVector::splat(1.0).sum());

        // Second frame: blends 0.5 of the new value (0.0) with 0.5 of the
        // cached previous frame (1.0), landing at 0.5, not 0.0.
        let second = assembler.smooth_energy(source_id, &frame(0.0).sampled);
        let expected = BandVector::splat(0.5).sum();
        assert!((second.energies[0].sum() - expected).abs() < 1e-5, "expected {expected}, got {}", second.energies[0].sum());

        // Forgetting the source drops the cache: the next frame passes
        // through unchanged again, as if it were the first.
        assembler.forget_source(source_id);
        let after_forget = assembler.smooth_energy(source_id, &frame(0.0).sampled);
        assert_eq!(after_forget.energies[0].sum(), 0.0);
    }

    #[test]
    fn zero_smoothing_coefficient_disables_the_cache() {
        use crate::ir::model::SampledIr;

        let bands = FrequencyBandConfig::default();
        let crossover = Crossover::new(&bands, 48_000.0);
        let mut assembler = IrAssembler::new(crossover, 4_000.0);
        let source_id = crate::types::SourceId(3);

        let sampled = SampledIr { start_sample: 0, energies: vec![BandVector::splat(1.0)], directions: vec![Vector3::new(0.0, 0.0, 1.0)] };
        assembler.smooth_energy(source_id, &sampled);
        let sampled_zero = SampledIr { start_sample: 0, energies: vec![BandVector::ZERO], directions: vec![Vector3::new(0.0, 0.0, 1.0)] };
        let result = assembler.smooth_energy(source_id, &sampled_zero);
        assert_eq!(result.energies[0].sum(), 0.0, "default coefficient 0 must disable smoothing entirely");
    }
}
