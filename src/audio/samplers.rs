//! Per-source sample-rate conversion (§6 "SourceSoundBuffer"): each source
//! supplies mono audio at its own native rate; the listener resamples it to
//! the system rate before it ever reaches the clusterer.
//!
//! Grounded on the teacher's `Samplers` (`rubato::FftFixedInOut` wrapped with
//! fixed input/output buffer allocation), generalised from its fixed
//! 48 kHz-to-oversampled-rate pair to an arbitrary native-rate-to-system-rate
//! pair per source, and down-mixing multi-channel source input to mono first
//! since a `SourcePath`'s energy is a single band-interleaved BandVector
//! (§3), not a channel-indexed one.

use anyhow::{Context, Result};
use rubato::{FftFixedInOut, Resampler};

/// Resamples one source's native-rate input to the system rate, downmixing
/// to mono on the way in. Kept per source (not shared) because `rubato`'s
/// FFT resampler carries its own filter history.
pub struct SourceResampler {
    resampler: Option<FftFixedInOut<f32>>,
    input_buffer: Vec<Vec<f32>>,
    output_buffer: Vec<Vec<f32>>,
    native_rate: u32,
    system_rate: u32,
}

impl SourceResampler {
    /// `chunk_frames` is the number of native-rate frames each `push` call
    /// must supply; `rubato`'s fixed-I/O resampler requires a constant input
    /// size per call.
    pub fn new(native_rate: u32, system_rate: u32, chunk_frames: usize) -> Result<Self> {
        let resampler = if native_rate == system_rate {
            None
        } else {
            Some(
                FftFixedInOut::new(native_rate as usize, system_rate as usize, chunk_frames, 1)
                    .context("failed to construct source resampler")?,
            )
        };

        let input_buffer = vec![vec![0.0f32; chunk_frames]];
        let output_buffer = match &resampler {
            Some(r) => r.output_buffer_allocate(true),
            None => vec![vec![0.0f32; chunk_frames]],
        };

        Ok(Self { resampler, input_buffer, output_buffer, native_rate, system_rate })
    }

    pub fn native_rate(&self) -> u32 {
        self.native_rate
    }

    pub fn system_rate(&self) -> u32 {
        self.system_rate
    }

    /// Down-mixes `channels` of native-rate input (interleaved by channel,
    /// i.e. `channels[c][frame]`) to mono, resamples it to the system rate,
    /// and returns the resulting mono block.
    pub fn push(&mut self, channels: &[Vec<f32>]) -> Result<&[f32]> {
        let frames = self.input_buffer[0].len();
        let chans = channels.len().max(1) as f32;
        for i in 0..frames {
            let mut sum = 0.0f32;
            for channel in channels {
                sum += channel.get(i).copied().unwrap_or(0.0);
            }
            self.input_buffer[0][i] = sum / chans;
        }

        let Some(resampler) = &mut self.resampler else {
            self.output_buffer[0].copy_from_slice(&self.input_buffer[0]);
            return Ok(&self.output_buffer[0]);
        };

        let (_, produced) = resampler
            .process_into_buffer(&self.input_buffer, &mut self.output_buffer, None)
            .context("source resampler failed")?;
        Ok(&self.output_buffer[0][..produced])
    }
}
