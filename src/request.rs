//! The core's entire configuration surface (§6, §10.3). `RenderRequest` is a
//! plain serde-derived struct, mirroring the teacher's small serde-derived
//! config types (`FilterType`, `ConvolverType`): the host can serialize it as
//! part of its own scene format without this crate depending on a file
//! format or CLI parser.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::types::Vector3;

bitflags! {
    /// Which of the optional rendering stages are active. `CONVOLUTION` and
    /// `DISCRETE_PATHS` are the two halves of the IR; `HRTF` and `REVERB`
    /// layer on top of them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RenderFlags: u32 {
        const DISCRETE_PATHS = 1 << 0;
        const CONVOLUTION    = 1 << 1;
        const HRTF           = 1 << 2;
        const REVERB         = 1 << 3;
        const STATISTICS     = 1 << 4;
    }
}

impl Default for RenderFlags {
    fn default() -> Self {
        RenderFlags::DISCRETE_PATHS | RenderFlags::CONVOLUTION
    }
}

/// A speaker position on the unit sphere for an arbitrary surround layout,
/// used by the VBAP panner (§4.B).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeakerPosition {
    pub direction: Vector3Dto,
}

/// `serde`-friendly mirror of `Vector3` (the math type itself intentionally
/// carries no serde impls, to keep it a pure value type for the hot path).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3Dto {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl From<Vector3Dto> for Vector3 {
    fn from(v: Vector3Dto) -> Self {
        Vector3::new(v.x, v.y, v.z)
    }
}

impl From<Vector3> for Vector3Dto {
    fn from(v: Vector3) -> Self {
        Vector3Dto { x: v.x, y: v.y, z: v.z }
    }
}

/// Output channel layout. A tagged variant rather than a trait object (§9
/// "Replacing dynamic polymorphism") so the per-sample pan loop specialises
/// on the common `Mono`/`Stereo` cases without a vtable indirection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    AmbisonicB,
    /// Arbitrary loudspeaker layout, panned via VBAP over the given speaker
    /// triangulation. Triangle indices are into `speakers`.
    Surround {
        speakers: Vec<SpeakerPosition>,
        triangles: Vec<[u16; 3]>,
    },
}

impl ChannelLayout {
    pub fn channel_count(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::AmbisonicB => 4,
            ChannelLayout::Surround { speakers, .. } => speakers.len(),
        }
    }
}

/// The full, in-process configuration snapshot (§6). Reconfiguration is
/// staged through the update thread pool and applied at the next convenient
/// block boundary (§10.3) — never by mutating state the render thread is
/// reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderRequest {
    pub channel_layout: ChannelLayout,
    pub sample_rate: u32,
    pub hrtf_enabled: bool,
    /// Target end-to-end latency in seconds; drives `L0` (§4.A).
    pub max_latency: f32,
    /// Longest IR the convolution engine will cover, in seconds; longer IRs
    /// are truncated (§7 resource exhaustion).
    pub max_ir_length: f32,
    pub max_source_path_count: usize,
    /// Longest discrete-path delay the path renderer's ring buffer covers,
    /// in seconds.
    pub max_path_delay: f32,
    /// Maximum delay-line slew rate, in samples/second, for Doppler and
    /// fade interpolation.
    pub max_delay_rate: f32,
    pub ir_fade_time: f32,
    /// Single-pole IIR coefficient `s` blending each incoming sampled IR's
    /// per-sample energy with the previous frame's, in `[0, 1]`; `0`
    /// (default) disables temporal smoothing entirely (§4.B "Temporal IR
    /// smoothing").
    pub ir_temporal_smoothing: f32,
    pub hrtf_fade_time: f32,
    pub path_fade_time: f32,
    pub source_fade_time: f32,
    pub cluster_fade_in_time: f32,
    pub cluster_fade_out_time: f32,
    pub volume: f32,
    pub max_hrtf_order: usize,
    pub reverb_time: f32,
    pub flags: RenderFlags,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            channel_layout: ChannelLayout::Stereo,
            sample_rate: 48_000,
            hrtf_enabled: false,
            max_latency: 16.0 / 1_000.0, // -> L0 = 256 at 48 kHz, per §8
            max_ir_length: 2.0,
            max_source_path_count: 32,
            max_path_delay: 0.5,
            max_delay_rate: 4_000.0,
            ir_fade_time: 0.05,
            ir_temporal_smoothing: 0.0,
            hrtf_fade_time: 0.05,
            path_fade_time: 0.05,
            source_fade_time: 0.1,
            cluster_fade_in_time: 0.05,
            cluster_fade_out_time: 0.25,
            volume: 1.0,
            max_hrtf_order: 4,
            reverb_time: 0.0,
            flags: RenderFlags::default(),
        }
    }
}

impl RenderRequest {
    /// Clamps user-supplied fade/rate fields to non-negative values, the way
    /// the original renderer sanitised an incoming request before using it
    /// (see the grounding note in DESIGN.md).
    pub fn sanitized(mut self) -> Self {
        self.max_delay_rate = self.max_delay_rate.max(0.0);
        self.ir_fade_time = self.ir_fade_time.max(0.0);
        self.ir_temporal_smoothing = self.ir_temporal_smoothing.clamp(0.0, 1.0);
        self.hrtf_fade_time = self.hrtf_fade_time.max(0.0);
        self.path_fade_time = self.path_fade_time.max(0.0);
        self.source_fade_time = self.source_fade_time.max(0.0);
        self.cluster_fade_in_time = self.cluster_fade_in_time.max(0.0);
        self.cluster_fade_out_time = self.cluster_fade_out_time.max(0.0);
        self
    }
}

/// Optional, in-place populated statistics (§6), gated by
/// `RenderFlags::STATISTICS`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RenderStatistics {
    /// CPU time spent rendering as a fraction of real time (1.0 == running
    /// exactly at the real-time deadline).
    pub rendering_load: f32,
    /// End-to-end latency in seconds, i.e. `convolution_latency` plus any
    /// additional buffering.
    pub rendering_latency: f32,
    pub rendered_path_count: usize,
    pub rendering_memory_bytes: usize,
}
