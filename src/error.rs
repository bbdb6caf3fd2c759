//! Non-realtime error surface.
//!
//! Per the error-handling design: the only conditions that ever become an
//! `Err` are the "mismatched format" kind (§7) — everything that can resolve
//! itself on the next frame (a skipped IR submission, a clamped path count,
//! a truncated IR) is a silent, counted degradation instead, observable only
//! through `RenderStatistics` and the `log` lines emitted from the update
//! pool. Render-path code never returns `Result` at all.

use std::fmt;

/// Fatal, non-realtime errors raised by the core's setup and reconfiguration
/// APIs. Construction failures and mid-stream format mismatches both surface
/// here; the caller is always able to rebuild the affected listener/cluster
/// at the next block boundary.
#[derive(Debug)]
pub enum CoreError {
    /// The sample rate changed mid-stream without a full listener rebuild.
    SampleRateChanged { previous: u32, requested: u32 },
    /// The channel count of a convolution instance's IR changed shape.
    ChannelCountChanged { previous: usize, requested: usize },
    /// The frequency band configuration changed without a restart.
    BandConfigChanged { previous: usize, requested: usize },
    /// A `RenderRequest` described a channel layout that cannot be realised
    /// (e.g. a surround layout with fewer than 1 speaker, or a malformed
    /// VBAP triangulation).
    InvalidChannelLayout(String),
    /// An HRTF projection could not converge within `maxHRTFOrder`.
    HrtfProjectionFailed(String),
    /// Wraps an underlying FFT planner or resampler construction failure.
    Backend(anyhow::Error),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::SampleRateChanged { previous, requested } => write!(
                f,
                "sample rate changed mid-stream: {previous} Hz -> {requested} Hz, stream restart required"
            ),
            CoreError::ChannelCountChanged { previous, requested } => write!(
                f,
                "channel count changed mid-stream: {previous} -> {requested}, stream restart required"
            ),
            CoreError::BandConfigChanged { previous, requested } => write!(
                f,
                "frequency band configuration changed mid-stream: {previous} -> {requested} bands, stream restart required"
            ),
            CoreError::InvalidChannelLayout(msg) => write!(f, "invalid channel layout: {msg}"),
            CoreError::HrtfProjectionFailed(msg) => write!(f, "HRTF projection failed: {msg}"),
            CoreError::Backend(err) => write!(f, "backend error: {err}"),
        }
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoreError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Backend(err)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
