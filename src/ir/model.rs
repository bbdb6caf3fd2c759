//! IR data model (§3): the shapes propagation updates arrive in, before
//! band assembly and path rendering turn them into renderable state.

use bitflags::bitflags;

use crate::types::{BandVector, SourceId, Vector3};

bitflags! {
    /// Flags carried on a single `SoundPath`. `IS_DIRECT` marks the direct
    /// (line-of-sight) arrival; `IS_HRTF` additionally routes the path to
    /// the HRTF bus instead of the channel-layout panner (§4.C step 2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PathFlags: u32 {
        const IS_DIRECT = 1 << 0;
        const IS_HRTF   = 1 << 1;
    }
}

/// A single specular/early-reflection path (§3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundPath {
    pub energy: BandVector,
    /// Unit-length arrival direction, listener-relative.
    pub direction: Vector3,
    pub delay_seconds: f32,
    /// Source/listener relative speed along the path, m/s, signed; feeds the
    /// Doppler rate in the path renderer (§4.C step 3).
    pub relative_speed: f32,
    pub flags: PathFlags,
}

impl SoundPath {
    pub fn is_direct(&self) -> bool {
        self.flags.contains(PathFlags::IS_DIRECT)
    }

    pub fn is_hrtf(&self) -> bool {
        self.flags.contains(PathFlags::IS_HRTF)
    }

    /// A stable hash identifying "the same path" across frames, so the path
    /// renderer can retain delay/gain state for it (§8 "Ordering"). Paths
    /// don't carry an explicit id in the wire format, so the hash is derived
    /// from direction-independent, slowly-varying fields: flags plus a
    /// coarse quantisation of the arrival direction. Two genuinely distinct
    /// paths arriving from materially different directions hash apart; a
    /// path that merely moved a few degrees between frames hashes the same,
    /// which is the desired "this is still that path" behaviour.
    pub fn stable_hash(&self, source: SourceId, path_slot: usize) -> u64 {
        let quantize = |v: f32| -> i32 { (v * 64.0).round() as i32 };
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mix = |h: u64, v: i64| -> u64 {
            (h ^ (v as u64)).wrapping_mul(0x0000_0100_0000_01B3)
        };
        h = mix(h, source.0 as i64);
        h = mix(h, path_slot as i64);
        h = mix(h, i64::from(quantize(self.direction.x)));
        h = mix(h, i64::from(quantize(self.direction.y)));
        h = mix(h, i64::from(quantize(self.direction.z)));
        h = mix(h, i64::from(self.flags.bits()));
        h
    }
}

/// Discrete time-grid samples of a sampled IR (§3): per-sample energy and
/// arrival direction, covering `[start_sample, end_sample)` at the system
/// sample rate.
#[derive(Debug, Clone, Default)]
pub struct SampledIr {
    pub start_sample: usize,
    pub energies: Vec<BandVector>,
    pub directions: Vec<Vector3>,
}

impl SampledIr {
    pub fn end_sample(&self) -> usize {
        self.start_sample + self.energies.len()
    }

    pub fn len(&self) -> usize {
        self.energies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.energies.is_empty()
    }

    /// Energy/direction at absolute sample index `t`, or silence if `t`
    /// falls outside the covered range.
    pub fn at(&self, t: usize) -> (BandVector, Vector3) {
        if t < self.start_sample || t >= self.end_sample() {
            return (BandVector::ZERO, Vector3::ZERO);
        }
        let i = t - self.start_sample;
        (self.energies[i], self.directions[i])
    }
}

/// One source's contribution to a `ListenerIr`: the sampled energy IR plus
/// its discrete early-reflection paths (§3).
#[derive(Debug, Clone, Default)]
pub struct SourceIr {
    /// Primary identity this entry is keyed by in `ListenerIr::sources`.
    pub source: SourceId,
    /// Every source identity this entry actually represents. Usually just
    /// `[source]`, but the propagation stage may bundle several nearby
    /// sources that already share one path into a single `SourceIr`; the
    /// clusterer (§4.D) attaches *all* of them to whichever cluster any one
    /// of them already belongs to.
    pub contributing_sources: Vec<SourceId>,
    pub sampled: SampledIr,
    pub paths: Vec<SoundPath>,
}

impl SourceIr {
    pub fn new(source: SourceId) -> Self {
        Self { source, contributing_sources: vec![source], sampled: SampledIr::default(), paths: Vec::new() }
    }
}

impl SourceIr {
    /// The longest delay among this source's contribution, in samples at
    /// `sample_rate` — the sampled IR's tail or the furthest path, whichever
    /// reaches later. Drives the FDL plan's coverage requirement (§4.A).
    pub fn max_delay_samples(&self, sample_rate: f32) -> usize {
        let sampled_tail = self.sampled.end_sample();
        let path_tail = self
            .paths
            .iter()
            .map(|p| (p.delay_seconds * sample_rate).round() as usize)
            .max()
            .unwrap_or(0);
        sampled_tail.max(path_tail)
    }
}

/// A full propagation update for one listener (§3): every source's IR plus
/// the listener's current orientation. Submitted at the propagation rate
/// (10-30 Hz), far below the audio sample rate.
#[derive(Debug, Clone, Default)]
pub struct ListenerIr {
    pub sources: Vec<SourceIr>,
    /// Listener-forward direction in world space, used to rotate arrival
    /// directions into listener-local space before panning (§4.B step 1).
    pub listener_forward: Vector3,
    pub listener_up: Vector3,
    /// Listener acoustic sensitivity in dB; converted to a linear gain via
    /// `10^(sensitivity/10)` in the output mix (§4.D "Output mix"). `0`
    /// leaves the mix unscaled.
    pub sensitivity: f32,
}

impl ListenerIr {
    /// Rotates a world-space direction into listener-local space using the
    /// listener's forward/up basis. `right` completes a right-handed frame.
    pub fn to_listener_local(&self, world_direction: Vector3) -> Vector3 {
        let Some(forward) = self.listener_forward.normalized() else {
            return world_direction;
        };
        let up = self.listener_up.normalized().unwrap_or(Vector3::new(0.0, 1.0, 0.0));
        let right = cross(forward, up);
        let Some(right) = right.normalized() else {
            return world_direction;
        };
        let up = cross(right, forward);
        Vector3::new(world_direction.dot(right), world_direction.dot(up), world_direction.dot(forward))
    }
}

fn cross(a: Vector3, b: Vector3) -> Vector3 {
    Vector3::new(a.y * b.z - a.z * b.y, a.z * b.x - a.x * b.z, a.x * b.y - a.y * b.x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_insensitive_to_small_direction_jitter() {
        let a = SoundPath {
            energy: BandVector::ZERO,
            direction: Vector3::new(1.0, 0.0, 0.0),
            delay_seconds: 0.01,
            relative_speed: 0.0,
            flags: PathFlags::empty(),
        };
        let mut b = a;
        b.direction = Vector3::new(1.0, 0.001, 0.0);
        assert_eq!(a.stable_hash(SourceId(1), 0), b.stable_hash(SourceId(1), 0));
    }

    #[test]
    fn stable_hash_differs_across_sources() {
        let p = SoundPath {
            energy: BandVector::ZERO,
            direction: Vector3::new(1.0, 0.0, 0.0),
            delay_seconds: 0.01,
            relative_speed: 0.0,
            flags: PathFlags::empty(),
        };
        assert_ne!(p.stable_hash(SourceId(1), 0), p.stable_hash(SourceId(2), 0));
    }

    #[test]
    fn listener_local_identity_when_forward_is_z() {
        let listener = ListenerIr {
            sources: Vec::new(),
            listener_forward: Vector3::new(0.0, 0.0, 1.0),
            listener_up: Vector3::new(0.0, 1.0, 0.0),
            sensitivity: 0.0,
        };
        let local = listener.to_listener_local(Vector3::new(1.0, 2.0, 3.0));
        assert!((local.x - 1.0).abs() < 1e-5);
        assert!((local.y - 2.0).abs() < 1e-5);
        assert!((local.z - 3.0).abs() < 1e-5);
    }
}
