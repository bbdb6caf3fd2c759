//! Channel-layout panners (§4.B step 1): turn a rotated arrival direction
//! into a per-channel gain vector. Dispatch is a `match` on the tagged
//! `ChannelLayout` rather than a trait object, per §9's "replacing dynamic
//! polymorphism" note — the same non-virtual-dispatch shape the teacher uses
//! for its `Convolver` enum in `ir/convolver/mod.rs`.

use crate::request::ChannelLayout;
use crate::types::Vector3;

/// A per-channel pan gain vector. Small layouts (mono/stereo/ambisonic) live
/// inline; `Surround` falls back to a heap `Vec` sized to the speaker count.
#[derive(Debug, Clone, PartialEq)]
pub enum PanGains {
    Mono([f32; 1]),
    Stereo([f32; 2]),
    AmbisonicB([f32; 4]),
    Surround(Vec<f32>),
}

impl PanGains {
    pub fn as_slice(&self) -> &[f32] {
        match self {
            PanGains::Mono(g) => g.as_slice(),
            PanGains::Stereo(g) => g.as_slice(),
            PanGains::AmbisonicB(g) => g.as_slice(),
            PanGains::Surround(g) => g.as_slice(),
        }
    }
}

/// Computes the pan gain vector for `direction` (listener-relative, not
/// necessarily unit length) under `layout`. A zero-length direction means
/// "no arrival direction" (e.g. a source exactly at the listener); each
/// layout defines its own sensible default for that case.
pub fn pan(direction: Vector3, layout: &ChannelLayout) -> PanGains {
    match layout {
        ChannelLayout::Mono => PanGains::Mono([1.0]),
        ChannelLayout::Stereo => PanGains::Stereo(pan_stereo(direction)),
        ChannelLayout::AmbisonicB => PanGains::AmbisonicB(pan_ambisonic_b(direction)),
        ChannelLayout::Surround { speakers, triangles } => {
            PanGains::Surround(pan_vbap(direction, speakers, triangles))
        }
    }
}

/// Cosine equal-power stereo pan from the horizontal azimuth. Per §4.B, a
/// zero direction pans to `[1, 1]` (both channels at full gain) rather than
/// the centre-pan `[√2/2, √2/2]` a nonzero front direction would give.
fn pan_stereo(direction: Vector3) -> [f32; 2] {
    let Some(unit) = direction.normalized() else {
        return [1.0, 1.0];
    };
    let (azimuth, _elevation) = unit.azimuth_elevation();
    // Fold to the front hemisphere and map left..right onto [0, 1].
    let clamped = azimuth.clamp(-std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2);
    let p = (clamped + std::f32::consts::FRAC_PI_2) / std::f32::consts::PI;
    let angle = p * std::f32::consts::FRAC_PI_2;
    [angle.cos(), angle.sin()]
}

/// First-order ambisonic-B encoding: `[W, X, Y, Z]` with `W` the constant
/// omnidirectional channel. A zero direction carries no directional energy,
/// so only `W` is nonzero.
fn pan_ambisonic_b(direction: Vector3) -> [f32; 4] {
    const W: f32 = std::f32::consts::SQRT_2 / 2.0;
    let Some(unit) = direction.normalized() else {
        return [W, 0.0, 0.0, 0.0];
    };
    let (azimuth, elevation) = unit.azimuth_elevation();
    let cos_el = elevation.cos();
    let x = (azimuth.cos() * cos_el).abs();
    let y = (azimuth.sin() * cos_el).abs();
    let z = elevation.sin().abs();
    [W, x, y, z]
}

/// Vector Base Amplitude Panning over a speaker triangulation. Searches the
/// given triangles for one whose inverted speaker-direction matrix yields an
/// all-non-negative gain triple; if the direction falls outside every
/// triangle's coverage (a gap in the layout), falls back to the triangle
/// with the least-negative minimum gain and clips it.
fn pan_vbap(direction: Vector3, speakers: &[crate::request::SpeakerPosition], triangles: &[[u16; 3]]) -> Vec<f32> {
    let mut gains = vec![0.0f32; speakers.len()];
    if speakers.is_empty() {
        return gains;
    }

    let Some(unit) = direction.normalized() else {
        let g = 1.0 / (speakers.len() as f32).sqrt();
        gains.fill(g);
        return gains;
    };

    if triangles.is_empty() {
        // No triangulation supplied: distribute by raw directional dot
        // product, clipped to non-negative, normalised for unit power.
        for (g, speaker) in gains.iter_mut().zip(speakers) {
            *g = unit.dot(speaker.direction.into()).max(0.0);
        }
        normalize_power(&mut gains);
        return gains;
    }

    let mut best_triangle: Option<([u16; 3], [f32; 3])> = None;
    let mut best_min_gain = f32::NEG_INFINITY;

    for &triangle in triangles {
        let Some(raw) = solve_triangle(unit, speakers, triangle) else {
            continue;
        };
        let min_gain = raw[0].min(raw[1]).min(raw[2]);
        if min_gain >= 0.0 {
            apply_triangle_gains(&mut gains, triangle, raw);
            return gains;
        }
        if min_gain > best_min_gain {
            best_min_gain = min_gain;
            best_triangle = Some((triangle, raw));
        }
    }

    if let Some((triangle, raw)) = best_triangle {
        let clipped = [raw[0].max(0.0), raw[1].max(0.0), raw[2].max(0.0)];
        apply_triangle_gains(&mut gains, triangle, clipped);
        normalize_power(&mut gains);
    }
    gains
}

fn apply_triangle_gains(gains: &mut [f32], triangle: [u16; 3], raw: [f32; 3]) {
    let norm = (raw[0] * raw[0] + raw[1] * raw[1] + raw[2] * raw[2]).sqrt();
    if norm < 1e-12 {
        return;
    }
    for (i, &speaker_idx) in triangle.iter().enumerate() {
        if let Some(slot) = gains.get_mut(speaker_idx as usize) {
            *slot = raw[i] / norm;
        }
    }
}

fn normalize_power(gains: &mut [f32]) {
    let power: f32 = gains.iter().map(|g| g * g).sum();
    if power > 1e-12 {
        let scale = 1.0 / power.sqrt();
        for g in gains.iter_mut() {
            *g *= scale;
        }
    }
}

/// Solves `L * g = d` for the three raw (unnormalised) gains of a speaker
/// triangle, where `L`'s columns are the triangle's speaker directions.
/// Returns `None` if the triangle is degenerate (zero volume).
fn solve_triangle(
    direction: Vector3,
    speakers: &[crate::request::SpeakerPosition],
    triangle: [u16; 3],
) -> Option<[f32; 3]> {
    let l0: Vector3 = speakers.get(triangle[0] as usize)?.direction.into();
    let l1: Vector3 = speakers.get(triangle[1] as usize)?.direction.into();
    let l2: Vector3 = speakers.get(triangle[2] as usize)?.direction.into();

    let m = [[l0.x, l1.x, l2.x], [l0.y, l1.y, l2.y], [l0.z, l1.z, l2.z]];
    let det = determinant3(m);
    if det.abs() < 1e-9 {
        return None;
    }
    let inv = invert3(m, det);
    let d = [direction.x, direction.y, direction.z];
    Some([
        inv[0][0] * d[0] + inv[0][1] * d[1] + inv[0][2] * d[2],
        inv[1][0] * d[0] + inv[1][1] * d[1] + inv[1][2] * d[2],
        inv[2][0] * d[0] + inv[2][1] * d[1] + inv[2][2] * d[2],
    ])
}

fn determinant3(m: [[f32; 3]; 3]) -> f32 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn invert3(m: [[f32; 3]; 3], det: f32) -> [[f32; 3]; 3] {
    let inv_det = 1.0 / det;
    [
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SpeakerPosition;

    #[test]
    fn stereo_zero_direction_is_unity_both_channels() {
        let gains = pan_stereo(Vector3::ZERO);
        assert_eq!(gains, [1.0, 1.0]);
    }

    #[test]
    fn stereo_front_direction_is_centred() {
        let gains = pan_stereo(Vector3::new(0.0, 0.0, 1.0));
        assert!((gains[0] - gains[1]).abs() < 1e-5);
        let power = gains[0] * gains[0] + gains[1] * gains[1];
        assert!((power - 1.0).abs() < 1e-4);
    }

    #[test]
    fn stereo_hard_left_mutes_right() {
        let gains = pan_stereo(Vector3::new(-1.0, 0.0, 0.0));
        assert!(gains[1] < 1e-4);
        assert!(gains[0] > 0.9);
    }

    #[test]
    fn ambisonic_zero_direction_is_omni_only() {
        let gains = pan_ambisonic_b(Vector3::ZERO);
        assert!((gains[0] - std::f32::consts::SQRT_2 / 2.0).abs() < 1e-6);
        assert_eq!(&gains[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn vbap_on_speaker_direction_is_unity_gain_there() {
        let speakers = vec![
            SpeakerPosition { direction: Vector3::new(1.0, 0.0, 0.0).into() },
            SpeakerPosition { direction: Vector3::new(-0.5, 0.0, 0.866).into() },
            SpeakerPosition { direction: Vector3::new(-0.5, 0.0, -0.866).into() },
            SpeakerPosition { direction: Vector3::new(0.0, 1.0, 0.0).into() },
        ];
        let triangles = vec![[0u16, 1, 3], [1, 2, 3], [2, 0, 3]];
        let gains = pan_vbap(Vector3::new(1.0, 0.0, 0.0), &speakers, &triangles);
        assert!(gains[0] > 0.99);
        for (i, &g) in gains.iter().enumerate() {
            if i != 0 {
                assert!(g.abs() < 1e-3, "unexpected energy on speaker {i}: {g}");
            }
        }
    }
}
