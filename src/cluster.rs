//! Source clustering and per-cluster mixing (component D, §4.D): groups
//! sources presented together by the propagation stage onto a bounded
//! number of convolution instances, and mixes each cluster's member inputs
//! with sample-accurate gain ramps.

use std::collections::HashMap;

use crate::ir::model::SourceIr;
use crate::types::{ClusterId, SourceId};

/// `1e6` power bias applied on cluster input and divided back out on
/// listener output (§4.D), keeping filter histories away from sub-normals
/// for the quiet sources this system spends most of its time rendering.
pub const POWER_BIAS: f32 = 1e6;

/// A linear gain ramp advanced one sample at a time. Shared shape between
/// source-membership fades, cluster fades, and the listener's own output
/// ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRamp {
    pub current: f32,
    target: f32,
    step: f32,
}

impl GainRamp {
    pub fn new(initial: f32) -> Self {
        Self { current: initial, target: initial, step: 0.0 }
    }

    pub fn retarget(&mut self, target: f32, ramp_seconds: f32, sample_rate: f32) {
        self.target = target;
        let ramp_samples = (ramp_seconds * sample_rate).max(1.0);
        self.step = (target - self.current) / ramp_samples;
    }

    #[inline]
    pub fn advance(&mut self) -> f32 {
        let value = self.current;
        if (self.step > 0.0 && self.current < self.target) || (self.step < 0.0 && self.current > self.target) {
            self.current += self.step;
        } else {
            self.current = self.target;
        }
        value
    }

    pub fn is_settled_at_zero(&self) -> bool {
        self.current.abs() < 1e-6 && self.target.abs() < 1e-6
    }

    pub fn target(&self) -> f32 {
        self.target
    }
}

/// One source's fading membership in a cluster (§3 "Cluster" invariant).
pub struct Membership {
    pub source: SourceId,
    pub gain: GainRamp,
    pub present_this_update: bool,
}

/// Fade/lifecycle phase of a cluster's own output gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    FadingIn,
    Steady,
    FadingOut,
}

/// A group of sources sharing one convolution instance and one path
/// renderer (§3 "Cluster").
pub struct Cluster {
    pub id: ClusterId,
    pub members: Vec<Membership>,
    pub gain: GainRamp,
    pub phase: ClusterPhase,
    /// Consecutive propagation updates in which this cluster was not
    /// attached to any `SourceIr` (§4.D "missing from IR updates for one
    /// frame, begins fading out").
    missing_updates: u32,
}

impl Cluster {
    fn new(id: ClusterId, cluster_fade_in: f32, sample_rate: f32) -> Self {
        let mut gain = GainRamp::new(0.0);
        gain.retarget(1.0, cluster_fade_in, sample_rate);
        Self { id, members: Vec::new(), gain, phase: ClusterPhase::FadingIn, missing_updates: 0 }
    }

    pub fn member_source_ids(&self) -> impl Iterator<Item = SourceId> + '_ {
        self.members.iter().map(|m| m.source)
    }

    pub fn is_released(&self) -> bool {
        self.phase == ClusterPhase::FadingOut && self.gain.is_settled_at_zero()
    }
}

/// Owns every live [`Cluster`] for one listener and the source -> cluster
/// back-references used to discover which cluster a `SourceIr` attaches to
/// (§9 "Replacing cyclic references": the back-reference here is a plain
/// key into `clusters`, not a strong pointer, so there is no reference
/// cycle to break).
pub struct Clusterer {
    clusters: HashMap<ClusterId, Cluster>,
    source_to_cluster: HashMap<SourceId, ClusterId>,
    next_id: u64,
    source_fade_time: f32,
    cluster_fade_in_time: f32,
    cluster_fade_out_time: f32,
}

impl Clusterer {
    pub fn new(source_fade_time: f32, cluster_fade_in_time: f32, cluster_fade_out_time: f32) -> Self {
        Self {
            clusters: HashMap::new(),
            source_to_cluster: HashMap::new(),
            next_id: 0,
            source_fade_time,
            cluster_fade_in_time,
            cluster_fade_out_time,
        }
    }

    /// Attaches every `SourceIr` in a propagation update to a cluster,
    /// creating one if none of its contributing sources are already
    /// assigned (§4.D "Cluster discovery"). Returns the cluster id each
    /// `SourceIr` was attached to, in input order.
    pub fn attach_update(&mut self, source_irs: &[SourceIr], sample_rate: f32) -> Vec<ClusterId> {
        for cluster in self.clusters.values_mut() {
            for member in &mut cluster.members {
                member.present_this_update = false;
            }
        }

        let mut attached = Vec::with_capacity(source_irs.len());
        for source_ir in source_irs {
            let existing = source_ir.contributing_sources.iter().find_map(|s| self.source_to_cluster.get(s).copied());

            let cluster_id = existing.unwrap_or_else(|| {
                let id = ClusterId(self.next_id);
                self.next_id += 1;
                self.clusters.insert(id, Cluster::new(id, self.cluster_fade_in_time, sample_rate));
                id
            });

            let cluster = self.clusters.get_mut(&cluster_id).expect("cluster just inserted or looked up");
            if cluster.phase == ClusterPhase::FadingOut {
                cluster.phase = ClusterPhase::Steady;
                cluster.gain.retarget(1.0, self.cluster_fade_in_time, sample_rate);
            }
            cluster.missing_updates = 0;

            for &source in &source_ir.contributing_sources {
                self.source_to_cluster.insert(source, cluster_id);
                match cluster.members.iter_mut().find(|m| m.source == source) {
                    Some(member) => {
                        member.present_this_update = true;
                        if member.gain.target() < 1.0 {
                            member.gain.retarget(1.0, self.source_fade_time, sample_rate);
                        }
                    }
                    None => {
                        let mut gain = GainRamp::new(0.0);
                        gain.retarget(1.0, self.source_fade_time, sample_rate);
                        cluster.members.push(Membership { source, gain, present_this_update: true });
                    }
                }
            }

            attached.push(cluster_id);
        }

        attached
    }

    /// Per-update housekeeping: starts fading out memberships and clusters
    /// that went unreferenced this update, drops memberships once their
    /// fade reaches zero, and releases clusters whose fade-out completed
    /// and have no remaining members (§4.D). Returns every `(cluster,
    /// source)` membership dropped this call, so a caller keying other
    /// per-source state (e.g. the IR assembler's temporal-smoothing cache,
    /// §4.B) off membership lifetime can evict it in lockstep (§4.B
    /// "discarded when a source's membership in every cluster reaches zero
    /// gain").
    pub fn retire_unreferenced(&mut self, attached_this_update: &[ClusterId], sample_rate: f32) -> Vec<(ClusterId, SourceId)> {
        let attached: std::collections::HashSet<ClusterId> = attached_this_update.iter().copied().collect();
        let mut dropped = Vec::new();

        for cluster in self.clusters.values_mut() {
            for member in &mut cluster.members {
                if !member.present_this_update && member.gain.target() > 0.0 {
                    member.gain.retarget(0.0, self.source_fade_time, sample_rate);
                }
            }
            let cluster_id = cluster.id;
            cluster.members.retain(|m| {
                let keep = m.gain.target() > 0.0 || !m.gain.is_settled_at_zero();
                if !keep {
                    dropped.push((cluster_id, m.source));
                }
                keep
            });

            if !attached.contains(&cluster.id) && cluster.phase != ClusterPhase::FadingOut {
                cluster.phase = ClusterPhase::FadingOut;
                cluster.gain.retarget(0.0, self.cluster_fade_out_time, sample_rate);
            }
            if cluster.phase == ClusterPhase::FadingOut {
                cluster.missing_updates += 1;
            }
        }

        self.source_to_cluster.retain(|_, &mut cid| self.clusters.get(&cid).is_some_and(|c| !c.is_released()));
        self.clusters.retain(|_, c| !c.is_released());
        dropped
    }

    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn clusters_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.clusters.values_mut()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    pub fn cluster_mut(&mut self, id: ClusterId) -> Option<&mut Cluster> {
        self.clusters.get_mut(&id)
    }
}

/// Mixes a cluster's member inputs into one mono buffer (§4.D "Input mix"):
/// the first membership writes, subsequent ones accumulate, every one
/// scaled by its sample-accurate gain ramp times `POWER_BIAS`.
pub fn mix_cluster_input(cluster: &mut Cluster, source_inputs: &HashMap<SourceId, Vec<f32>>, block_len: usize) -> Vec<f32> {
    let mut mixed = vec![0.0f32; block_len];
    let mut wrote_any = false;

    for member in &mut cluster.members {
        let Some(input) = source_inputs.get(&member.source) else {
            // No input this block: still advance the ramp so fades stay in
            // lock-step with blocks where the source did contribute.
            for _ in 0..block_len {
                member.gain.advance();
            }
            continue;
        };
        for i in 0..block_len {
            let g = member.gain.advance() * POWER_BIAS;
            let sample = input.get(i).copied().unwrap_or(0.0) * g;
            if wrote_any || i > 0 || mixed[0] != 0.0 {
                mixed[i] += sample;
            } else {
                mixed[i] = sample;
            }
        }
        wrote_any = true;
    }

    mixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::model::SourceIr;

    #[test]
    fn new_source_creates_new_cluster() {
        let mut clusterer = Clusterer::new(0.1, 0.05, 0.25);
        let ir = SourceIr::new(SourceId(1));
        let attached = clusterer.attach_update(&[ir], 48_000.0);
        assert_eq!(attached.len(), 1);
        assert_eq!(clusterer.clusters().count(), 1);
    }

    #[test]
    fn shared_contributing_source_attaches_to_existing_cluster() {
        let mut clusterer = Clusterer::new(0.1, 0.05, 0.25);
        let a = SourceIr::new(SourceId(1));
        clusterer.attach_update(&[a], 48_000.0);
        clusterer.retire_unreferenced(&[ClusterId(0)], 48_000.0);

        let mut b = SourceIr::new(SourceId(2));
        b.contributing_sources.push(SourceId(1));
        let attached = clusterer.attach_update(&[b], 48_000.0);
        assert_eq!(attached[0], ClusterId(0));
        assert_eq!(clusterer.clusters().count(), 1);
        assert_eq!(clusterer.cluster(ClusterId(0)).unwrap().members.len(), 2);
    }

    #[test]
    fn cluster_without_updates_eventually_releases() {
        let mut clusterer = Clusterer::new(0.01, 0.01, 0.01);
        let ir = SourceIr::new(SourceId(1));
        clusterer.attach_update(&[ir], 48_000.0);
        clusterer.retire_unreferenced(&[], 48_000.0);
        assert_eq!(clusterer.clusters().count(), 1);

        for _ in 0..100 {
            clusterer.retire_unreferenced(&[], 48_000.0);
            if let Some(cluster) = clusterer.clusters_mut().next() {
                for _ in 0..2_000 {
                    cluster.gain.advance();
                }
            }
        }
        assert_eq!(clusterer.clusters().count(), 0);
    }
}
