//! Per-listener orchestrator (component E, §4.E): owns the clusterer,
//! every cluster's convolution/path-rendering/reverb state, and the
//! pull-style `read(N)` stream an audio callback drives.
//!
//! Generalises the teacher's `Engine`/`EngineHandle` crossbeam-channel
//! pattern (`audio/engine.rs`): its `handle_messages()` non-blocking drain at
//! the top of `process()` becomes [`Listener::drain_updates`], called at the
//! top of every [`Listener::read`]. Where the teacher has one channel and one
//! processing thread, this orchestrator splits the work across the two
//! pools the propagation/render model calls for: a dedicated update thread
//! assembles IR partitions and refreshes path lists off the audio thread,
//! while the render-side fan-out already lives inside
//! [`crate::ir::convolver::UpolaEngine::tick`]. A cluster's source-list and
//! gain state is shared through one `Mutex<Clusterer>`, held only for the
//! O(#clusters) work of mixing or retargeting, exactly as the shared-resource
//! rule describes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, warn};

use crate::cluster::{Clusterer, POWER_BIAS, mix_cluster_input};
use crate::crossover::Crossover;
use crate::error::{CoreError, CoreResult};
use crate::hrtf::{HrtfDatabase, HrtfProjection};
use crate::ir::assembler::IrAssembler;
use crate::ir::convolver::{IrPartitions, PartitionPlan, UpolaEngine};
use crate::ir::model::{ListenerIr, SoundPath, SourceIr};
use crate::ir::path_renderer::PathRenderer;
use crate::request::{ChannelLayout, RenderFlags, RenderRequest, RenderStatistics};
use crate::reverb::ClusterReverb;
use crate::types::{ClusterId, FrequencyBandConfig, SourceId};

/// Per-source mono input at the system sample rate, one render block's worth
/// per source (§6 `SourceSoundBuffer`, already resampled and down-mixed by
/// the caller via [`crate::audio::SourceResampler`] — a missing key means
/// silence for that source this block).
pub type SourceInputs = HashMap<SourceId, Vec<f32>>;

/// Smoothing cutoff used by every cluster's [`IrAssembler`] (§4.B step 4).
/// Fixed rather than request-configurable: it shapes how quickly the
/// reconstructed energy envelope can move, not a scene-author-facing knob.
const IR_SMOOTHING_CUTOFF_HZ: f32 = 200.0;

/// Fixed dry/wet mix applied to each cluster's synthetic reverb tail before
/// it sums into the cluster output (§4.E step 4).
const REVERB_WET_MIX: f32 = 0.25;

/// How many pending update-thread results may queue before a new one is
/// dropped — the channel-based stand-in for the atomic `numInputIRs` /
/// `hasNewPaths` "transient skip" rule (§7): once full, a fresh submission is
/// silently discarded and retried on the next propagation update.
const UPDATE_QUEUE_DEPTH: usize = 8;

/// Messages the update thread consumes, sent by [`ListenerHandle`].
enum UpdateMessage {
    ListenerIr(ListenerIr),
    HrtfDatabase(HrtfDatabase),
}

/// One cluster's worth of freshly assembled state, handed from the update
/// thread to the audio thread.
struct ClusterUpdate {
    cluster: ClusterId,
    main_partitions: Vec<IrPartitions>,
    hrtf_partitions: Option<Vec<IrPartitions>>,
    new_paths: Vec<(SourceId, Vec<SoundPath>)>,
}

/// Results flowing from the update thread back to the audio thread.
enum RenderUpdate {
    Clusters(Vec<ClusterUpdate>),
    HrtfProjection(Arc<HrtfProjection>),
    /// Freshly arrived listener sensitivity, in dB (§4.D "Output mix").
    /// Sensitivity only ever changes with a propagation update, which lands
    /// on the update thread; this carries it to the audio thread's
    /// `output_gain` ramp the same way a fitted HRTF projection crosses over.
    Sensitivity(f32),
}

/// Non-realtime handle to a [`Listener`]: the only way to submit propagation
/// updates and HRTF databases once the listener is constructed. Mirrors the
/// teacher's `EngineHandle`.
pub struct ListenerHandle {
    sender: Sender<UpdateMessage>,
    worker: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Submits a propagation update (§4.B step 2's trigger). Dropped
    /// silently if the update thread is still draining a previous one — the
    /// "transient skip" error kind (§7).
    pub fn submit_listener_ir(&self, ir: ListenerIr) {
        self.send(UpdateMessage::ListenerIr(ir));
    }

    /// Submits (or replaces) the HRTF database used for direct-sound
    /// binaural filtering. Projection fitting runs entirely on the update
    /// thread; the fitted projection is handed back and applied by the audio
    /// thread at the next block boundary.
    pub fn submit_hrtf_database(&self, db: HrtfDatabase) {
        self.send(UpdateMessage::HrtfDatabase(db));
    }

    fn send(&self, message: UpdateMessage) {
        if self.sender.try_send(message).is_err() {
            debug!("listener update channel full, dropping submission (transient skip)");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Per-cluster render-side state the audio thread owns outright: the path
/// renderer, the cluster's main and (optional) HRTF convolution instances,
/// and its synthetic reverb tail.
struct ClusterRuntime {
    path_renderer: PathRenderer,
    main_engine: UpolaEngine,
    hrtf_engine: Option<UpolaEngine>,
    reverb: ClusterReverb,
}

/// The per-listener orchestrator (§4.E): owns every cluster's render-side
/// state and the thread-shared [`Clusterer`], and exposes the pull stream a
/// real-time audio callback drives.
pub struct Listener {
    request: RenderRequest,
    band_config: FrequencyBandConfig,
    plan: PartitionPlan,
    crossover: Crossover,

    clusterer: Arc<Mutex<Clusterer>>,
    cluster_runtimes: HashMap<ClusterId, ClusterRuntime>,
    hrtf_projection: Option<Arc<HrtfProjection>>,

    update_results: Receiver<RenderUpdate>,

    output_gain: crate::cluster::GainRamp,
    /// Last sensitivity value carried by a `RenderUpdate::Sensitivity`,
    /// folded into `output_gain`'s target whenever it or `request.volume`
    /// changes (§4.D "Output mix").
    sensitivity: f32,
    output_carry: Vec<Vec<f32>>,
    carry_len: usize,

    last_tick_duration: std::time::Duration,
}

impl Listener {
    /// Builds a listener and its handle. `band_config` and
    /// `request.sample_rate` / `request.channel_layout` are fixed for this
    /// listener's lifetime (§7 "mismatched format" is a rebuild event, not a
    /// live reconfiguration) — changing either requires constructing a new
    /// `Listener`.
    pub fn new(request: RenderRequest, band_config: FrequencyBandConfig) -> (Self, ListenerHandle) {
        let request = request.sanitized();
        let plan = PartitionPlan::new(request.max_latency, request.sample_rate as f32, request.max_ir_length, 16_384, 4);
        let crossover = Crossover::new(&band_config, request.sample_rate as f32);

        let clusterer = Arc::new(Mutex::new(Clusterer::new(
            request.source_fade_time,
            request.cluster_fade_in_time,
            request.cluster_fade_out_time,
        )));

        let (update_sender, update_receiver) = bounded::<UpdateMessage>(UPDATE_QUEUE_DEPTH);
        let (result_sender, result_receiver) = unbounded::<RenderUpdate>();

        let worker = UpdateWorker {
            receiver: update_receiver,
            results: result_sender,
            clusterer: Arc::clone(&clusterer),
            assemblers: HashMap::new(),
            request: request.clone(),
            plan: plan.clone(),
            crossover: crossover.clone(),
            hrtf_projection: None,
        };
        let worker_handle = std::thread::spawn(move || worker.run());

        let mut output_gain = crate::cluster::GainRamp::new(0.0);
        output_gain.retarget(Self::target_output_gain(&request, 0.0), request.path_fade_time, request.sample_rate as f32);

        let channels = request.channel_layout.channel_count();
        let listener = Self {
            request,
            band_config,
            plan,
            crossover,
            clusterer,
            cluster_runtimes: HashMap::new(),
            hrtf_projection: None,
            update_results: result_receiver,
            output_gain,
            sensitivity: 0.0,
            output_carry: vec![Vec::new(); channels],
            carry_len: 0,
            last_tick_duration: std::time::Duration::ZERO,
        };
        (listener, ListenerHandle { sender: update_sender, worker: Some(worker_handle) })
    }

    /// Listener output gain = `volume * 10^(sensitivity/10) * 4*pi / POWER_BIAS`
    /// (§4.D "Output mix"); `sensitivity` is in dB, per-listener (§3
    /// `ListenerIR`), converted here to a linear factor.
    fn target_output_gain(request: &RenderRequest, sensitivity: f32) -> f32 {
        request.volume * 10f32.powf(sensitivity / 10.0) * 4.0 * std::f32::consts::PI / POWER_BIAS
    }

    /// Applies a new [`RenderRequest`] at the next block boundary. Rejects
    /// (without mutating anything) changes to the sample rate or channel
    /// count, which require rebuilding this listener (§7 "mismatched
    /// format").
    pub fn set_render_request(&mut self, request: RenderRequest) -> CoreResult<()> {
        let request = request.sanitized();
        if request.sample_rate != self.request.sample_rate {
            return Err(CoreError::SampleRateChanged { previous: self.request.sample_rate, requested: request.sample_rate });
        }
        if request.channel_layout.channel_count() != self.request.channel_layout.channel_count() {
            return Err(CoreError::ChannelCountChanged {
                previous: self.request.channel_layout.channel_count(),
                requested: request.channel_layout.channel_count(),
            });
        }

        self.output_gain.retarget(Self::target_output_gain(&request, self.sensitivity), request.path_fade_time, request.sample_rate as f32);
        self.request = request;
        Ok(())
    }

    /// Drains any results the update thread has queued (§4.E "handoff"):
    /// newly assembled IR partitions are submitted into the relevant
    /// cluster's convolution instances, fresh path lists are consumed by its
    /// path renderer, and a freshly fitted HRTF projection is adopted.
    /// Mirrors the teacher's `Engine::handle_messages`, called at the top of
    /// every `read`.
    fn drain_updates(&mut self) {
        loop {
            match self.update_results.try_recv() {
                Ok(RenderUpdate::Clusters(updates)) => {
                    for update in updates {
                        self.apply_cluster_update(update);
                    }
                }
                Ok(RenderUpdate::HrtfProjection(projection)) => {
                    self.hrtf_projection = Some(projection);
                }
                Ok(RenderUpdate::Sensitivity(sensitivity)) => {
                    self.sensitivity = sensitivity;
                    self.output_gain.retarget(
                        Self::target_output_gain(&self.request, sensitivity),
                        self.request.path_fade_time,
                        self.request.sample_rate as f32,
                    );
                }
                Err(crossbeam::channel::TryRecvError::Empty) => break,
                Err(crossbeam::channel::TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply_cluster_update(&mut self, update: ClusterUpdate) {
        let channels = self.request.channel_layout.channel_count();
        let sample_rate = self.request.sample_rate as f32;
        let request = &self.request;
        let plan = &self.plan;

        let runtime = self.cluster_runtimes.entry(update.cluster).or_insert_with(|| ClusterRuntime {
            path_renderer: PathRenderer::new(
                channels,
                (request.max_path_delay * sample_rate) as usize,
                request.max_delay_rate,
                request.path_fade_time,
                plan.convolution_latency_samples(),
            ),
            main_engine: UpolaEngine::new(plan.clone(), channels, sample_rate, request.ir_fade_time),
            hrtf_engine: request
                .hrtf_enabled
                .then(|| UpolaEngine::new(PartitionPlan { l0: plan.l0, fdl_sizes: vec![plan.l0], partitions_per_fdl: 1, offsets: vec![0] }, channels, sample_rate, request.hrtf_fade_time)),
            reverb: ClusterReverb::new(sample_rate, request.reverb_time),
        });

        runtime.main_engine.submit_partitions(update.main_partitions);
        if let (Some(hrtf_engine), Some(partitions)) = (&mut runtime.hrtf_engine, update.hrtf_partitions) {
            hrtf_engine.submit_partitions(partitions);
        }

        runtime.path_renderer.begin_update();
        for (source, paths) in update.new_paths {
            runtime.path_renderer.consume_new_paths(source, &paths, &request.channel_layout, sample_rate);
        }
    }

    /// Produces the next `N` samples into `output`, one planar channel per
    /// entry, `N = output[0].len()`. Returns the number of samples actually
    /// written, which is `< N` only on shutdown (§6) — this implementation
    /// never shuts down mid-call, so it always returns `N`.
    pub fn read(&mut self, sources: &SourceInputs, output: &mut [Vec<f32>]) -> usize {
        let n = output.first().map(Vec::len).unwrap_or(0);
        for channel in output.iter_mut() {
            channel.truncate(n);
            channel.resize(n, 0.0);
        }

        let start = Instant::now();
        self.drain_updates();

        let mut written = 0usize;
        while written < n {
            if self.carry_len > 0 {
                let take = self.carry_len.min(n - written);
                for (ch, out) in self.output_carry.iter_mut().zip(output.iter_mut()) {
                    out[written..written + take].copy_from_slice(&ch[..take]);
                    ch.drain(..take);
                }
                self.carry_len -= take;
                written += take;
                continue;
            }

            let l0 = self.plan.l0;
            let mut tick_output = vec![vec![0.0f32; l0]; output.len()];
            self.render_tick(sources, &mut tick_output);

            let take = l0.min(n - written);
            for (ch_out, tick_ch) in output.iter_mut().zip(tick_output.iter()) {
                ch_out[written..written + take].copy_from_slice(&tick_ch[..take]);
            }
            written += take;

            if take < l0 {
                for (carry, tick_ch) in self.output_carry.iter_mut().zip(tick_output.iter()) {
                    carry.clear();
                    carry.extend_from_slice(&tick_ch[take..]);
                }
                self.carry_len = l0 - take;
            }
        }

        self.last_tick_duration = start.elapsed();
        written
    }

    /// One internal `L0`-sample tick of §4.E's render loop, steps 2-5.
    fn render_tick(&mut self, sources: &SourceInputs, output: &mut [Vec<f32>]) {
        let l0 = self.plan.l0;
        let sample_rate = self.request.sample_rate as f32;
        let channels = self.request.channel_layout.channel_count();
        let flags = self.request.flags;

        let cluster_ids: Vec<ClusterId> = {
            let clusterer = self.clusterer.lock().expect("clusterer mutex poisoned");
            clusterer.clusters().map(|c| c.id).collect()
        };

        for cluster_id in cluster_ids {
            let Some(runtime) = self.cluster_runtimes.get_mut(&cluster_id) else {
                continue;
            };

            let Some(mixed_input) = ({
                let mut clusterer = self.clusterer.lock().expect("clusterer mutex poisoned");
                clusterer.cluster_mut(cluster_id).map(|cluster| mix_cluster_input(cluster, sources, l0))
            }) else {
                continue;
            };

            let mut cluster_output = vec![vec![0.0f32; l0]; channels];
            let mut hrtf_bus = vec![vec![0.0f32; l0]; channels];

            if flags.contains(RenderFlags::DISCRETE_PATHS) {
                runtime.path_renderer.render_block(&self.crossover, &mixed_input, &mut cluster_output, &mut hrtf_bus, sample_rate);
            }

            if flags.contains(RenderFlags::CONVOLUTION) {
                runtime.main_engine.tick(&mixed_input, &mut cluster_output);
            }

            if flags.contains(RenderFlags::HRTF)
                && let Some(hrtf_engine) = &mut runtime.hrtf_engine
            {
                let hrtf_mono: Vec<f32> = (0..l0).map(|i| hrtf_bus.iter().map(|ch| ch[i]).sum::<f32>() / channels.max(1) as f32).collect();
                hrtf_engine.tick(&hrtf_mono, &mut cluster_output);
            }

            if flags.contains(RenderFlags::REVERB) {
                for channel in &mut cluster_output {
                    runtime.reverb.process_block(channel, REVERB_WET_MIX);
                }
            }

            {
                let mut clusterer = self.clusterer.lock().expect("clusterer mutex poisoned");
                if let Some(cluster) = clusterer.cluster_mut(cluster_id) {
                    for channel in &mut cluster_output {
                        for sample in channel.iter_mut() {
                            *sample *= cluster.gain.advance();
                        }
                    }
                }
            }

            for (out, band) in output.iter_mut().zip(cluster_output.iter()) {
                for (o, &b) in out.iter_mut().zip(band.iter()) {
                    *o += b;
                }
            }
        }

        for channel in output.iter_mut() {
            for sample in channel.iter_mut() {
                *sample *= self.output_gain.advance();
            }
        }

        for runtime in self.cluster_runtimes.values_mut() {
            runtime.main_engine.flush_denormals();
            if let Some(hrtf) = &mut runtime.hrtf_engine {
                hrtf.flush_denormals();
            }
            runtime.reverb.flush_denormals();
        }

        // Cluster lifecycle (creation, fade-out, release) is decided solely
        // by the update thread's `attach_update`/`retire_unreferenced` pass
        // (§4.D); this just drops render-side state for clusters it already
        // released.
        let live: std::collections::HashSet<ClusterId> = {
            let clusterer = self.clusterer.lock().expect("clusterer mutex poisoned");
            clusterer.clusters().map(|c| c.id).collect()
        };
        self.cluster_runtimes.retain(|id, _| live.contains(id));
    }

    /// Populates `stats` in place when `RenderFlags::STATISTICS` is set
    /// (§6). A no-op otherwise, so callers can always pass a scratch value.
    pub fn read_statistics(&self, stats: &mut RenderStatistics) {
        if !self.request.flags.contains(RenderFlags::STATISTICS) {
            return;
        }
        let ideal = self.plan.l0 as f32 / self.request.sample_rate as f32;
        stats.rendering_load = if ideal > 0.0 { self.last_tick_duration.as_secs_f32() / ideal } else { 0.0 };
        stats.rendering_latency = self.plan.convolution_latency_seconds(self.request.sample_rate as f32);
        stats.rendered_path_count = self.cluster_runtimes.values().map(|r| r.path_renderer.active_path_count()).sum();
        stats.rendering_memory_bytes = self.cluster_runtimes.len() * std::mem::size_of::<ClusterRuntime>();
    }
}

/// The update pool (§5 "Propagation/update pool"): a single dedicated
/// low-priority thread draining [`UpdateMessage`]s, running IR assembly
/// (§4.B) and path-list refresh (§4.C step 2), and shipping results to the
/// audio thread. Modelled as one thread rather than a pool of `P` threads —
/// the per-cluster work inside `run` is already independent and would
/// parallelise trivially across a `rayon`/`crossbeam::scope` fan-out if a
/// given deployment's cluster count warranted it.
struct UpdateWorker {
    receiver: Receiver<UpdateMessage>,
    results: Sender<RenderUpdate>,
    clusterer: Arc<Mutex<Clusterer>>,
    assemblers: HashMap<ClusterId, IrAssembler>,
    request: RenderRequest,
    plan: PartitionPlan,
    crossover: Crossover,
    hrtf_projection: Option<Arc<HrtfProjection>>,
}

impl UpdateWorker {
    fn run(mut self) {
        while let Ok(message) = self.receiver.recv() {
            match message {
                UpdateMessage::ListenerIr(ir) => self.handle_listener_ir(&ir),
                UpdateMessage::HrtfDatabase(db) => self.handle_hrtf_database(&db),
            }
        }
    }

    fn handle_hrtf_database(&mut self, db: &HrtfDatabase) {
        let projection = HrtfProjection::fit(db, self.request.sample_rate as f32, self.plan.l0, self.request.max_hrtf_order, 0.02, 0.001);
        let projection = Arc::new(projection);
        self.hrtf_projection = Some(Arc::clone(&projection));
        if self.results.send(RenderUpdate::HrtfProjection(projection)).is_err() {
            warn!("listener render side gone, dropping fitted HRTF projection");
        }
    }

    fn handle_listener_ir(&mut self, ir: &ListenerIr) {
        let sample_rate = self.request.sample_rate as f32;
        if self.results.send(RenderUpdate::Sensitivity(ir.sensitivity)).is_err() {
            warn!("listener render side gone, dropping sensitivity update");
        }
        let (attached, dropped_members) = {
            let mut clusterer = self.clusterer.lock().expect("clusterer mutex poisoned");
            let attached = clusterer.attach_update(&ir.sources, sample_rate);
            let dropped_members = clusterer.retire_unreferenced(&attached, sample_rate);
            (attached, dropped_members)
        };

        for (cluster_id, source) in dropped_members {
            if let Some(assembler) = self.assemblers.get_mut(&cluster_id) {
                assembler.forget_source(source);
            }
        }

        let mut grouped: HashMap<ClusterId, Vec<&SourceIr>> = HashMap::new();
        for (cluster_id, source_ir) in attached.iter().zip(&ir.sources) {
            grouped.entry(*cluster_id).or_default().push(source_ir);
        }

        self.assemblers.retain(|id, _| grouped.contains_key(id));

        let temporal_smoothing = self.request.ir_temporal_smoothing;
        let mut updates = Vec::with_capacity(grouped.len());
        for (cluster_id, members) in grouped {
            let crossover = self.crossover.clone();
            let assembler = self
                .assemblers
                .entry(cluster_id)
                .or_insert_with(|| IrAssembler::with_temporal_smoothing(crossover, IR_SMOOTHING_CUTOFF_HZ, temporal_smoothing));

            let mut main_partitions: Option<Vec<IrPartitions>> = None;
            let mut new_paths = Vec::new();
            let mut direct_direction = None;

            for &source_ir in &members {
                let (for_renderer, overflow) = partition_paths(&source_ir.paths, self.request.max_source_path_count);

                for path in &for_renderer {
                    if path.is_direct() && direct_direction.is_none() {
                        direct_direction = Some(ir.to_listener_local(path.direction));
                    }
                }

                let partitions = assembler.assemble(source_ir, &overflow, ir, &self.request.channel_layout, &self.plan, sample_rate);
                main_partitions = Some(match main_partitions.take() {
                    Some(acc) => sum_partitions(acc, partitions),
                    None => partitions,
                });

                new_paths.push((source_ir.source, for_renderer));
            }

            let hrtf_partitions = if self.request.hrtf_enabled {
                self.hrtf_projection.as_ref().zip(direct_direction).map(|(projection, direction)| {
                    let filter = projection.evaluate(direction);
                    let channels = filter.len();
                    let mut partitions: IrPartitions = vec![vec![None]; channels];
                    for (c, spectrum) in filter.into_iter().enumerate() {
                        partitions[c][0] = Some(spectrum);
                    }
                    vec![partitions]
                })
            } else {
                None
            };

            updates.push(ClusterUpdate {
                cluster: cluster_id,
                main_partitions: main_partitions.unwrap_or_default(),
                hrtf_partitions,
                new_paths,
            });
        }

        if !updates.is_empty() && self.results.send(RenderUpdate::Clusters(updates)).is_err() {
            warn!("listener render side gone, dropping cluster update batch");
        }
    }
}

/// Splits a source's paths into the set handed to the discrete-path renderer
/// (every direct/HRTF path plus the highest-intensity early reflections up
/// to `max_count`) and the overflow folded into the sampled IR's extra-paths
/// branch (§4.B step 3, §7 resource exhaustion: "lowest-intensity paths
/// demoted").
fn partition_paths(paths: &[SoundPath], max_count: usize) -> (Vec<SoundPath>, Vec<SoundPath>) {
    let mut anchored = Vec::new();
    let mut reflections = Vec::new();
    for &path in paths {
        if path.is_direct() || path.is_hrtf() {
            anchored.push(path);
        } else {
            reflections.push(path);
        }
    }
    reflections.sort_by(|a, b| b.energy.max_abs().partial_cmp(&a.energy.max_abs()).unwrap_or(std::cmp::Ordering::Equal));

    let budget = max_count.saturating_sub(anchored.len());
    let overflow = if reflections.len() > budget { reflections.split_off(budget) } else { Vec::new() };

    anchored.extend(reflections);
    (anchored, overflow)
}

/// Element-wise complex sum of two clusters' worth of per-FDL partitions
/// (§4.D): a cluster's single convolution instance approximates the combined
/// contribution of every member source by summing their independently
/// assembled partition sets rather than convolving each one separately —
/// the efficiency trade this component exists for.
fn sum_partitions(a: Vec<IrPartitions>, b: Vec<IrPartitions>) -> Vec<IrPartitions> {
    a.into_iter()
        .zip(b)
        .map(|(fdl_a, fdl_b)| {
            fdl_a
                .into_iter()
                .zip(fdl_b)
                .map(|(chan_a, chan_b)| {
                    chan_a
                        .into_iter()
                        .zip(chan_b)
                        .map(|(pa, pb)| match (pa, pb) {
                            (Some(mut x), Some(y)) => {
                                for (xv, yv) in x.iter_mut().zip(y.iter()) {
                                    *xv += *yv;
                                }
                                Some(x)
                            }
                            (Some(x), None) | (None, Some(x)) => Some(x),
                            (None, None) => None,
                        })
                        .collect()
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::model::PathFlags;
    use crate::types::BandVector;

    #[test]
    fn partition_paths_keeps_direct_path_regardless_of_budget() {
        let direct = SoundPath { energy: BandVector::splat(0.001), direction: crate::types::Vector3::ZERO, delay_seconds: 0.0, relative_speed: 0.0, flags: PathFlags::IS_DIRECT };
        let loud_reflection = SoundPath { energy: BandVector::splat(10.0), direction: crate::types::Vector3::ZERO, delay_seconds: 0.01, relative_speed: 0.0, flags: PathFlags::empty() };
        let (kept, overflow) = partition_paths(&[direct, loud_reflection], 1);
        assert!(kept.iter().any(|p| p.is_direct()));
        assert_eq!(overflow.len(), 1);
    }

    #[test]
    fn sum_partitions_adds_overlapping_slots_and_keeps_solo_ones() {
        use rustfft::num_complex::Complex;
        let a: Vec<IrPartitions> = vec![vec![vec![Some(vec![Complex::new(1.0, 0.0)]), None]]];
        let b: Vec<IrPartitions> = vec![vec![vec![Some(vec![Complex::new(2.0, 0.0)]), Some(vec![Complex::new(5.0, 0.0)])]]];
        let summed = sum_partitions(a, b);
        assert_eq!(summed[0][0][0].as_ref().unwrap()[0].re, 3.0);
        assert_eq!(summed[0][0][1].as_ref().unwrap()[0].re, 5.0);
    }

    #[test]
    fn new_listener_produces_silence_with_no_sources() {
        let request = RenderRequest { channel_layout: ChannelLayout::Mono, ..RenderRequest::default() };
        let (mut listener, _handle) = Listener::new(request, FrequencyBandConfig::default());
        let mut output = vec![vec![0.0f32; 256]];
        let sources = SourceInputs::new();
        let written = listener.read(&sources, &mut output);
        assert_eq!(written, 256);
        assert!(output[0].iter().all(|&v| v == 0.0));
    }
}
