use auralis_core::error::CoreError;
use auralis_core::ir::model::{ListenerIr, PathFlags, SampledIr, SoundPath, SourceIr};
use auralis_core::listener::{Listener, SourceInputs};
use auralis_core::request::{ChannelLayout, RenderRequest};
use auralis_core::types::{BandVector, FrequencyBandConfig, SourceId, Vector3};

const SAMPLE_RATE: u32 = 48_000;
const BLOCK_SIZE: usize = 256;

fn settle(listener: &mut Listener, sources: &SourceInputs, channels: usize, blocks: usize) {
    let mut scratch = vec![vec![0.0f32; BLOCK_SIZE]; channels];
    for _ in 0..blocks {
        listener.read(sources, &mut scratch);
    }
}

#[test]
fn listener_with_no_sources_stays_silent() {
    let request = RenderRequest { channel_layout: ChannelLayout::Stereo, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, _handle) = Listener::new(request, FrequencyBandConfig::default());

    let sources = SourceInputs::new();
    let mut output = vec![vec![0.0f32; BLOCK_SIZE]; 2];
    for _ in 0..4 {
        let written = listener.read(&sources, &mut output);
        assert_eq!(written, BLOCK_SIZE);
        assert!(output.iter().all(|ch| ch.iter().all(|&s| s == 0.0)));
    }
}

#[test]
fn direct_path_impulse_produces_nonzero_output_after_settling() {
    let request = RenderRequest { channel_layout: ChannelLayout::Mono, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, handle) = Listener::new(request, FrequencyBandConfig::default());

    let direct = SoundPath {
        energy: BandVector::splat(1.0),
        direction: Vector3::new(0.0, 0.0, 1.0),
        delay_seconds: 1.0 / 343.0,
        relative_speed: 0.0,
        flags: PathFlags::IS_DIRECT,
    };
    let source = SourceIr { sampled: SampledIr::default(), paths: vec![direct], ..SourceIr::new(SourceId(1)) };
    let listener_ir = ListenerIr { sources: vec![source], listener_forward: Vector3::new(0.0, 0.0, 1.0), listener_up: Vector3::new(0.0, 1.0, 0.0), ..Default::default() };
    handle.submit_listener_ir(listener_ir);
    std::thread::sleep(std::time::Duration::from_millis(30));

    let mut sources = SourceInputs::new();
    let mut impulse = vec![0.0f32; BLOCK_SIZE];
    impulse[0] = 1.0;
    sources.insert(SourceId(1), impulse);

    let mut saw_nonzero = false;
    let mut output = vec![vec![0.0f32; BLOCK_SIZE]; 1];
    for block in 0..200 {
        if block == 1 {
            sources.insert(SourceId(1), vec![0.0f32; BLOCK_SIZE]);
        }
        listener.read(&sources, &mut output);
        if output[0].iter().any(|&s| s.abs() > 1e-6) {
            saw_nonzero = true;
            break;
        }
    }
    assert!(saw_nonzero, "expected the direct path's impulse to eventually reach the output");
}

#[test]
fn cluster_mixes_several_nearby_sources() {
    let request = RenderRequest { channel_layout: ChannelLayout::Stereo, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, handle) = Listener::new(request, FrequencyBandConfig::default());

    let mut sources = Vec::new();
    for i in 0..3u64 {
        let direct = SoundPath {
            energy: BandVector::splat(0.5),
            direction: Vector3::new(0.1 * i as f32, 0.0, 1.0),
            delay_seconds: 0.0,
            relative_speed: 0.0,
            flags: PathFlags::IS_DIRECT,
        };
        sources.push(SourceIr { sampled: SampledIr::default(), paths: vec![direct], ..SourceIr::new(SourceId(i)) });
    }
    let listener_ir = ListenerIr { sources, listener_forward: Vector3::new(0.0, 0.0, 1.0), listener_up: Vector3::new(0.0, 1.0, 0.0), ..Default::default() };
    handle.submit_listener_ir(listener_ir);
    std::thread::sleep(std::time::Duration::from_millis(30));

    let mut inputs = SourceInputs::new();
    for i in 0..3u64 {
        inputs.insert(SourceId(i), vec![0.3f32; BLOCK_SIZE]);
    }

    let mut output = vec![vec![0.0f32; BLOCK_SIZE]; 2];
    for _ in 0..40 {
        let written = listener.read(&inputs, &mut output);
        assert_eq!(written, BLOCK_SIZE);
        // Membership fades ramp gradually; the mix must never jump more than
        // a bounded step between consecutive samples within one block (§8
        // scenario 3's "no sample-to-sample delta > gain-step").
        for channel in &output {
            for pair in channel.windows(2) {
                assert!((pair[1] - pair[0]).abs() < 0.25, "unexpected discontinuity in cluster mix");
            }
        }
    }
}

#[test]
fn listener_rejects_sample_rate_change_without_rebuild() {
    let request = RenderRequest { channel_layout: ChannelLayout::Stereo, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, _handle) = Listener::new(request, FrequencyBandConfig::default());

    let changed = RenderRequest { sample_rate: SAMPLE_RATE * 2, ..RenderRequest::default() };
    let result = listener.set_render_request(changed);
    assert!(matches!(result, Err(CoreError::SampleRateChanged { .. })));
}

#[test]
fn listener_rejects_channel_count_change_without_rebuild() {
    let request = RenderRequest { channel_layout: ChannelLayout::Mono, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, _handle) = Listener::new(request, FrequencyBandConfig::default());

    let changed = RenderRequest { channel_layout: ChannelLayout::Stereo, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let result = listener.set_render_request(changed);
    assert!(matches!(result, Err(CoreError::ChannelCountChanged { .. })));
}

#[test]
fn read_block_size_matches_requested_length_across_calls() {
    let request = RenderRequest { channel_layout: ChannelLayout::Stereo, sample_rate: SAMPLE_RATE, ..RenderRequest::default() };
    let (mut listener, _handle) = Listener::new(request, FrequencyBandConfig::default());

    let sources = SourceInputs::new();
    for &n in &[17usize, 64, 333, 1024] {
        let mut output = vec![vec![0.0f32; n]; 2];
        let written = listener.read(&sources, &mut output);
        assert_eq!(written, n);
    }
    settle(&mut listener, &sources, 2, 1);
}
