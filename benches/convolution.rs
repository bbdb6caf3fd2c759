use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use auralis_core::ir::convolver::{PartitionPlan, UpolaEngine};

const SAMPLE_RATE: f32 = 48_000.0;

fn build_engine(max_latency_s: f32, max_ir_length_s: f32, channels: usize) -> UpolaEngine {
    let plan = PartitionPlan::new(max_latency_s, SAMPLE_RATE, max_ir_length_s, 16_384, 4);
    UpolaEngine::new(plan, channels, SAMPLE_RATE, 0.05)
}

fn bench_tick_by_ir_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("UPOLA Tick by IR Length");

    for &ir_seconds in &[0.1, 0.5, 1.0, 2.0] {
        group.bench_with_input(BenchmarkId::from_parameter(ir_seconds), &ir_seconds, |b, &ir_seconds| {
            let mut engine = build_engine(16.0 / 1_000.0, ir_seconds, 2);
            let l0 = engine.plan().l0;
            let input = vec![0.5f32; l0];
            let mut output = vec![vec![0.0f32; l0]; 2];

            for _ in 0..8 {
                engine.tick(black_box(&input), &mut output);
            }

            b.iter(|| {
                engine.tick(black_box(&input), black_box(&mut output));
            });
        });
    }

    group.finish();
}

fn bench_tick_by_channel_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("UPOLA Tick by Channel Count");

    for &channels in &[1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(channels), &channels, |b, &channels| {
            let mut engine = build_engine(16.0 / 1_000.0, 0.5, channels);
            let l0 = engine.plan().l0;
            let input = vec![0.5f32; l0];
            let mut output = vec![vec![0.0f32; l0]; channels];

            b.iter(|| {
                engine.tick(black_box(&input), black_box(&mut output));
            });
        });
    }

    group.finish();
}

fn bench_tick_by_latency_target(c: &mut Criterion) {
    let mut group = c.benchmark_group("UPOLA Tick by Latency Target");

    for &latency_ms in &[4.0, 16.0, 32.0] {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{latency_ms}ms")), &latency_ms, |b, &latency_ms| {
            let mut engine = build_engine(latency_ms / 1_000.0, 1.0, 2);
            let l0 = engine.plan().l0;
            let input = vec![0.5f32; l0];
            let mut output = vec![vec![0.0f32; l0]; 2];

            b.iter(|| {
                engine.tick(black_box(&input), black_box(&mut output));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tick_by_ir_length, bench_tick_by_channel_count, bench_tick_by_latency_target);
criterion_main!(benches);
