use batchflow_bench::{feature_pipeline, BenchConfig};
use batchflow_core::{Batch, Index, Result, RunConfig, Shuffle};
use batchflow_parallel::{PrefetchConfig, PrefetchExt};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const BATCH_SIZES: [usize; 3] = [64, 256, 1024];

fn config() -> BenchConfig {
    BenchConfig {
        items: 8_192,
        features: 32,
        work_rounds: 8,
        ..BenchConfig::default()
    }
}

fn drain(batches: impl Iterator<Item = Result<Batch<u64, Vec<f32>>>>) -> usize {
    batches.map(|b| b.map(|b| b.len()).unwrap_or(0)).sum()
}

/// Index operations that every run performs up front
fn bench_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("Index");
    let index = Index::range(100_000);
    group.bench_function("shuffle", |b| b.iter(|| black_box(index.shuffle(Some(3)))));
    group.bench_function("split", |b| {
        b.iter(|| black_box(index.split(&[0.8, 0.1], Shuffle::Seeded(3)).map(|parts| parts.len())))
    });
    group.finish();
}

/// Items per second through each execution mode
fn bench_modes(c: &mut Criterion) {
    let config = config();
    let sequential = feature_pipeline(&config, false).expect("pipeline");
    let parallel = feature_pipeline(&config, true).expect("pipeline");

    let mut group = c.benchmark_group("Pipeline Throughput");
    group.throughput(Throughput::Elements(config.items as u64));
    for &batch_size in &BATCH_SIZES {
        let run = RunConfig::new(batch_size).shuffle(Shuffle::Seeded(1));

        group.bench_with_input(BenchmarkId::new("sequential", batch_size), &run, |b, run| {
            b.iter(|| drain(sequential.gen_batch(run).expect("stream")));
        });
        group.bench_with_input(BenchmarkId::new("par_map", batch_size), &run, |b, run| {
            b.iter(|| drain(parallel.gen_batch(run).expect("stream")));
        });
        group.bench_with_input(BenchmarkId::new("prefetch", batch_size), &run, |b, run| {
            b.iter(|| drain(sequential.prefetch(run, &PrefetchConfig::default()).expect("queue")));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_index, bench_modes);
criterion_main!(benches);
