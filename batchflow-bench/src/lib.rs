//! Benchmarks for batch pipeline components

use std::time::{Duration, Instant};

use batchflow_core::{Batch, Dataset, JoinedPipeline, Pipeline, Result, RunConfig, Shuffle};
use batchflow_parallel::{PrefetchConfig, PrefetchExt};
use serde::{Deserialize, Serialize};

/// Benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Number of items in the synthetic dataset
    pub items: usize,

    /// Length of every item's feature vector
    pub features: usize,

    /// Items per batch
    pub batch_size: usize,

    /// Rounds of arithmetic applied to every feature, to simulate item work
    pub work_rounds: usize,

    /// Prefetch settings for the prefetch benchmark
    pub prefetch: PrefetchConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            items: 10_000,
            features: 64,
            batch_size: 256,
            work_rounds: 16,
            prefetch: PrefetchConfig::default(),
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Throughput (items/second)
    pub throughput: f64,
}

/// Run a benchmark; `func` returns the number of items it processed
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, func: F) -> Result<BenchResult>
where
    F: Fn() -> Result<u64>,
{
    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let iterations = config.iterations.max(1);
    let mut times = Vec::with_capacity(iterations);
    let mut items = 0_u64;
    let start_total = Instant::now();
    for _ in 0..iterations {
        let start = Instant::now();
        items += func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / u32::try_from(times.len()).unwrap_or(u32::MAX);
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let throughput = items as f64 / total_time.as_secs_f64().max(f64::EPSILON);

    tracing::debug!(name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        throughput,
    })
}

/// A dataset of `items` synthetic feature vectors, built on demand
pub fn synthetic_dataset(items: usize, features: usize) -> Result<Dataset<u64, Vec<f32>>> {
    Dataset::from_fn(0..items as u64, move |ids: &[u64]| {
        Ok(ids
            .iter()
            .map(|&id| (0..features).map(|f| (id as f32) * 0.001 + f as f32).collect())
            .collect())
    })
}

/// Simulated per-item work
pub fn normalize(item: Vec<f32>, rounds: usize) -> Vec<f32> {
    let mut item = item;
    for _ in 0..rounds {
        let norm = item.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
        for x in &mut item {
            *x = (*x / norm).mul_add(0.5, 0.25);
        }
    }
    item
}

/// The benchmarked pipeline: one per-item map, sequential or parallel
pub fn feature_pipeline(config: &BenchConfig, parallel: bool) -> Result<Pipeline<u64, Vec<f32>>> {
    let rounds = config.work_rounds;
    let pipeline = synthetic_dataset(config.items, config.features)?.pipeline();
    let work = move |_: &u64, item: Vec<f32>| -> anyhow::Result<Vec<f32>> { Ok(normalize(item, rounds)) };
    Ok(if parallel {
        pipeline.par_map("normalize", work)
    } else {
        pipeline.map("normalize", work)
    })
}

fn run_config(config: &BenchConfig) -> RunConfig {
    RunConfig::new(config.batch_size).shuffle(Shuffle::Seeded(7))
}

fn consume(batches: impl Iterator<Item = Result<Batch<u64, Vec<f32>>>>) -> Result<u64> {
    let mut items = 0;
    for batch in batches {
        items += batch?.len() as u64;
    }
    Ok(items)
}

/// Sequential maps pulled on the calling thread
pub fn bench_sequential(config: &BenchConfig) -> Result<BenchResult> {
    let pipeline = feature_pipeline(config, false)?;
    run_benchmark("sequential map", config, || consume(pipeline.gen_batch(&run_config(config))?))
}

/// Parallel maps on the worker pool
pub fn bench_parallel_map(config: &BenchConfig) -> Result<BenchResult> {
    let pipeline = feature_pipeline(config, true)?;
    run_benchmark("parallel map", config, || consume(pipeline.gen_batch(&run_config(config))?))
}

/// Sequential maps run ahead of the consumer by a prefetch queue
pub fn bench_prefetch(config: &BenchConfig) -> Result<BenchResult> {
    let pipeline = feature_pipeline(config, false)?;
    run_benchmark("prefetched sequential map", config, || {
        consume(pipeline.prefetch(&run_config(config), &config.prefetch)?)
    })
}

/// Two pipelines advanced in lockstep
pub fn bench_join(config: &BenchConfig) -> Result<BenchResult> {
    let joined = JoinedPipeline::new(vec![feature_pipeline(config, true)?, feature_pipeline(config, true)?])?;
    run_benchmark("joined parallel maps", config, || {
        let mut items = 0;
        for batch in joined.gen_batch(&run_config(config))? {
            items += batch?.len() as u64;
        }
        Ok(items)
    })
}

/// Every execution mode on the same workload
pub fn compare_modes(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    Ok(vec![
        bench_sequential(config)?,
        bench_parallel_map(config)?,
        bench_prefetch(config)?,
        bench_join(config)?,
    ])
}
