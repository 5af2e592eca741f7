//! Benchmark runner for batch pipelines
//!
//! Usage: `batchflow-bench [config.json]`. Without an argument the default
//! configuration is used, followed by sweeps over batch size and prefetch
//! depth.

use anyhow::Context;
use batchflow_bench::{bench_prefetch, compare_modes, BenchConfig, BenchResult};
use batchflow_parallel::PrefetchConfig;

fn print_result(result: &BenchResult) {
    println!("\nBenchmark: {}", result.name);
    println!("  Total time:   {:?}", result.total_time);
    println!("  Average time: {:?}", result.avg_time);
    println!("  Min time:     {:?}", result.min_time);
    println!("  Max time:     {:?}", result.max_time);
    println!("  Throughput:   {:.2} items/sec", result.throughput);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {path}"))?
        }
        None => BenchConfig::default(),
    };
    tracing::info!(?config, "running benchmarks");

    println!("=== Batch Pipeline Benchmarks ===");
    for result in compare_modes(&config)? {
        print_result(&result);
    }

    println!("\n=== Batch Size Sweep ===");
    for batch_size in [32, 128, 512, 2048] {
        let config = BenchConfig {
            batch_size,
            iterations: 3,
            warmup_iterations: 1,
            ..config.clone()
        };
        for result in compare_modes(&config)? {
            println!("\nBatch size {batch_size}, {}", result.name);
            println!("  Average time: {:?}", result.avg_time);
            println!("  Throughput:   {:.2} items/sec", result.throughput);
        }
    }

    println!("\n=== Prefetch Depth Sweep ===");
    for depth in [1, 2, 4, 8] {
        let config = BenchConfig {
            prefetch: PrefetchConfig::default().depth(depth),
            iterations: 3,
            warmup_iterations: 1,
            ..config.clone()
        };
        let result = bench_prefetch(&config)?;
        println!("\nDepth {depth}");
        println!("  Average time: {:?}", result.avg_time);
        println!("  Throughput:   {:.2} items/sec", result.throughput);
    }
    Ok(())
}
