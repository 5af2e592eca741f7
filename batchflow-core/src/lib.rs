//! Core traits, data structures, and execution engine for lazy batch pipelines
//!
//! This crate provides the foundational components for describing a data
//! processing workflow as a lazily evaluated pipeline over a dataset and
//! materializing it as a stream of processed batches. An [`Index`] enumerates
//! the addressable items, a [`Dataset`] builds batches for any subset of it,
//! a [`Pipeline`] records actions without running them, and a
//! [`BatchGenerator`] slices the index over epochs.

#![warn(missing_docs)]

pub mod action;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod error;
pub mod executor;
pub mod generator;
pub mod index;
pub mod join;
pub mod pipeline;
pub mod pool;
pub mod schedule;
pub mod seed;
pub mod variables;

// Re-export key types for convenience
pub use action::{Action, ActionKind, ActionQueue, ActionRegistry, ExecMode, OnError};
pub use batch::{Batch, Item};
pub use config::{Epochs, PoolConfig, RunConfig, Shuffle};
pub use dataset::{BatchLoader, Dataset};
pub use error::{Error, Result};
pub use generator::{BatchGenerator, GeneratorState, Slice};
pub use index::{Index, Key, Selector};
pub use join::{JoinedBatch, JoinedPipeline};
pub use pipeline::Pipeline;
pub use pool::WorkerPool;
pub use schedule::{BatchProducer, BatchStream, CancelToken, RunStats};
pub use variables::Variables;

static_assertions::assert_impl_all!(Index<String>: Send, Sync, Clone);
static_assertions::assert_impl_all!(Dataset<u64, Vec<f32>>: Send, Sync, Clone);
static_assertions::assert_impl_all!(Pipeline<u64, Vec<f32>>: Send, Sync, Clone);
static_assertions::assert_impl_all!(JoinedPipeline<u64, Vec<f32>>: Send, Sync, Clone);
static_assertions::assert_impl_all!(WorkerPool: Send, Sync, Clone);
static_assertions::assert_impl_all!(Error: Send, Sync, std::error::Error);

/// Route `tracing` output of a test through the test harness
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}
