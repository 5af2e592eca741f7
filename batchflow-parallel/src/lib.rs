//! Parallelism and concurrency features for batch pipelines
//!
//! Overlaps batch production with consumption: a [`PrefetchQueue`] runs any
//! [`batchflow_core::BatchProducer`] (a pipeline or a joined pipeline) on
//! background workers and hands the results back in generation order.

#![warn(missing_docs)]

pub mod prefetch;

pub use prefetch::{PrefetchConfig, PrefetchExt, PrefetchQueue};
