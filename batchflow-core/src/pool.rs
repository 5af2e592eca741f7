//! Bounded worker pool for intra-batch parallelism
//!
//! Items of a batch are dispatched as independent work units. Results are
//! collected through an indexed parallel iterator, so the output order always
//! matches the input order whatever order the workers finish in.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

static DEFAULT_POOL: Lazy<WorkerPool> = Lazy::new(|| {
    WorkerPool::new(&PoolConfig::default()).unwrap_or_else(|_| WorkerPool::fallback())
});

/// A fixed-size pool of worker threads
#[derive(Clone)]
pub struct WorkerPool {
    /// Underlying thread pool; `None` runs work units inline
    pool: Option<Arc<ThreadPool>>,

    /// Number of workers
    threads: usize,
}

impl WorkerPool {
    /// Create a pool of `config.threads` workers
    pub fn new(config: &PoolConfig) -> Result<Self> {
        if config.threads == 0 {
            return Err(Error::config("worker pool needs at least one thread"));
        }
        let name = config.thread_name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(move |i| format!("{name}-{i}"))
            .build()
            .map_err(|e| Error::config(format!("failed to build worker pool: {e}")))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
            threads: config.threads,
        })
    }

    /// The process-wide default pool, sized to the number of CPUs
    pub fn global() -> Self {
        DEFAULT_POOL.clone()
    }

    /// A pool that runs every work unit on the calling thread
    pub fn inline() -> Self {
        Self { pool: None, threads: 1 }
    }

    fn fallback() -> Self {
        tracing::warn!("could not start the default worker pool, running work units inline");
        Self::inline()
    }

    /// Number of workers
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Apply `f` to every input on the pool, returning results in input order
    pub fn map_ordered<I, O, F>(&self, inputs: Vec<I>, f: F) -> Vec<O>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> O + Send + Sync,
    {
        match &self.pool {
            Some(pool) => pool.install(|| inputs.into_par_iter().map(&f).collect()),
            None => inputs.into_iter().map(f).collect(),
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .field("inline", &self.pool.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preserves_order_under_random_delays() {
        let pool = WorkerPool::new(&PoolConfig {
            threads: 4,
            thread_name: "test-pool".into(),
        })
        .unwrap();
        let inputs: Vec<u64> = (0..64).collect();
        let outputs = pool.map_ordered(inputs.clone(), |i| {
            // pseudo-random delay so later items often finish first
            std::thread::sleep(Duration::from_micros((i * 7919) % 300));
            i * 2
        });
        assert_eq!(outputs, inputs.iter().map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn zero_threads_is_rejected() {
        let config = PoolConfig {
            threads: 0,
            thread_name: "x".into(),
        };
        assert!(matches!(WorkerPool::new(&config), Err(Error::Configuration(_))));
    }

    #[test]
    fn inline_pool_runs_on_caller() {
        let caller = std::thread::current().id();
        let seen = WorkerPool::inline().map_ordered(vec![1, 2], |_| std::thread::current().id());
        assert!(seen.iter().all(|id| *id == caller));
    }
}
