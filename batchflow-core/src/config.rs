//! Run configuration for batch generation and pipeline execution

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::seed;

/// Shuffling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Shuffle {
    /// Keep the index order
    #[default]
    Off,
    /// Reproducible shuffling from the given seed
    Seeded(u64),
    /// Shuffle with a seed drawn from the process-wide generator
    Random,
}

impl Shuffle {
    /// Resolve the policy into a concrete base seed, if shuffling at all
    pub fn resolve(self) -> Option<u64> {
        match self {
            Shuffle::Off => None,
            Shuffle::Seeded(seed) => Some(seed),
            Shuffle::Random => Some(seed::fresh_seed()),
        }
    }

    /// Whether this policy shuffles
    pub fn is_enabled(self) -> bool {
        !matches!(self, Shuffle::Off)
    }
}

impl From<bool> for Shuffle {
    fn from(shuffle: bool) -> Self {
        if shuffle {
            Shuffle::Random
        } else {
            Shuffle::Off
        }
    }
}

impl From<u64> for Shuffle {
    fn from(seed: u64) -> Self {
        Shuffle::Seeded(seed)
    }
}

/// Number of passes over the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Epochs {
    /// A fixed number of passes
    Finite(usize),
    /// Iterate until cancelled
    Unbounded,
}

impl Default for Epochs {
    fn default() -> Self {
        Epochs::Finite(1)
    }
}

impl From<usize> for Epochs {
    fn from(n: usize) -> Self {
        Epochs::Finite(n)
    }
}

impl From<Option<usize>> for Epochs {
    fn from(n: Option<usize>) -> Self {
        n.map_or(Epochs::Unbounded, Epochs::Finite)
    }
}

/// Configuration of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of items per batch
    pub batch_size: usize,

    /// Shuffling policy, applied afresh every epoch
    pub shuffle: Shuffle,

    /// Number of passes over the index
    pub epochs: Epochs,

    /// Optional cap on the number of batches, overriding `epochs`
    pub n_iters: Option<usize>,

    /// Discard the short final batch of each epoch
    pub drop_last: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: Shuffle::Off,
            epochs: Epochs::Finite(1),
            n_iters: None,
            drop_last: false,
        }
    }
}

impl RunConfig {
    /// Create a config with the given batch size and defaults elsewhere
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Set the shuffling policy
    #[must_use]
    pub fn shuffle(mut self, shuffle: impl Into<Shuffle>) -> Self {
        self.shuffle = shuffle.into();
        self
    }

    /// Set the number of epochs
    #[must_use]
    pub fn epochs(mut self, epochs: impl Into<Epochs>) -> Self {
        self.epochs = epochs.into();
        self
    }

    /// Emit exactly `n_iters` batches, ignoring `epochs`
    #[must_use]
    pub fn n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = Some(n_iters);
        self
    }

    /// Set the drop-last policy
    #[must_use]
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Whether a run with this config terminates on its own
    pub fn is_finite(&self) -> bool {
        self.n_iters.is_some() || matches!(self.epochs, Epochs::Finite(_))
    }

    /// Validate the config against an index of `len` items
    pub fn validate(&self, len: usize) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }
        if self.epochs == Epochs::Finite(0) {
            return Err(Error::config("epochs must be a positive integer or unbounded"));
        }
        if self.n_iters == Some(0) {
            return Err(Error::config("n_iters must be greater than 0"));
        }
        if !self.is_finite() {
            let per_epoch = if self.drop_last { len / self.batch_size } else { len.div_ceil(self.batch_size) };
            if per_epoch == 0 {
                return Err(Error::config(format!(
                    "unbounded run over {len} items with batch_size {} would never emit a batch",
                    self.batch_size
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of the intra-batch worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads
    pub threads: usize,

    /// Prefix of worker thread names
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            thread_name: "batchflow-pool".into(),
        }
    }
}
