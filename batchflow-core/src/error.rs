//! Error types for batch pipelines

use thiserror::Error;

/// Result type for batch pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for batch pipeline operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration detected while building or launching a pipeline
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An action failed on one or more items
    #[error("Pipeline execution error in action #{position} ({action}) for ids {ids:?}: {message}")]
    PipelineExecution {
        /// Position of the failing action in the queue
        position: usize,
        /// Name of the failing action
        action: String,
        /// Debug renderings of the offending identifiers
        ids: Vec<String>,
        /// Underlying failure message
        message: String,
    },

    /// The dataset could not materialize a batch
    #[error("Dataset load error for ids {ids:?}: {message}")]
    Load {
        /// Debug renderings of the requested identifiers
        ids: Vec<String>,
        /// Underlying failure message
        message: String,
    },

    /// Attempted to pull beyond the last batch of a finite run
    #[error("Batch generator exhausted")]
    Exhausted,

    /// The consumer cancelled the run
    #[error("Pipeline run cancelled")]
    Cancelled,

    /// Unknown pipeline variable
    #[error("Unknown pipeline variable: {0}")]
    Variable(String),
}

impl Error {
    /// Build a configuration error from anything printable
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Whether this error reports an action failure
    pub fn is_execution(&self) -> bool {
        matches!(self, Error::PipelineExecution { .. })
    }
}

/// Render identifiers for error reports
pub(crate) fn render_ids<'a, K, I>(ids: I) -> Vec<String>
where
    K: std::fmt::Debug + 'a,
    I: IntoIterator<Item = &'a K>,
{
    ids.into_iter().map(|id| format!("{id:?}")).collect()
}
