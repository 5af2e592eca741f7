//! Run scheduling: the producer seam, lazy batch streams and run statistics

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::generator::{BatchGenerator, GeneratorState, Slice};
use crate::index::{Index, Key};

/// Statistics from one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStats {
    /// Identifier of the run, recorded in log fields
    pub run_id: Uuid,

    /// Number of batches produced
    pub batches: u64,

    /// Number of items in the produced batches
    pub items: u64,

    /// Total execution time
    pub elapsed: Duration,
}

/// Cooperative cancellation flag shared between a consumer and producers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Turns generator slices into outputs.
///
/// Implemented by pipelines and joined pipelines; the prefetch queue drives
/// any producer from its worker threads.
pub trait BatchProducer: Send + Sync + 'static {
    /// Identifier type of the index being sliced
    type Key: Key;

    /// What one slice turns into
    type Output: Send + 'static;

    /// The index the generator slices
    fn index(&self) -> &Index<Self::Key>;

    /// Materialize and process one slice
    fn produce(&self, slice: &Slice<Self::Key>, cancel: &CancelToken) -> Result<Self::Output>;

    /// Number of items in an output, for run statistics
    fn output_len(output: &Self::Output) -> usize;

    /// Create the generator for a run of this producer
    fn generator(&self, config: &RunConfig) -> Result<BatchGenerator<Self::Key>> {
        BatchGenerator::new(self.index().clone(), config)
    }
}

/// Lazy stream of processed batches.
///
/// Nothing runs until the stream is pulled; each pull claims one slice from
/// the generator and produces it on the calling thread.
pub struct BatchStream<P: BatchProducer> {
    producer: P,
    generator: BatchGenerator<P::Key>,
    cancel: CancelToken,
    run_id: Uuid,
    started: Instant,
    batches: u64,
    items: u64,
}

impl<P: BatchProducer> BatchStream<P> {
    /// Start a run of `producer` with `config`
    pub fn new(producer: P, config: &RunConfig) -> Result<Self> {
        let generator = producer.generator(config)?;
        let run_id = Uuid::new_v4();
        debug!(
            %run_id,
            batch_size = config.batch_size,
            items = generator.index().len(),
            seed = ?generator.base_seed(),
            "batch stream started"
        );
        Ok(Self {
            producer,
            generator,
            cancel: CancelToken::new(),
            run_id,
            started: Instant::now(),
            batches: 0,
            items: 0,
        })
    }

    /// Identifier of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The producer being driven
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// A handle that cancels this stream from elsewhere
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop the run; no further slice is claimed
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.generator.cancel();
    }

    /// Lifecycle of the underlying generator
    pub fn state(&self) -> GeneratorState {
        self.generator.state()
    }

    /// Pull the next batch, failing with `Exhausted` or `Cancelled` at the end
    pub fn next_batch(&mut self) -> Result<P::Output> {
        match self.next() {
            Some(result) => result,
            None if self.generator.state() == GeneratorState::Cancelled => Err(Error::Cancelled),
            None => Err(Error::Exhausted),
        }
    }

    /// Statistics of the batches produced so far
    pub fn stats(&self) -> RunStats {
        RunStats {
            run_id: self.run_id,
            batches: self.batches,
            items: self.items,
            elapsed: self.started.elapsed(),
        }
    }

    /// Split into the producer and the generator, for drivers that claim
    /// slices themselves
    pub fn into_parts(self) -> (P, BatchGenerator<P::Key>, CancelToken) {
        (self.producer, self.generator, self.cancel)
    }
}

impl<P: BatchProducer> Iterator for BatchStream<P> {
    type Item = Result<P::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            self.generator.cancel();
        }
        let Some(slice) = self.generator.next() else {
            if self.generator.state() == GeneratorState::Exhausted {
                debug!(run_id = %self.run_id, batches = self.batches, "batch stream finished");
            }
            return None;
        };
        let result = self.producer.produce(&slice, &self.cancel);
        if let Ok(output) = &result {
            self.batches += 1;
            self.items += P::output_len(output) as u64;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.generator.size_hint()
    }
}

/// Drive `producer` to completion, discarding outputs.
///
/// The first failing batch aborts the run.
pub fn run_to_completion<P: BatchProducer>(producer: P, config: &RunConfig) -> Result<RunStats> {
    if !config.is_finite() {
        return Err(Error::config("run() needs a finite number of epochs or n_iters"));
    }
    let mut stream = BatchStream::new(producer, config)?;
    for result in stream.by_ref() {
        result?;
    }
    let stats = stream.stats();
    debug!(
        run_id = %stats.run_id,
        batches = stats.batches,
        items = stats.items,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "run finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Epochs;

    /// Producer that echoes slice identifiers
    struct Echo(Index<usize>);

    impl BatchProducer for Echo {
        type Key = usize;
        type Output = Vec<usize>;

        fn index(&self) -> &Index<usize> {
            &self.0
        }

        fn produce(&self, slice: &Slice<usize>, cancel: &CancelToken) -> Result<Vec<usize>> {
            cancel.check()?;
            if slice.ids.contains(&13) {
                return Err(Error::Load {
                    ids: vec!["13".into()],
                    message: "unlucky".into(),
                });
            }
            Ok(slice.ids.clone())
        }

        fn output_len(output: &Vec<usize>) -> usize {
            output.len()
        }
    }

    #[test]
    fn stream_is_lazy_and_ends_with_exhaustion() {
        crate::init_test_tracing();
        let mut stream = BatchStream::new(Echo(Index::range(5)), &RunConfig::new(2)).unwrap();
        assert_eq!(stream.state(), GeneratorState::Idle);
        assert_eq!(stream.next_batch().unwrap(), vec![0, 1]);
        assert_eq!(stream.next_batch().unwrap(), vec![2, 3]);
        assert_eq!(stream.next_batch().unwrap(), vec![4]);
        assert_eq!(stream.next_batch(), Err(Error::Exhausted));
        assert_eq!(stream.stats().batches, 3);
        assert_eq!(stream.stats().items, 5);
    }

    #[test]
    fn cancelling_stops_claiming() {
        let config = RunConfig::new(2).epochs(Epochs::Unbounded);
        let mut stream = BatchStream::new(Echo(Index::range(5)), &config).unwrap();
        assert!(stream.next_batch().is_ok());
        stream.cancel_token().cancel();
        assert_eq!(stream.next_batch(), Err(Error::Cancelled));
        assert_eq!(stream.state(), GeneratorState::Cancelled);
    }

    #[test]
    fn failing_batches_surface_in_order() {
        let stream = BatchStream::new(Echo(Index::range(16)), &RunConfig::new(4)).unwrap();
        let results: Vec<bool> = stream.map(|r| r.is_ok()).collect();
        assert_eq!(results, vec![true, true, true, false]);
    }

    #[test]
    fn run_requires_a_finite_config() {
        let unbounded = RunConfig::new(2).epochs(Epochs::Unbounded);
        assert!(matches!(
            run_to_completion(Echo(Index::range(4)), &unbounded),
            Err(Error::Configuration(_))
        ));
        let stats = run_to_completion(Echo(Index::range(4)), &RunConfig::new(3).epochs(2)).unwrap();
        assert_eq!((stats.batches, stats.items), (4, 8));
        assert!(run_to_completion(Echo(Index::range(14)), &RunConfig::new(5)).is_err());
    }
}
