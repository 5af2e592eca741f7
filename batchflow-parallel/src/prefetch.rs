//! Bounded prefetching of processed batches
//!
//! A [`PrefetchQueue`] runs a [`BatchProducer`] on a fixed set of worker
//! threads ahead of the consumer. Workers claim slices from one shared
//! generator, produce them, and push each result (batch or failure) tagged
//! with its sequence number into a bounded channel. The consumer keeps a small
//! reorder map and hands results out strictly in sequence order.
//!
//! Backpressure comes from the channel: once `depth` results are waiting,
//! workers block on push until the consumer drains one.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use batchflow_core::{BatchGenerator, BatchProducer, CancelToken, Error, Result, RunConfig, RunStats, Slice};
use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Configuration of a prefetch queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Number of finished slices that may wait for the consumer
    pub depth: usize,

    /// Number of worker threads
    pub workers: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            workers: num_cpus::get(),
        }
    }
}

impl PrefetchConfig {
    /// Create a config with the given depth and worker count
    pub fn new(depth: usize, workers: usize) -> Self {
        Self { depth, workers }
    }

    /// Set the prefetch depth
    #[must_use]
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Set the number of workers
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Reject zero depth or zero workers
    pub fn validate(&self) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::config("prefetch depth must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(Error::config("prefetch needs at least one worker"));
        }
        Ok(())
    }
}

/// A finished slice on its way to the consumer
type Produced<O> = (u64, Result<O>);

/// State shared by the workers
struct Shared<P: BatchProducer> {
    producer: P,
    generator: Mutex<BatchGenerator<P::Key>>,
    cancel: CancelToken,
    run_id: Uuid,
}

impl<P: BatchProducer> Shared<P> {
    /// Take the next slice, or `None` when the generator is done or the
    /// queue is cancelled
    fn claim(&self) -> Option<Slice<P::Key>> {
        let mut generator = self.generator.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            generator.cancel();
            return None;
        }
        generator.next()
    }
}

/// Worker thread body
fn work<P: BatchProducer>(shared: &Shared<P>, output: &Sender<Produced<P::Output>>, worker: usize) {
    trace!(run_id = %shared.run_id, worker, "prefetch worker started");
    let mut produced = 0_u64;
    while let Some(slice) = shared.claim() {
        trace!(run_id = %shared.run_id, worker, seq = slice.seq, "producing slice");
        let result = panic::catch_unwind(AssertUnwindSafe(|| shared.producer.produce(&slice, &shared.cancel)))
            .unwrap_or_else(|payload| Err(panicked(&slice, payload.as_ref())));
        if let Err(e) = &result {
            debug!(run_id = %shared.run_id, worker, seq = slice.seq, error = %e, "slice failed");
        }
        // Fails only once the consumer has dropped the receiver.
        if output.send((slice.seq, result)).is_err() {
            break;
        }
        produced += 1;
    }
    debug!(run_id = %shared.run_id, worker, produced, "prefetch worker finished");
}

fn panicked<K: fmt::Debug>(slice: &Slice<K>, payload: &(dyn Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    warn!(seq = slice.seq, %message, "prefetch worker panicked");
    Error::PipelineExecution {
        position: 0,
        action: "prefetch worker".into(),
        ids: slice.ids.iter().map(|id| format!("{id:?}")).collect(),
        message: format!("worker panicked: {message}"),
    }
}

/// Batches produced on background workers and delivered in sequence order
pub struct PrefetchQueue<P: BatchProducer> {
    shared: Arc<Shared<P>>,
    workers: Vec<JoinHandle<()>>,
    output: Option<Receiver<Produced<P::Output>>>,
    pending: BTreeMap<u64, Result<P::Output>>,
    head: u64,
    depth: usize,
    started: Instant,
    batches: u64,
    items: u64,
}

impl<P: BatchProducer> PrefetchQueue<P> {
    /// Start prefetching a run of `producer`.
    ///
    /// Both configs are validated before any worker starts.
    pub fn new(producer: P, run: &RunConfig, config: &PrefetchConfig) -> Result<Self> {
        config.validate()?;
        let generator = producer.generator(run)?;
        let run_id = Uuid::new_v4();
        debug!(
            %run_id,
            depth = config.depth,
            workers = config.workers,
            batch_size = run.batch_size,
            "prefetch queue started"
        );

        let shared = Arc::new(Shared {
            producer,
            generator: Mutex::new(generator),
            cancel: CancelToken::new(),
            run_id,
        });
        let (output_tx, output_rx) = bounded(config.depth);

        let mut queue = Self {
            shared,
            workers: Vec::with_capacity(config.workers),
            output: Some(output_rx),
            pending: BTreeMap::new(),
            head: 0,
            depth: config.depth,
            started: Instant::now(),
            batches: 0,
            items: 0,
        };
        for worker in 0..config.workers {
            let shared = Arc::clone(&queue.shared);
            let output = output_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("batchflow-prefetch-{worker}"))
                .spawn(move || work(&shared, &output, worker));
            match spawned {
                Ok(handle) => queue.workers.push(handle),
                // Dropping the queue cancels and joins the workers already running.
                Err(e) => return Err(Error::config(format!("failed to spawn prefetch worker {worker}: {e}"))),
            }
        }
        Ok(queue)
    }

    /// Identifier of this run
    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    /// Number of finished results waiting for the consumer
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.output.as_ref().map_or(0, Receiver::len)
    }

    /// Whether the queue was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop the run.
    ///
    /// No further slice is claimed, workers finish their current slice and
    /// exit, and finished results are discarded.
    pub fn cancel(&mut self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        self.shared
            .generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        let discarded = self.buffered();
        // Workers blocked on a full channel see it disconnect and exit.
        self.output.take();
        self.pending.clear();
        debug!(run_id = %self.shared.run_id, discarded, "prefetch queue cancelled");
    }

    /// Pull the next batch, failing with `Exhausted` or `Cancelled` at the end
    pub fn next_batch(&mut self) -> Result<P::Output> {
        match self.next() {
            Some(result) => result,
            None if self.is_cancelled() => Err(Error::Cancelled),
            None => Err(Error::Exhausted),
        }
    }

    /// Statistics of the batches delivered so far
    pub fn stats(&self) -> RunStats {
        RunStats {
            run_id: self.shared.run_id,
            batches: self.batches,
            items: self.items,
            elapsed: self.started.elapsed(),
        }
    }
}

impl<P: BatchProducer> Iterator for PrefetchQueue<P> {
    type Item = Result<P::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.shared.cancel.is_cancelled() {
            return None;
        }
        let output = self.output.as_ref()?;
        loop {
            if let Some(result) = self.pending.remove(&self.head) {
                self.head += 1;
                if let Ok(batch) = &result {
                    self.batches += 1;
                    self.items += P::output_len(batch) as u64;
                }
                return Some(result);
            }
            // Disconnects once every worker has exited.
            match output.recv() {
                Ok((seq, result)) => {
                    self.pending.insert(seq, result);
                }
                Err(_) => return None,
            }
        }
    }
}

impl<P: BatchProducer> Drop for PrefetchQueue<P> {
    fn drop(&mut self) {
        self.cancel();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(run_id = %self.shared.run_id, "prefetch worker exited abnormally");
            }
        }
    }
}

impl<P: BatchProducer> fmt::Debug for PrefetchQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrefetchQueue")
            .field("run_id", &self.shared.run_id)
            .field("depth", &self.depth)
            .field("workers", &self.workers.len())
            .field("delivered", &self.batches)
            .finish_non_exhaustive()
    }
}

/// Prefetching entry point for every batch producer
pub trait PrefetchExt: BatchProducer + Clone + Sized {
    /// Start a prefetched run of a copy of this producer
    fn prefetch(&self, run: &RunConfig, config: &PrefetchConfig) -> Result<PrefetchQueue<Self>> {
        PrefetchQueue::new(self.clone(), run, config)
    }
}

impl<P: BatchProducer + Clone> PrefetchExt for P {}
