//! Lazily evaluated pipelines over a dataset
//!
//! A [`Pipeline`] is an immutable value: every build call returns a new
//! pipeline with one more recorded action and leaves the receiver untouched.
//! Nothing runs until a batch is requested through [`Pipeline::gen_batch`],
//! [`Pipeline::next_batch`], [`Pipeline::run`] or [`Pipeline::execute_for`].

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::action::{Action, ActionQueue, ActionRegistry, ExecMode};
use crate::batch::{Batch, Item};
use crate::config::RunConfig;
use crate::dataset::{shared_index, Dataset};
use crate::error::{Error, Result};
use crate::executor::{execute, Context};
use crate::generator::{BatchGenerator, GeneratorState, Slice};
use crate::index::{Index, Key};
use crate::pool::WorkerPool;
use crate::schedule::{run_to_completion, BatchProducer, BatchStream, CancelToken, RunStats};
use crate::variables::Variables;

/// Generator state kept across [`Pipeline::next_batch`] calls
#[derive(Debug)]
struct ActiveRun<K: Key> {
    run_id: Uuid,
    generator: BatchGenerator<K>,
    cancel: CancelToken,
}

/// A dataset with a queue of recorded actions
pub struct Pipeline<K: Key, T: Item> {
    /// Items the pipeline reads
    dataset: Dataset<K, T>,

    /// Recorded actions, applied in order to every batch
    actions: ActionQueue<K, T>,

    /// Workers for parallel item maps
    pool: WorkerPool,

    /// Named values shared by this pipeline and its clones
    variables: Variables,

    /// Run configuration stored by `run_later`
    deferred: Option<RunConfig>,

    /// State of the `next_batch` run, never shared between clones
    active: Mutex<Option<ActiveRun<K>>>,
}

impl<K: Key, T: Item> Pipeline<K, T> {
    /// An empty pipeline over `dataset`
    pub fn new(dataset: Dataset<K, T>) -> Self {
        Self {
            dataset,
            actions: ActionQueue::new(),
            pool: WorkerPool::global(),
            variables: Variables::new(),
            deferred: None,
            active: Mutex::new(None),
        }
    }

    /// The dataset this pipeline reads
    pub fn dataset(&self) -> &Dataset<K, T> {
        &self.dataset
    }

    /// The index batches are sliced from
    pub fn index(&self) -> &Index<K> {
        self.dataset.index()
    }

    /// The recorded actions
    pub fn actions(&self) -> &ActionQueue<K, T> {
        &self.actions
    }

    /// The worker pool used by parallel maps
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The pipeline variables
    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    fn derive(&self, actions: ActionQueue<K, T>) -> Self {
        Self {
            dataset: self.dataset.clone(),
            actions,
            pool: self.pool.clone(),
            variables: self.variables.clone(),
            deferred: self.deferred.clone(),
            active: Mutex::new(None),
        }
    }

    // Build surface

    /// Append an action
    #[must_use]
    pub fn append(&self, action: Action<K, T>) -> Self {
        self.derive(self.actions.then(action))
    }

    /// Append a whole-batch transformation
    #[must_use]
    pub fn transform<F>(&self, name: &str, func: F) -> Self
    where
        F: Fn(Batch<K, T>) -> anyhow::Result<Batch<K, T>> + Send + Sync + 'static,
    {
        self.append(Action::transform(name, func))
    }

    /// Append a per-item map run on the calling thread
    #[must_use]
    pub fn map<F>(&self, name: &str, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.append(Action::map(name, func))
    }

    /// Append a per-item map dispatched to the worker pool
    #[must_use]
    pub fn par_map<F>(&self, name: &str, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.append(Action::par_map(name, func))
    }

    /// Append a per-item map with an explicit execution mode
    #[must_use]
    pub fn map_with<F>(&self, name: &str, mode: ExecMode, func: F) -> Self
    where
        F: Fn(&K, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.append(Action::map_with(name, mode, func))
    }

    /// Mark the last recorded action skip-on-error
    #[must_use]
    pub fn skip_on_error(&self) -> Self {
        self.derive(self.actions.with_last(Action::skip_on_error))
    }

    /// Fan every batch out to `arms` and merge their outputs per identifier.
    ///
    /// Only identifiers present in the output of every arm survive, in the
    /// order of the incoming batch.
    #[must_use]
    pub fn branch_merge<F>(&self, name: &str, arms: Vec<ActionQueue<K, T>>, merge: F) -> Self
    where
        F: Fn(&K, Vec<T>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.append(Action::branch(name, arms, merge))
    }

    /// Join with `other`: every batch is materialized through `other` for the
    /// same identifiers and merged item by item.
    ///
    /// The returned pipeline reads only the identifiers both datasets share.
    pub fn join_with<F>(&self, other: &Self, merge: F) -> Result<Self>
    where
        F: Fn(&K, T, T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let shared = shared_index([self.index(), other.index()])?;
        debug!(shared = shared.len(), "joining pipelines");
        let mut joined = self.restrict(shared.clone())?;
        let other = other.restrict(shared)?;
        joined.actions = joined.actions.then(Action::join(other, merge));
        Ok(joined)
    }

    /// Append the handler registered under `name`
    pub fn call(&self, registry: &ActionRegistry<K, T>, name: &str, mode: ExecMode) -> Result<Self> {
        Ok(self.append(registry.action(name, mode)?))
    }

    /// Define a variable unless it already exists.
    ///
    /// The new pipeline gets its own copy of the variable table; `self` is
    /// left untouched.
    #[must_use]
    pub fn init_variable(&self, name: &str, value: Value) -> Self {
        let mut derived = self.derive(self.actions.clone());
        derived.variables = self.variables.fork();
        derived.variables.init(name, value);
        derived
    }

    /// Current value of a variable
    pub fn variable(&self, name: &str) -> Result<Value> {
        self.variables.get(name)
    }

    /// Append an action that replaces variable `name` with
    /// `update(current, batch)` for every batch
    #[must_use]
    pub fn update_variable<F>(&self, name: &str, update: F) -> Self
    where
        F: Fn(&Value, &Batch<K, T>) -> Value + Send + Sync + 'static,
    {
        self.append(Action::update_variable(name, update))
    }

    /// A pipeline with the same actions and its own copy of the variables
    #[must_use]
    pub fn branch(&self) -> Self {
        let mut forked = self.derive(self.actions.clone());
        forked.variables = self.variables.fork();
        forked
    }

    /// Run parallel maps on `pool`
    #[must_use]
    pub fn with_pool(&self, pool: WorkerPool) -> Self {
        let mut derived = self.derive(self.actions.clone());
        derived.pool = pool;
        derived
    }

    /// Store `config` for [`Pipeline::run_deferred`] and [`Pipeline::next_deferred`]
    #[must_use]
    pub fn run_later(&self, config: RunConfig) -> Self {
        let mut derived = self.derive(self.actions.clone());
        derived.deferred = Some(config);
        derived
    }

    /// The same pipeline reading a subset of its dataset
    pub fn restrict(&self, index: Index<K>) -> Result<Self> {
        let mut derived = self.derive(self.actions.clone());
        derived.dataset = self.dataset.restrict(index)?;
        Ok(derived)
    }

    // Run surface

    fn context<'a>(&'a self, cancel: &'a CancelToken) -> Context<'a> {
        Context {
            pool: &self.pool,
            variables: &self.variables,
            cancel,
        }
    }

    /// Apply the recorded actions to a caller-supplied batch
    pub fn execute_for(&self, batch: Batch<K, T>) -> Result<Batch<K, T>> {
        let cancel = CancelToken::new();
        execute(&self.actions, batch, self.context(&cancel))
    }

    /// Materialize `ids` and apply the recorded actions
    pub fn process(&self, ids: &[K], cancel: &CancelToken) -> Result<Batch<K, T>> {
        cancel.check()?;
        let batch = self.dataset.create_batch(ids)?;
        execute(&self.actions, batch, self.context(cancel))
    }

    /// Lazy stream of processed batches
    pub fn gen_batch(&self, config: &RunConfig) -> Result<BatchStream<Self>> {
        BatchStream::new(self.clone(), config)
    }

    /// Drive the pipeline to completion for its side effects.
    ///
    /// Fails with a configuration error for runs that never end on their own.
    pub fn run(&self, config: &RunConfig) -> Result<RunStats> {
        run_to_completion(self.clone(), config)
    }

    /// Pull one processed batch, keeping generator state across calls.
    ///
    /// `config` is read on the first call only; [`Pipeline::reset`] discards
    /// the state. Past the last batch every call fails with `Exhausted`.
    pub fn next_batch(&self, config: &RunConfig) -> Result<Batch<K, T>> {
        let (slice, cancel) = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_none() {
                let generator = BatchGenerator::new(self.index().clone(), config)?;
                let run_id = Uuid::new_v4();
                debug!(%run_id, batch_size = config.batch_size, "next_batch run started");
                *active = Some(ActiveRun {
                    run_id,
                    generator,
                    cancel: CancelToken::new(),
                });
            }
            let Some(run) = active.as_mut() else {
                return Err(Error::Exhausted);
            };
            match run.generator.next() {
                Some(slice) => (slice, run.cancel.clone()),
                None if run.generator.state() == GeneratorState::Cancelled => return Err(Error::Cancelled),
                None => {
                    debug!(run_id = %run.run_id, "next_batch run exhausted");
                    return Err(Error::Exhausted);
                }
            }
        };
        self.process(&slice.ids, &cancel)
    }

    /// Cancel the `next_batch` run; further calls fail with `Cancelled`
    /// until [`Pipeline::reset`]
    pub fn cancel(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = active.as_mut() {
            run.cancel.cancel();
            run.generator.cancel();
        }
    }

    /// Discard the `next_batch` run state
    pub fn reset(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// [`Pipeline::run`] with the config stored by [`Pipeline::run_later`]
    pub fn run_deferred(&self) -> Result<RunStats> {
        self.run(self.deferred_config()?)
    }

    /// [`Pipeline::next_batch`] with the config stored by [`Pipeline::run_later`]
    pub fn next_deferred(&self) -> Result<Batch<K, T>> {
        self.next_batch(self.deferred_config()?)
    }

    fn deferred_config(&self) -> Result<&RunConfig> {
        self.deferred
            .as_ref()
            .ok_or_else(|| Error::config("no run configuration stored, call run_later first"))
    }
}

impl<K: Key, T: Item> BatchProducer for Pipeline<K, T> {
    type Key = K;
    type Output = Batch<K, T>;

    fn index(&self) -> &Index<K> {
        self.dataset.index()
    }

    fn produce(&self, slice: &Slice<K>, cancel: &CancelToken) -> Result<Batch<K, T>> {
        self.process(&slice.ids, cancel)
    }

    fn output_len(output: &Batch<K, T>) -> usize {
        output.len()
    }
}

impl<K: Key, T: Item> Clone for Pipeline<K, T> {
    fn clone(&self) -> Self {
        self.derive(self.actions.clone())
    }
}

impl<K: Key, T: Item> fmt::Debug for Pipeline<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("dataset", &self.dataset)
            .field("actions", &self.actions)
            .field("pool", &self.pool)
            .field("deferred", &self.deferred)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Epochs, Shuffle};
    use anyhow::bail;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn numbers(n: u32) -> Dataset<u32, u32> {
        Dataset::from_items((0..n).map(|i| (i, i))).unwrap()
    }

    #[test]
    fn building_never_runs_anything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let base = numbers(10).pipeline();
        let pipeline = base.map("count", move |_, x| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(x)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(base.actions().is_empty());
        assert_eq!(pipeline.actions().len(), 1);

        let stats = pipeline.run(&RunConfig::new(4)).unwrap();
        assert_eq!((stats.batches, stats.items), (3, 10));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn gen_batch_yields_processed_batches() {
        let pipeline = numbers(10).pipeline().par_map("square", |_, x| Ok(x * x));
        let batches: Vec<Batch<u32, u32>> = pipeline
            .gen_batch(&RunConfig::new(4).drop_last(true))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].items(), &[16, 25, 36, 49]);
    }

    #[test]
    fn next_batch_keeps_state_until_reset() {
        let pipeline = numbers(5).pipeline();
        let config = RunConfig::new(2);
        assert_eq!(pipeline.next_batch(&config).unwrap().ids(), &[0, 1]);
        // the config is only read on the first call
        assert_eq!(pipeline.next_batch(&RunConfig::new(100)).unwrap().ids(), &[2, 3]);
        assert_eq!(pipeline.next_batch(&config).unwrap().ids(), &[4]);
        assert_eq!(pipeline.next_batch(&config), Err(Error::Exhausted));
        assert_eq!(pipeline.next_batch(&config), Err(Error::Exhausted));
        pipeline.reset();
        assert_eq!(pipeline.next_batch(&config).unwrap().ids(), &[0, 1]);
    }

    #[test]
    fn clones_do_not_share_next_batch_state() {
        let pipeline = numbers(4).pipeline();
        let config = RunConfig::new(2);
        pipeline.next_batch(&config).unwrap();
        assert_eq!(pipeline.clone().next_batch(&config).unwrap().ids(), &[0, 1]);
    }

    #[test]
    fn cancel_stops_next_batch() {
        let pipeline = numbers(4).pipeline();
        let config = RunConfig::new(1).epochs(Epochs::Unbounded);
        pipeline.next_batch(&config).unwrap();
        pipeline.cancel();
        assert_eq!(pipeline.next_batch(&config), Err(Error::Cancelled));
    }

    #[test]
    fn failing_item_surfaces_and_skip_drops_it() {
        let check = |id: &u32, x: u32| -> anyhow::Result<u32> {
            if *id == 7 {
                bail!("bad item");
            }
            Ok(x)
        };
        let dataset = Dataset::from_items([4, 7, 9, 12].map(|i| (i, i))).unwrap();
        let failing = dataset.pipeline().map("check", check);
        match failing.next_batch(&RunConfig::new(4)) {
            Err(Error::PipelineExecution { ids, position, .. }) => {
                assert_eq!(ids, vec!["7".to_string()]);
                assert_eq!(position, 0);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let skipping = failing.skip_on_error();
        let batch = skipping.next_batch(&RunConfig::new(4)).unwrap();
        assert_eq!(batch.ids(), &[4, 9, 12]);
    }

    #[test]
    fn run_rejects_unbounded_configs() {
        let pipeline = numbers(3).pipeline();
        let config = RunConfig::new(2).epochs(Epochs::Unbounded);
        assert!(matches!(pipeline.run(&config), Err(Error::Configuration(_))));
        assert!(pipeline.run(&config.n_iters(4)).is_ok());
    }

    #[test]
    fn execute_for_applies_the_queue() {
        let pipeline = numbers(0).pipeline().map("inc", |_, x| Ok(x + 1));
        let batch = Batch::from_pairs(vec![(40, 1), (41, 2)]).unwrap();
        assert_eq!(pipeline.execute_for(batch).unwrap().items(), &[2, 3]);
    }

    #[test]
    fn variables_are_updated_per_batch() {
        let pipeline = numbers(10)
            .pipeline()
            .init_variable("seen", json!(0))
            .update_variable("seen", |v, batch| json!(v.as_u64().unwrap_or(0) + batch.len() as u64));
        let forked = pipeline.branch();
        pipeline.run(&RunConfig::new(3).epochs(2)).unwrap();
        assert_eq!(pipeline.variable("seen").unwrap(), json!(20));
        assert_eq!(forked.variable("seen").unwrap(), json!(0));
        forked.run(&RunConfig::new(5)).unwrap();
        assert_eq!(forked.variable("seen").unwrap(), json!(10));
        assert_eq!(pipeline.variable("seen").unwrap(), json!(20));

        let missing = numbers(2).pipeline().update_variable("nope", |v, _| v.clone());
        assert!(matches!(missing.run(&RunConfig::new(2)), Err(Error::PipelineExecution { .. })));
    }

    #[test]
    fn registered_handlers_are_called_by_name() {
        let mut registry: ActionRegistry<u32, i64> = ActionRegistry::new();
        registry.register_map("negate", |_, x| Ok(-x));
        let dataset = Dataset::from_items((0..3u32).map(|i| (i, i64::from(i)))).unwrap();
        let pipeline = dataset.pipeline().call(&registry, "negate", ExecMode::Parallel).unwrap();
        assert_eq!(pipeline.next_batch(&RunConfig::new(3)).unwrap().items(), &[0, -1, -2]);
        assert!(matches!(
            dataset.pipeline().call(&registry, "missing", ExecMode::Sequential),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn deferred_runs_use_the_stored_config() {
        let pipeline = numbers(6).pipeline();
        assert!(matches!(pipeline.run_deferred(), Err(Error::Configuration(_))));
        let later = pipeline.run_later(RunConfig::new(4));
        assert_eq!(later.next_deferred().unwrap().len(), 4);
        assert_eq!(later.run_deferred().unwrap().batches, 2);
    }

    #[test]
    fn join_with_merges_by_identifier_over_the_intersection() {
        let left = Dataset::from_items((0..6).map(|i| (i, i))).unwrap().pipeline();
        let right = Dataset::from_items((3..9).map(|i| (i, i * 100)))
            .unwrap()
            .pipeline()
            .map("drop-four", |id: &u32, x| if *id == 4 { bail!("no") } else { Ok(x) })
            .skip_on_error();
        let joined = left.join_with(&right, |_, a, b| Ok(a + b)).unwrap();
        assert_eq!(joined.index().ids(), &[3, 4, 5]);
        let batch = joined.next_batch(&RunConfig::new(8)).unwrap();
        assert_eq!(batch.ids(), &[3, 5]);
        assert_eq!(batch.items(), &[303, 505]);

        let disjoint = Dataset::from_items((20..22).map(|i| (i, i))).unwrap().pipeline();
        assert!(matches!(
            left.join_with(&disjoint, |_, a, _| Ok(a)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn init_variable_leaves_the_receiver_untouched() {
        let base = numbers(4).pipeline();
        let with = base.init_variable("seen", json!(1));
        assert_eq!(with.variable("seen").unwrap(), json!(1));
        assert!(matches!(base.variable("seen"), Err(Error::Variable(_))));
        assert_eq!(with.init_variable("seen", json!(5)).variable("seen").unwrap(), json!(1));
    }

    #[test]
    fn skipping_join_drops_items_the_other_side_rejects() {
        crate::init_test_tracing();
        let left = Dataset::from_items((5..9).map(|i| (i, i))).unwrap().pipeline();
        let right = Dataset::from_items((5..9).map(|i| (i, i * 100)))
            .unwrap()
            .pipeline()
            .map("reject-seven", |id: &u32, x| if *id == 7 { bail!("seven") } else { Ok(x) });

        let strict = left.join_with(&right, |_, a, b| Ok(a + b)).unwrap();
        match strict.next_batch(&RunConfig::new(4)) {
            Err(Error::PipelineExecution { action, ids, .. }) => {
                assert_eq!(action, "join");
                assert_eq!(ids, vec!["7".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let skipping = left.join_with(&right, |_, a, b| Ok(a + b)).unwrap().skip_on_error();
        let batch = skipping.next_batch(&RunConfig::new(4)).unwrap();
        assert_eq!(batch.ids(), &[5, 6, 8]);
        assert_eq!(batch.items(), &[505, 606, 808]);
    }

    #[test]
    fn seeded_runs_reproduce_batches() {
        let pipeline = numbers(30).pipeline();
        let config = RunConfig::new(7).epochs(3).shuffle(Shuffle::Seeded(5));
        let ids = |p: &Pipeline<u32, u32>| -> Vec<Vec<u32>> {
            p.gen_batch(&config).unwrap().map(|b| b.unwrap().ids().to_vec()).collect()
        };
        assert_eq!(ids(&pipeline), ids(&pipeline));
    }
}
