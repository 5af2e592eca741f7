//! Lockstep iteration of several pipelines over a shared key space
//!
//! A [`JoinedPipeline`] drives all of its participants from a single batch
//! generator, so slice `i` names the same identifiers in every participant.
//! Participants whose datasets differ are restricted up front to the
//! identifiers they all share.

use std::collections::HashSet;

use tracing::{debug, trace};

use crate::batch::{Batch, Item};
use crate::config::RunConfig;
use crate::dataset::shared_index;
use crate::error::Result;
use crate::generator::Slice;
use crate::index::{Index, Key};
use crate::pipeline::Pipeline;
use crate::schedule::{run_to_completion, BatchProducer, BatchStream, CancelToken, RunStats};

/// One slice materialized by every participant of a join
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedBatch<K: Key, T> {
    ids: Vec<K>,
    parts: Vec<Batch<K, T>>,
}

impl<K: Key, T> JoinedBatch<K, T> {
    /// Identifiers present in every sub-batch, in slice order
    pub fn ids(&self) -> &[K] {
        &self.ids
    }

    /// Sub-batches in participant order; `parts()[p].ids() == ids()` for every `p`
    pub fn parts(&self) -> &[Batch<K, T>] {
        &self.parts
    }

    /// The sub-batch of participant `p`
    pub fn part(&self, p: usize) -> Option<&Batch<K, T>> {
        self.parts.get(p)
    }

    /// Number of aligned identifiers
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether no identifier survived in every participant
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Take the sub-batches
    pub fn into_parts(self) -> Vec<Batch<K, T>> {
        self.parts
    }
}

/// Pipelines advanced in lockstep over the identifiers they share
#[derive(Debug, Clone)]
pub struct JoinedPipeline<K: Key, T: Item> {
    index: Index<K>,
    participants: Vec<Pipeline<K, T>>,
}

impl<K: Key, T: Item> JoinedPipeline<K, T> {
    /// Join `pipelines`, restricting each to the shared identifiers.
    ///
    /// Fails with a configuration error for fewer than two pipelines or an
    /// empty intersection. The shared identifiers keep the order of the
    /// first pipeline.
    pub fn new(pipelines: Vec<Pipeline<K, T>>) -> Result<Self> {
        let index = shared_index(pipelines.iter().map(Pipeline::index))?;
        let participants = pipelines
            .iter()
            .map(|p| p.restrict(index.clone()))
            .collect::<Result<Vec<_>>>()?;
        debug!(participants = participants.len(), shared = index.len(), "pipelines joined");
        Ok(Self { index, participants })
    }

    /// The shared identifiers
    pub fn index(&self) -> &Index<K> {
        &self.index
    }

    /// The restricted participants, in join order
    pub fn participants(&self) -> &[Pipeline<K, T>] {
        &self.participants
    }

    /// Lazy stream of joined batches
    pub fn gen_batch(&self, config: &RunConfig) -> Result<BatchStream<Self>> {
        BatchStream::new(self.clone(), config)
    }

    /// Drive every participant to completion for side effects
    pub fn run(&self, config: &RunConfig) -> Result<RunStats> {
        run_to_completion(self.clone(), config)
    }

    /// Materialize `ids` through every participant and align the results.
    ///
    /// Identifiers dropped by one participant are removed from all
    /// sub-batches.
    pub fn process(&self, ids: &[K], cancel: &CancelToken) -> Result<JoinedBatch<K, T>> {
        let parts = self
            .participants
            .iter()
            .map(|p| p.process(ids, cancel))
            .collect::<Result<Vec<_>>>()?;
        let present: Vec<HashSet<&K>> = parts.iter().map(|part| part.ids().iter().collect()).collect();
        let ids: Vec<K> = ids
            .iter()
            .filter(|id| present.iter().all(|part| part.contains(id)))
            .cloned()
            .collect();
        if parts.iter().any(|part| part.len() != ids.len()) {
            trace!(kept = ids.len(), "aligning joined sub-batches");
        }
        let parts = parts.into_iter().map(|part| part.align_to(&ids)).collect();
        Ok(JoinedBatch { ids, parts })
    }
}

impl<K: Key, T: Item> BatchProducer for JoinedPipeline<K, T> {
    type Key = K;
    type Output = JoinedBatch<K, T>;

    fn index(&self) -> &Index<K> {
        &self.index
    }

    fn produce(&self, slice: &Slice<K>, cancel: &CancelToken) -> Result<JoinedBatch<K, T>> {
        self.process(&slice.ids, cancel)
    }

    fn output_len(output: &JoinedBatch<K, T>) -> usize {
        output.len()
    }
}
