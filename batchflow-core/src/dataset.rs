//! Dataset: an index bound to a batch-construction capability

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::batch::{Batch, Item};
use crate::config::Shuffle;
use crate::error::{render_ids, Error, Result};
use crate::index::{Index, Key};
use crate::pipeline::Pipeline;

/// Materializes items for a subset of identifiers
pub trait BatchLoader<K, T>: Send + Sync {
    /// Load one item per identifier, in the order given
    fn load(&self, ids: &[K]) -> Result<Vec<T>>;
}

impl<K, T, F> BatchLoader<K, T> for F
where
    F: Fn(&[K]) -> Result<Vec<T>> + Send + Sync,
{
    fn load(&self, ids: &[K]) -> Result<Vec<T>> {
        self(ids)
    }
}

/// Loader over items held in memory
struct InMemoryLoader<K, T> {
    items: HashMap<K, T>,
}

impl<K: Key, T: Item> BatchLoader<K, T> for InMemoryLoader<K, T> {
    fn load(&self, ids: &[K]) -> Result<Vec<T>> {
        ids.iter()
            .map(|id| {
                self.items.get(id).cloned().ok_or_else(|| Error::Load {
                    ids: render_ids([id]),
                    message: "no item stored for identifier".into(),
                })
            })
            .collect()
    }
}

/// A dataset: the addressable item universe (its index) plus the capability
/// to build a batch for any subset of it.
///
/// Datasets are immutable and cheap to clone; all pipelines derived from one
/// share its loader.
pub struct Dataset<K: Key, T> {
    /// The addressable identifiers
    index: Index<K>,

    /// Batch construction capability
    loader: Arc<dyn BatchLoader<K, T>>,
}

impl<K: Key, T: Item> Dataset<K, T> {
    /// Bind an index to a loader
    pub fn new<L>(index: Index<K>, loader: L) -> Self
    where
        L: BatchLoader<K, T> + 'static,
    {
        Self {
            index,
            loader: Arc::new(loader),
        }
    }

    /// Build from a raw enumeration of identifiers
    pub fn from_ids<I, L>(ids: I, loader: L) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        L: BatchLoader<K, T> + 'static,
    {
        Ok(Self::new(Index::create(ids)?, loader))
    }

    /// Build from identifiers and a loading closure
    pub fn from_fn<I, F>(ids: I, load: F) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
        F: Fn(&[K]) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        Self::from_ids(ids, load)
    }

    /// An in-memory dataset over `(id, item)` pairs, indexed in the given order
    pub fn from_items<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, T)>,
    {
        let (ids, items): (Vec<K>, Vec<T>) = pairs.into_iter().unzip();
        let index = Index::create(ids.iter().cloned())?;
        let items = ids.into_iter().zip(items).collect();
        Ok(Self::new(index, InMemoryLoader { items }))
    }

    /// The addressable identifiers
    pub fn index(&self) -> &Index<K> {
        &self.index
    }

    /// Number of addressable items
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Materialize the batch for `ids`.
    ///
    /// Every identifier must belong to the index; the loader must return
    /// exactly one item per identifier.
    pub fn create_batch(&self, ids: &[K]) -> Result<Batch<K, T>> {
        self.index.check_members(ids)?;
        let items = self.loader.load(ids).map_err(|e| match e {
            Error::Load { .. } => e,
            other => Error::Load {
                ids: render_ids(ids),
                message: other.to_string(),
            },
        })?;
        Batch::from_parts(ids.to_vec(), items)
    }

    /// The same loader bound to a subset of the index.
    ///
    /// Fails if `index` names identifiers outside this dataset: a dataset
    /// never grows its universe.
    pub fn restrict(&self, index: Index<K>) -> Result<Self> {
        if let Some(unknown) = index.iter().find(|id| !self.index.contains(id)) {
            return Err(Error::config(format!(
                "identifier {unknown:?} is outside the dataset index"
            )));
        }
        Ok(Self {
            index,
            loader: Arc::clone(&self.loader),
        })
    }

    /// Split into datasets by ratio, see [`Index::split`]
    pub fn split(&self, ratios: &[f64], shuffle: Shuffle) -> Result<Vec<Self>> {
        self.index
            .split(ratios, shuffle)?
            .into_iter()
            .map(|index| self.restrict(index))
            .collect()
    }

    /// Cross-validation folds as `(train, test)` datasets
    pub fn cv_split(&self, n_folds: usize) -> Result<Vec<(Self, Self)>> {
        self.index
            .cv_split(n_folds)?
            .into_iter()
            .map(|(train, test)| Ok((self.restrict(train)?, self.restrict(test)?)))
            .collect()
    }

    /// Restrict every dataset to the identifiers they all share.
    ///
    /// The shared identifiers keep the order of the first dataset. Fails when
    /// fewer than two datasets are given or the intersection is empty.
    pub fn intersect_all(datasets: &[Self]) -> Result<Vec<Self>> {
        let shared = shared_index(datasets.iter().map(Dataset::index))?;
        datasets.iter().map(|d| d.restrict(shared.clone())).collect()
    }

    /// Start an empty pipeline over this dataset
    pub fn pipeline(&self) -> Pipeline<K, T> {
        Pipeline::new(self.clone())
    }
}

/// Intersect indexes for a join, in the order of the first one
pub(crate) fn shared_index<'a, K, I>(indexes: I) -> Result<Index<K>>
where
    K: Key,
    I: IntoIterator<Item = &'a Index<K>>,
{
    let mut indexes = indexes.into_iter();
    let first = indexes
        .next()
        .ok_or_else(|| Error::config("a join needs at least two participants"))?;
    let mut shared = first.clone();
    let mut participants = 1;
    for index in indexes {
        shared = shared.intersect(index);
        participants += 1;
    }
    if participants < 2 {
        return Err(Error::config("a join needs at least two participants"));
    }
    if shared.is_empty() {
        return Err(Error::config("joined datasets share no identifiers"));
    }
    Ok(shared)
}

impl<K: Key, T> Clone for Dataset<K, T> {
    fn clone(&self) -> Self {
        Self {
            index: self.index.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<K: Key, T> fmt::Debug for Dataset<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset").field("len", &self.index.len()).finish_non_exhaustive()
    }
}
