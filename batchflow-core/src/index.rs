//! Immutable ordered index of item identifiers

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Range;
use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::config::Shuffle;
use crate::error::{render_ids, Error, Result};
use crate::seed;

/// Identifier of an addressable item: integers, strings, tuples, ...
pub trait Key: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Selection of a subset of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector<K> {
    /// Explicit identifiers, in the given order
    Ids(Vec<K>),
    /// Positions into the index, in the given order
    Positions(Vec<usize>),
    /// A contiguous range of positions
    Range(Range<usize>),
}

/// An ordered collection of unique identifiers.
///
/// Every operation returns a new index; the receiver never changes, so
/// clones can be iterated from many threads at once.
#[derive(Debug, Clone)]
pub struct Index<K: Key> {
    /// Identifiers in positional order
    ids: Arc<[K]>,

    /// Identifier to position lookup
    positions: Arc<HashMap<K, usize>>,
}

impl<K: Key> Index<K> {
    /// Create an index, rejecting duplicate identifiers
    pub fn create<I>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = K>,
    {
        let ids: Vec<K> = ids.into_iter().collect();
        let mut positions = HashMap::with_capacity(ids.len());
        for (position, id) in ids.iter().enumerate() {
            if positions.insert(id.clone(), position).is_some() {
                return Err(Error::config(format!("duplicate identifier {id:?} in index")));
            }
        }
        Ok(Self {
            ids: ids.into(),
            positions: Arc::new(positions),
        })
    }

    /// Build from identifiers already known to be unique
    fn from_unique(ids: Vec<K>) -> Self {
        let positions = ids
            .iter()
            .enumerate()
            .map(|(position, id)| (id.clone(), position))
            .collect();
        Self {
            ids: ids.into(),
            positions: Arc::new(positions),
        }
    }

    /// Number of identifiers
    pub fn length(&self) -> usize {
        self.ids.len()
    }

    /// Number of identifiers
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index holds no identifiers
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Identifiers in positional order
    pub fn ids(&self) -> &[K] {
        &self.ids
    }

    /// Iterate over identifiers in positional order
    pub fn iter(&self) -> std::slice::Iter<'_, K> {
        self.ids.iter()
    }

    /// Identifier at `position`
    pub fn get(&self, position: usize) -> Option<&K> {
        self.ids.get(position)
    }

    /// Position of `id`
    pub fn position_of(&self, id: &K) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Whether `id` belongs to this index
    pub fn contains(&self, id: &K) -> bool {
        self.positions.contains_key(id)
    }

    /// Select a subset of this index
    pub fn subset(&self, selector: Selector<K>) -> Result<Self> {
        match selector {
            Selector::Ids(ids) => {
                if let Some(unknown) = ids.iter().find(|id| !self.contains(id)) {
                    return Err(Error::config(format!("identifier {unknown:?} is not in the index")));
                }
                Self::create(ids)
            }
            Selector::Positions(positions) => {
                let ids = positions
                    .iter()
                    .map(|&p| {
                        self.ids.get(p).cloned().ok_or_else(|| {
                            Error::config(format!("position {p} out of range for index of {}", self.len()))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Self::create(ids)
            }
            Selector::Range(range) => {
                if range.start > range.end || range.end > self.len() {
                    return Err(Error::config(format!(
                        "range {range:?} out of bounds for index of {}",
                        self.len()
                    )));
                }
                Ok(Self::from_unique(self.ids[range].to_vec()))
            }
        }
    }

    /// A permuted copy of this index.
    ///
    /// `Some(seed)` gives a reproducible permutation; `None` draws a seed from
    /// the process-wide generator.
    pub fn shuffle(&self, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(seed::fresh_seed);
        let mut ids = self.ids.to_vec();
        ids.shuffle(&mut seed::epoch_rng(seed, 0));
        Self::from_unique(ids)
    }

    /// Partition the index into groups by ratio.
    ///
    /// Group sizes are `floor(ratio * len)`. When the ratios sum to one the
    /// rounding remainder joins the last group, otherwise a trailing group
    /// receives everything left over, so the groups always cover the index.
    pub fn split(&self, ratios: &[f64], shuffle: Shuffle) -> Result<Vec<Self>> {
        if ratios.is_empty() {
            return Err(Error::config("split needs at least one ratio"));
        }
        if let Some(bad) = ratios.iter().find(|r| !r.is_finite() || **r < 0.0) {
            return Err(Error::config(format!("split ratio {bad} must be a non-negative number")));
        }
        let total: f64 = ratios.iter().sum();
        if total > 1.0 + 1e-9 {
            return Err(Error::config(format!("split ratios sum to {total}, expected at most 1")));
        }

        let order = match shuffle.resolve() {
            Some(seed) => self.shuffle(Some(seed)).ids.to_vec(),
            None => self.ids.to_vec(),
        };

        let len = order.len();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let mut sizes: Vec<usize> = ratios.iter().map(|r| (r * len as f64).floor() as usize).collect();
        let assigned: usize = sizes.iter().sum();
        let rest = len.saturating_sub(assigned);
        if (total - 1.0).abs() <= 1e-9 {
            if let Some(last) = sizes.last_mut() {
                *last += rest;
            }
        } else {
            sizes.push(rest);
        }

        let mut groups = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for size in sizes {
            groups.push(Self::from_unique(order[offset..offset + size].to_vec()));
            offset += size;
        }
        Ok(groups)
    }

    /// Cross-validation folds: `(train, test)` pairs where fold `i` tests on
    /// the `i`-th contiguous block and trains on the rest
    pub fn cv_split(&self, n_folds: usize) -> Result<Vec<(Self, Self)>> {
        if n_folds < 2 || n_folds > self.len() {
            return Err(Error::config(format!(
                "cv_split needs 2 <= n_folds <= {}, got {n_folds}",
                self.len()
            )));
        }
        let base = self.len() / n_folds;
        let extra = self.len() % n_folds;
        let mut folds = Vec::with_capacity(n_folds);
        let mut start = 0;
        for fold in 0..n_folds {
            let size = base + usize::from(fold < extra);
            let end = start + size;
            let test = self.ids[start..end].to_vec();
            let train = self.ids[..start].iter().chain(&self.ids[end..]).cloned().collect();
            folds.push((Self::from_unique(train), Self::from_unique(test)));
            start = end;
        }
        Ok(folds)
    }

    /// Identifiers present in both indexes, in receiver order
    pub fn intersect(&self, other: &Self) -> Self {
        let ids = self.ids.iter().filter(|id| other.contains(id)).cloned().collect();
        Self::from_unique(ids)
    }

    /// Whether both indexes hold the same identifiers in the same order
    pub fn same_order(&self, other: &Self) -> bool {
        self.ids == other.ids
    }

    /// Check that every identifier of `ids` is addressable
    pub fn check_members<'a, I>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a K>,
    {
        let unknown: Vec<&K> = ids.into_iter().filter(|id| !self.contains(id)).collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::Load {
                ids: render_ids(unknown),
                message: "identifiers are outside the dataset index".into(),
            })
        }
    }
}

impl Index<usize> {
    /// An index of `0..n`
    pub fn range(n: usize) -> Self {
        Self::from_unique((0..n).collect())
    }
}

impl<K: Key> PartialEq for Index<K> {
    fn eq(&self, other: &Self) -> bool {
        self.same_order(other)
    }
}

impl<K: Key> Eq for Index<K> {}

impl<'a, K: Key> IntoIterator for &'a Index<K> {
    type Item = &'a K;
    type IntoIter = std::slice::Iter<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Whether `ids` contains no duplicates
pub(crate) fn all_unique<K: Key>(ids: &[K]) -> bool {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().all(|id| seen.insert(id))
}
