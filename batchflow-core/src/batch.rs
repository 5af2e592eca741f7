//! Materialized batches of items

use std::collections::HashMap;

use crate::error::{render_ids, Error, Result};
use crate::index::{all_unique, Key};

/// Payload carried through a pipeline
pub trait Item: Clone + Send + Sync + 'static {}

impl<T> Item for T where T: Clone + Send + Sync + 'static {}

/// Items built from one index subset, together with the identifiers they
/// were built from. `ids[i]` produced `items[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<K: Key, T> {
    /// Identifiers the items were built from
    ids: Vec<K>,

    /// The items, aligned with `ids`
    items: Vec<T>,
}

impl<K: Key, T> Batch<K, T> {
    /// Create a batch from aligned identifiers and items
    pub fn from_parts(ids: Vec<K>, items: Vec<T>) -> Result<Self> {
        if ids.len() != items.len() {
            return Err(Error::Load {
                ids: render_ids(&ids),
                message: format!("{} identifiers but {} items", ids.len(), items.len()),
            });
        }
        if !all_unique(&ids) {
            return Err(Error::Load {
                ids: render_ids(&ids),
                message: "batch identifiers must be unique".into(),
            });
        }
        Ok(Self { ids, items })
    }

    /// Create a batch from `(id, item)` pairs
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, T)>,
    {
        let (ids, items) = pairs.into_iter().unzip();
        Self::from_parts(ids, items)
    }

    /// An empty batch
    pub fn empty() -> Self {
        Self {
            ids: Vec::new(),
            items: Vec::new(),
        }
    }

    /// Identifiers, aligned with the items
    pub fn ids(&self) -> &[K] {
        &self.ids
    }

    /// Items, aligned with the identifiers
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Mutable access to the items; identifiers stay fixed
    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item built from `id`
    pub fn get(&self, id: &K) -> Option<&T> {
        self.ids.iter().position(|k| k == id).map(|p| &self.items[p])
    }

    /// Iterate over `(id, item)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> {
        self.ids.iter().zip(self.items.iter())
    }

    /// Split into identifiers and items
    pub fn into_parts(self) -> (Vec<K>, Vec<T>) {
        (self.ids, self.items)
    }

    /// Consume into `(id, item)` pairs
    pub fn into_pairs(self) -> impl Iterator<Item = (K, T)> {
        self.ids.into_iter().zip(self.items)
    }

    /// Apply `f` to every item, keeping identifiers
    pub fn map_items<U, F>(self, f: F) -> Batch<K, U>
    where
        F: FnMut(T) -> U,
    {
        Batch {
            ids: self.ids,
            items: self.items.into_iter().map(f).collect(),
        }
    }

    /// Keep only the items whose identifier satisfies `keep`
    #[must_use]
    pub fn retain_ids<F>(self, mut keep: F) -> Self
    where
        F: FnMut(&K) -> bool,
    {
        let (ids, items) = self.into_pairs().filter(|(id, _)| keep(id)).unzip();
        Self { ids, items }
    }

    /// Reorder and restrict to `order`; identifiers missing from the batch
    /// are skipped
    #[must_use]
    pub fn align_to(self, order: &[K]) -> Self {
        let mut by_id: HashMap<K, T> = self.into_pairs().collect();
        let (ids, items) = order
            .iter()
            .filter_map(|id| by_id.remove(id).map(|item| (id.clone(), item)))
            .unzip();
        Self { ids, items }
    }
}

impl<K: Key, T> IntoIterator for Batch<K, T> {
    type Item = (K, T);
    type IntoIter = std::iter::Zip<std::vec::IntoIter<K>, std::vec::IntoIter<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.into_iter().zip(self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_checks_alignment() {
        assert!(Batch::from_parts(vec![1, 2], vec!["a"]).is_err());
        assert!(Batch::from_parts(vec![1, 1], vec!["a", "b"]).is_err());
        let batch = Batch::from_parts(vec![1, 2], vec!["a", "b"]).unwrap();
        assert_eq!(batch.get(&2), Some(&"b"));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn retain_and_align() {
        let batch = Batch::from_pairs(vec![(1, 'a'), (2, 'b'), (3, 'c')]).unwrap();
        let kept = batch.clone().retain_ids(|id| *id != 2);
        assert_eq!(kept.ids(), &[1, 3]);
        assert_eq!(kept.items(), &['a', 'c']);

        let aligned = batch.align_to(&[3, 9, 1]);
        assert_eq!(aligned.ids(), &[3, 1]);
        assert_eq!(aligned.items(), &['c', 'a']);
    }

    #[test]
    fn map_items_keeps_ids() {
        let batch = Batch::from_pairs(vec![(1, 2), (5, 6)]).unwrap();
        let doubled = batch.map_items(|x| x * 2);
        assert_eq!(doubled.ids(), &[1, 5]);
        assert_eq!(doubled.items(), &[4, 12]);
    }
}
