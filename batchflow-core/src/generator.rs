//! Lazy batch generation over epochs
//!
//! A [`BatchGenerator`] walks an [`Index`] in slices of `batch_size`
//! identifiers. Each epoch is sliced independently: a short final slice is
//! emitted (or dropped with `drop_last`) and never carried into the next
//! epoch. With shuffling, every epoch draws a fresh permutation derived from
//! one base seed, so a seeded run reproduces the whole multi-epoch sequence.

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::config::{Epochs, RunConfig};
use crate::error::Result;
use crate::index::{Index, Key};
use crate::seed;

/// One emission of a batch generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice<K> {
    /// Emission order, starting at 0
    pub seq: u64,

    /// Epoch the slice belongs to, starting at 0
    pub epoch: usize,

    /// Identifiers of the slice
    pub ids: Vec<K>,
}

impl<K> Slice<K> {
    /// Number of identifiers in the slice
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the slice is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Lifecycle of a generator invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, nothing emitted yet
    Idle,
    /// At least one slice emitted, more may follow
    Emitting,
    /// Every requested slice has been emitted
    Exhausted,
    /// Stopped by the consumer
    Cancelled,
}

/// Per-invocation cursor over epochs
#[derive(Debug, Clone)]
struct EpochCursor<K> {
    /// Current epoch
    epoch: usize,

    /// Offset into the current epoch's ordering
    offset: usize,

    /// Ordering of the current epoch
    order: Vec<K>,
}

/// Lazy, non-rewindable sequence of index slices
#[derive(Debug)]
pub struct BatchGenerator<K: Key> {
    index: Index<K>,
    batch_size: usize,
    epochs: Epochs,
    n_iters: Option<usize>,
    drop_last: bool,
    base_seed: Option<u64>,
    cursor: Option<EpochCursor<K>>,
    emitted: u64,
    state: GeneratorState,
}

impl<K: Key> BatchGenerator<K> {
    /// Create a generator, validating the config against the index
    pub fn new(index: Index<K>, config: &RunConfig) -> Result<Self> {
        config.validate(index.len())?;
        Ok(Self {
            batch_size: config.batch_size,
            epochs: config.epochs,
            n_iters: config.n_iters,
            drop_last: config.drop_last,
            base_seed: config.shuffle.resolve(),
            index,
            cursor: None,
            emitted: 0,
            state: GeneratorState::Idle,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// Number of slices emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Current epoch, if emission has started
    pub fn epoch(&self) -> Option<usize> {
        self.cursor.as_ref().map(|c| c.epoch)
    }

    /// Base seed used for per-epoch permutations, if shuffling
    pub fn base_seed(&self) -> Option<u64> {
        self.base_seed
    }

    /// The index being sliced
    pub fn index(&self) -> &Index<K> {
        &self.index
    }

    /// Number of slices one epoch yields
    pub fn slices_per_epoch(&self) -> usize {
        let len = self.index.len();
        if self.drop_last {
            len / self.batch_size
        } else {
            len.div_ceil(self.batch_size)
        }
    }

    /// Total number of slices this generator will emit, if finite.
    ///
    /// `n_iters` replaces the epoch budget when set.
    pub fn total_slices(&self) -> Option<u64> {
        let per_epoch = self.slices_per_epoch() as u64;
        if per_epoch == 0 {
            return Some(0);
        }
        match (self.n_iters, self.epochs) {
            (Some(n), _) => Some(n as u64),
            (None, Epochs::Finite(n)) => Some(per_epoch * n as u64),
            (None, Epochs::Unbounded) => None,
        }
    }

    /// Stop emitting; subsequent calls return `None`
    pub fn cancel(&mut self) {
        if self.state != GeneratorState::Exhausted {
            debug!(emitted = self.emitted, "batch generator cancelled");
            self.state = GeneratorState::Cancelled;
        }
    }

    fn epoch_order(&self, epoch: usize) -> Vec<K> {
        let mut order = self.index.ids().to_vec();
        if let Some(seed) = self.base_seed {
            order.shuffle(&mut seed::epoch_rng(seed, epoch));
        }
        order
    }

    fn epoch_allowed(&self, epoch: usize) -> bool {
        match (self.n_iters, self.epochs) {
            (Some(_), _) | (None, Epochs::Unbounded) => true,
            (None, Epochs::Finite(n)) => epoch < n,
        }
    }

    fn finish(&mut self) -> Option<Slice<K>> {
        if self.state != GeneratorState::Exhausted {
            debug!(emitted = self.emitted, "batch generator exhausted");
        }
        self.state = GeneratorState::Exhausted;
        self.cursor = None;
        None
    }
}

impl<K: Key> Iterator for BatchGenerator<K> {
    type Item = Slice<K>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            GeneratorState::Exhausted | GeneratorState::Cancelled => return None,
            GeneratorState::Idle => self.state = GeneratorState::Emitting,
            GeneratorState::Emitting => {}
        }

        if self.n_iters.is_some_and(|n| self.emitted >= n as u64) {
            return self.finish();
        }
        // An epoch that yields nothing would spin forever.
        if self.slices_per_epoch() == 0 {
            return self.finish();
        }

        let mut cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => EpochCursor {
                epoch: 0,
                offset: 0,
                order: self.epoch_order(0),
            },
        };

        let remaining = cursor.order.len() - cursor.offset;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            let epoch = cursor.epoch + 1;
            if !self.epoch_allowed(epoch) {
                return self.finish();
            }
            trace!(epoch, "starting epoch");
            cursor = EpochCursor {
                epoch,
                offset: 0,
                order: self.epoch_order(epoch),
            };
        }

        let end = (cursor.offset + self.batch_size).min(cursor.order.len());
        let slice = Slice {
            seq: self.emitted,
            epoch: cursor.epoch,
            ids: cursor.order[cursor.offset..end].to_vec(),
        };
        cursor.offset = end;
        self.cursor = Some(cursor);
        self.emitted += 1;
        Some(slice)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.state {
            GeneratorState::Exhausted | GeneratorState::Cancelled => (0, Some(0)),
            _ => match self.total_slices() {
                Some(total) => {
                    let left = usize::try_from(total.saturating_sub(self.emitted)).unwrap_or(usize::MAX);
                    (left, Some(left))
                }
                None => (0, None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Shuffle;
    use proptest::prelude::*;
    use test_case::test_case;

    fn lengths(index: Index<usize>, config: &RunConfig) -> Vec<usize> {
        BatchGenerator::new(index, config).unwrap().map(|s| s.len()).collect()
    }

    #[test_case(false, &[4, 4, 2] ; "keeps the short slice")]
    #[test_case(true, &[4, 4] ; "drops the short slice")]
    fn ten_items_in_fours(drop_last: bool, expected: &[usize]) {
        let config = RunConfig::new(4).drop_last(drop_last);
        assert_eq!(lengths(Index::range(10), &config), expected);
    }

    #[test]
    fn epochs_are_sliced_independently() {
        let config = RunConfig::new(4).epochs(2);
        assert_eq!(lengths(Index::range(10), &config), vec![4, 4, 2, 4, 4, 2]);

        let config = RunConfig::new(4).epochs(2).drop_last(true);
        assert_eq!(lengths(Index::range(10), &config), vec![4, 4, 4, 4]);
    }

    #[test]
    fn state_machine_transitions() {
        crate::init_test_tracing();
        let mut generator = BatchGenerator::new(Index::range(3), &RunConfig::new(2)).unwrap();
        assert_eq!(generator.state(), GeneratorState::Idle);
        assert_eq!(generator.next().map(|s| s.ids), Some(vec![0, 1]));
        assert_eq!(generator.state(), GeneratorState::Emitting);
        assert_eq!(generator.next().map(|s| s.ids), Some(vec![2]));
        assert!(generator.next().is_none());
        assert_eq!(generator.state(), GeneratorState::Exhausted);
        assert!(generator.next().is_none());
    }

    #[test]
    fn unbounded_runs_until_cancelled() {
        let config = RunConfig::new(3).epochs(Epochs::Unbounded);
        let mut generator = BatchGenerator::new(Index::range(5), &config).unwrap();
        let first: Vec<Slice<usize>> = generator.by_ref().take(7).collect();
        assert_eq!(first.last().map(|s| s.epoch), Some(3));
        generator.cancel();
        assert_eq!(generator.state(), GeneratorState::Cancelled);
        assert!(generator.next().is_none());
    }

    #[test]
    fn n_iters_caps_emission() {
        let config = RunConfig::new(2).epochs(Epochs::Unbounded).n_iters(5);
        let generator = BatchGenerator::new(Index::range(3), &config).unwrap();
        assert_eq!(generator.total_slices(), Some(5));
        assert_eq!(generator.count(), 5);
    }

    #[test]
    fn n_iters_runs_past_the_epoch_budget() {
        let config = RunConfig::new(4).n_iters(5);
        let generator = BatchGenerator::new(Index::range(10), &config).unwrap();
        assert_eq!(generator.total_slices(), Some(5));
        let slices: Vec<(usize, usize)> = generator.map(|s| (s.epoch, s.len())).collect();
        assert_eq!(slices, vec![(0, 4), (0, 4), (0, 2), (1, 4), (1, 4)]);
    }

    #[test]
    fn n_iters_can_stop_inside_the_first_epoch() {
        let config = RunConfig::new(4).epochs(3).n_iters(2);
        assert_eq!(lengths(Index::range(10), &config), vec![4, 4]);
    }

    #[test]
    fn sequence_numbers_are_consecutive() {
        let config = RunConfig::new(3).epochs(3);
        let seqs: Vec<u64> = BatchGenerator::new(Index::range(7), &config).unwrap().map(|s| s.seq).collect();
        assert_eq!(seqs, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn reshuffles_every_epoch() {
        let config = RunConfig::new(100).epochs(2).shuffle(Shuffle::Seeded(11));
        let slices: Vec<Slice<usize>> = BatchGenerator::new(Index::range(100), &config).unwrap().collect();
        assert_eq!(slices.len(), 2);
        assert_ne!(slices[0].ids, slices[1].ids);
    }

    #[test]
    fn empty_index_is_exhausted_immediately() {
        let mut generator = BatchGenerator::new(Index::range(0), &RunConfig::new(4)).unwrap();
        assert!(generator.next().is_none());
        assert_eq!(generator.state(), GeneratorState::Exhausted);
    }

    proptest! {
        #[test]
        fn one_epoch_covers_the_index(n in 0usize..300, batch_size in 1usize..40) {
            let config = RunConfig::new(batch_size);
            let total: usize = lengths(Index::range(n), &config).iter().sum();
            prop_assert_eq!(total, n);
        }

        #[test]
        fn seeded_runs_reproduce(n in 1usize..200, batch_size in 1usize..20, seed in any::<u64>()) {
            let config = RunConfig::new(batch_size).epochs(3).shuffle(Shuffle::Seeded(seed));
            let a: Vec<Vec<usize>> = BatchGenerator::new(Index::range(n), &config).unwrap().map(|s| s.ids).collect();
            let b: Vec<Vec<usize>> = BatchGenerator::new(Index::range(n), &config).unwrap().map(|s| s.ids).collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn unshuffled_runs_are_deterministic(n in 0usize..200, batch_size in 1usize..20) {
            let config = RunConfig::new(batch_size).epochs(2);
            let a: Vec<Vec<usize>> = BatchGenerator::new(Index::range(n), &config).unwrap().map(|s| s.ids).collect();
            let b: Vec<Vec<usize>> = BatchGenerator::new(Index::range(n), &config).unwrap().map(|s| s.ids).collect();
            prop_assert_eq!(&a, &b);
            let flat: Vec<usize> = a.into_iter().flatten().take(n).collect();
            prop_assert_eq!(flat, (0..n).collect::<Vec<_>>());
        }
    }
}
