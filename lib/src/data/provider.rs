use std::{
  collections::VecDeque,
  sync::{Arc, Mutex},
};

use rand::{rngs::StdRng, seq::SliceRandom};

use crate::{
  error::{Error, Result},
  tensor::Tensor,
};

use super::Columns;

/// Source of examples for one placeholder.
pub trait InputProvider: Send {
  fn next_example(&mut self) -> Result<Tensor>;

  fn next_batch(&mut self, size: usize) -> Result<Vec<Tensor>> {
    (0..size).map(|_| self.next_example()).collect()
  }
}

/// Shuffled order over a partition, shared by the providers of all its columns.
///
/// Each provider keeps its own read count. Indices drawn by the provider that
/// is furthest ahead stay in `history` until every provider has consumed them,
/// so the k-th read of every column lands on the same dataset index.
#[derive(Debug)]
struct ShuffleCursor {
  order: Vec<usize>,
  position: usize,
  rng: StdRng,
  history: VecDeque<usize>,
  /// Absolute read number of `history[0]`.
  base: u64,
  reads: Vec<Option<u64>>,
}

impl ShuffleCursor {
  fn draw(&mut self) -> usize {
    if self.position == self.order.len() {
      self.order.shuffle(&mut self.rng);
      self.position = 0;
    }
    let index = self.order[self.position];
    self.position += 1;
    index
  }

  fn next_index(&mut self, provider: usize) -> usize {
    let read = self.reads[provider].unwrap_or(0);
    let offset = (read - self.base) as usize;
    let index = match self.history.get(offset) {
      Some(&index) => index,
      None => {
        let index = self.draw();
        self.history.push_back(index);
        index
      }
    };
    self.reads[provider] = Some(read + 1);
    self.trim();
    index
  }

  fn trim(&mut self) {
    let Some(slowest) = self.reads.iter().flatten().min().copied() else {
      self.history.clear();
      return;
    };
    while self.base < slowest && self.history.pop_front().is_some() {
      self.base += 1;
    }
  }
}

/// Builds aligned, shuffled providers over the columns of one partition.
pub struct ShuffledInputProviderBuilder {
  columns: Vec<Arc<Vec<Tensor>>>,
  cursor: Arc<Mutex<ShuffleCursor>>,
}

impl ShuffledInputProviderBuilder {
  pub fn new(columns: Columns, mut rng: StdRng) -> Result<Self> {
    let len = columns.first().map(Vec::len).unwrap_or(0);
    if len == 0 {
      return Err(Error::Dataset("cannot provide examples from an empty partition".into()));
    }
    if columns.iter().any(|c| c.len() != len) {
      return Err(Error::Dataset("partition columns differ in length".into()));
    }
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut rng);
    let cursor = ShuffleCursor {
      order,
      position: 0,
      rng,
      history: VecDeque::new(),
      base: 0,
      reads: Vec::new(),
    };
    Ok(Self {
      columns: columns.into_iter().map(Arc::new).collect(),
      cursor: Arc::new(Mutex::new(cursor)),
    })
  }

  /// One provider per column, in column order.
  pub fn providers(&self) -> Result<Vec<ShuffledInputProvider>> {
    let mut cursor = self
      .cursor
      .lock()
      .map_err(|_| Error::Dataset("shuffle cursor lock poisoned".into()))?;
    let base = cursor.base;
    Ok(
      self
        .columns
        .iter()
        .map(|column| {
          cursor.reads.push(Some(base));
          ShuffledInputProvider {
            id: cursor.reads.len() - 1,
            column: Arc::clone(column),
            cursor: Arc::clone(&self.cursor),
          }
        })
        .collect(),
    )
  }
}

/// Yields the examples of one column without replacement, reshuffling once the
/// partition is exhausted.
pub struct ShuffledInputProvider {
  id: usize,
  column: Arc<Vec<Tensor>>,
  cursor: Arc<Mutex<ShuffleCursor>>,
}

impl InputProvider for ShuffledInputProvider {
  fn next_example(&mut self) -> Result<Tensor> {
    let index = self
      .cursor
      .lock()
      .map_err(|_| Error::Dataset("shuffle cursor lock poisoned".into()))?
      .next_index(self.id);
    self
      .column
      .get(index)
      .cloned()
      .ok_or_else(|| Error::Dataset(format!("example {index} out of range")))
  }
}

impl Drop for ShuffledInputProvider {
  fn drop(&mut self) {
    if let Ok(mut cursor) = self.cursor.lock() {
      cursor.reads[self.id] = None;
      cursor.trim();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;

  use proptest::prelude::*;
  use rand::SeedableRng;

  use super::*;

  fn ids(n: usize) -> Vec<Tensor> {
    (0..n).map(|i| Tensor::scalar(i as f32)).collect()
  }

  fn single(n: usize, seed: u64) -> ShuffledInputProvider {
    let builder = ShuffledInputProviderBuilder::new(vec![ids(n)], StdRng::seed_from_u64(seed)).unwrap();
    builder.providers().unwrap().remove(0)
  }

  proptest! {
    #[test]
    fn batches_never_repeat_within_an_epoch(n in 1usize..64, batch in 1usize..64, seed in any::<u64>()) {
      let batch = batch.min(n);
      let mut provider = single(n, seed);
      let drawn = provider.next_batch(batch).unwrap();
      prop_assert_eq!(drawn.len(), batch);
      let distinct: HashSet<u32> = drawn.iter().map(|t| t.item() as u32).collect();
      prop_assert_eq!(distinct.len(), batch);
    }

    #[test]
    fn every_epoch_is_a_permutation(n in 1usize..40, seed in any::<u64>()) {
      let mut provider = single(n, seed);
      for _ in 0..3 {
        let mut epoch: Vec<u32> = provider.next_batch(n).unwrap().iter().map(|t| t.item() as u32).collect();
        epoch.sort_unstable();
        prop_assert_eq!(epoch, (0..n as u32).collect::<Vec<_>>());
      }
    }

    #[test]
    fn providers_stay_aligned(n in 1usize..30, lead in 0usize..50, seed in any::<u64>()) {
      let builder = ShuffledInputProviderBuilder::new(vec![ids(n), ids(n)], StdRng::seed_from_u64(seed)).unwrap();
      let mut providers = builder.providers().unwrap();
      let mut b = providers.pop().unwrap();
      let mut a = providers.pop().unwrap();
      let ahead = a.next_batch(lead).unwrap();
      let behind = b.next_batch(lead).unwrap();
      prop_assert_eq!(&ahead, &behind);
      for _ in 0..n {
        prop_assert_eq!(a.next_example().unwrap(), b.next_example().unwrap());
      }
    }
  }

  #[test]
  fn dropped_provider_no_longer_holds_history() {
    let builder = ShuffledInputProviderBuilder::new(vec![ids(10), ids(10)], StdRng::seed_from_u64(1)).unwrap();
    let mut providers = builder.providers().unwrap();
    let lagging = providers.pop().unwrap();
    let mut leader = providers.pop().unwrap();
    leader.next_batch(25).unwrap();
    assert_eq!(builder.cursor.lock().unwrap().history.len(), 25);
    drop(lagging);
    assert!(builder.cursor.lock().unwrap().history.is_empty());
  }

  #[test]
  fn empty_or_ragged_partitions_are_rejected() {
    let rng = || StdRng::seed_from_u64(0);
    assert!(ShuffledInputProviderBuilder::new(vec![], rng()).is_err());
    assert!(ShuffledInputProviderBuilder::new(vec![vec![]], rng()).is_err());
    assert!(ShuffledInputProviderBuilder::new(vec![ids(3), ids(2)], rng()).is_err());
  }
}
