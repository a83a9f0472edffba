//! # Epoch Iteration
//!
//! A shuffled, restartable cursor over a packed dataset. Each call to
//! [`Iterator::next`] yields the next batch; exhaustion reshuffles, rewinds the
//! cursor and ends the epoch, so the same value can be iterated again for the
//! following epoch.

use tracing::debug;

use crate::dataset::batch::{Batch, Batcher, PadTokens};
use crate::dataset::instance::{Instance, PackedInstance};
use crate::error::{LmCrfError, Result};

/// A packed dataset with its shuffle order and cursor.
///
/// The cursor is exclusive state: iterate through `&mut SeqDataset` from one
/// consumer only.
#[derive(Debug)]
pub struct SeqDataset {
    instances: Vec<PackedInstance>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    batcher: Batcher,
    rng: oorandom::Rand64,
}

impl SeqDataset {
    /// Pack `instances` and prepare a shuffled order.
    ///
    /// Every instance is validated up front, so iteration never meets an
    /// empty or malformed sequence.
    pub fn new(
        instances: Vec<Instance>,
        batcher: Batcher,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(LmCrfError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }

        let separator = batcher.pads().char_separator;
        let instances: Vec<PackedInstance> = instances
            .into_iter()
            .map(|instance| instance.pack(separator))
            .collect();
        for (position, instance) in instances.iter().enumerate() {
            instance.validate(position)?;
        }

        let mut dataset = Self {
            order: (0..instances.len()).collect(),
            instances,
            cursor: 0,
            batch_size,
            batcher,
            rng: oorandom::Rand64::new(u128::from(seed)),
        };
        dataset.shuffle();
        Ok(dataset)
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the dataset holds no instances.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of batches in one epoch.
    pub fn num_batches(&self) -> usize {
        self.instances.len().div_ceil(self.batch_size)
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Padding configuration of the underlying batcher.
    pub fn pads(&self) -> &PadTokens {
        self.batcher.pads()
    }

    /// Packed instances in load order.
    pub fn instances(&self) -> &[PackedInstance] {
        &self.instances
    }

    /// Current shuffle order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Fisher-Yates shuffle of the instance order.
    pub fn shuffle(&mut self) {
        for i in (1..self.order.len()).rev() {
            let j = self.rng.rand_range(0..(i as u64 + 1)) as usize;
            self.order.swap(i, j);
        }
    }

    fn next_batch(&mut self) -> Option<Result<Batch>> {
        if self.cursor == self.instances.len() {
            self.cursor = 0;
            self.shuffle();
            debug!(instances = self.instances.len(), "epoch exhausted, reshuffled");
            return None;
        }

        let end = (self.cursor + self.batch_size).min(self.instances.len());
        let batch: Vec<&PackedInstance> = self.order[self.cursor..end]
            .iter()
            .map(|&index| &self.instances[index])
            .collect();
        let batch = self.batcher.batch(&batch);
        self.cursor = end;

        Some(batch)
    }
}

impl Iterator for SeqDataset {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
