use std::collections::VecDeque;

use crate::sample::Sample;

/// Maximum number of samples kept in memory and on disk.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Number of samples replayed to a newly connected client.
pub const DEFAULT_REPLAY_LIMIT: usize = 100;

/// Bounded FIFO window of recent samples, in insertion order.
///
/// Eviction is by insertion order, never by timestamp.
#[derive(Clone, Debug)]
pub struct HistoryBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Seed from a loaded snapshot, keeping only the newest `capacity` samples.
    pub fn from_samples(samples: Vec<Sample>, capacity: usize) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.samples = samples.into();
        buffer.evict_overflow();
        buffer
    }

    /// Push a sample and drop the oldest entries past capacity.
    /// Returns how many samples were evicted.
    pub fn append(&mut self, sample: Sample) -> usize {
        self.samples.push_back(sample);
        self.evict_overflow()
    }

    /// The last `n` samples in insertion order (fewer if the buffer is shorter).
    pub fn recent(&self, n: usize) -> Vec<Sample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).cloned().collect()
    }

    /// Contiguous view of the whole window, oldest first.
    pub fn as_slice(&mut self) -> &[Sample] {
        self.samples.make_contiguous()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_overflow(&mut self) -> usize {
        let overflow = self.samples.len().saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        overflow
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
