use parking_lot::Mutex;
use scale_core::Sample;

use crate::error::StoreError;
use crate::HistoryStore;

/// In-process store that keeps the last snapshot and counts saves (for testing).
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Vec<Sample>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if it had been saved earlier.
    pub fn with_snapshot(snapshot: Vec<Sample>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner { snapshot, saves: 0 }),
        }
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner.lock().snapshot.clone()
    }

    /// Number of `save` calls so far.
    pub fn saves(&self) -> usize {
        self.inner.lock().saves
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> Result<Vec<Sample>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, history: &[Sample]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.snapshot = history.to_vec();
        inner.saves += 1;
        Ok(())
    }
}
