pub mod error;
pub mod file;
pub mod memory;

pub use error::StoreError;
pub use file::{JsonFileStore, DEFAULT_HISTORY_FILE};
pub use memory::MemoryStore;

use std::sync::Arc;

use scale_core::Sample;

/// Durable snapshot of the history window.
///
/// Every `save` is a full snapshot that replaces whatever was stored
/// before; nothing is appended.
pub trait HistoryStore: Send {
    /// Read the last snapshot. An absent snapshot is an empty history.
    fn load(&self) -> Result<Vec<Sample>, StoreError>;

    /// Replace the stored snapshot with `history`.
    fn save(&self, history: &[Sample]) -> Result<(), StoreError>;
}

impl<S: HistoryStore + Sync> HistoryStore for Arc<S> {
    fn load(&self) -> Result<Vec<Sample>, StoreError> {
        (**self).load()
    }

    fn save(&self, history: &[Sample]) -> Result<(), StoreError> {
        (**self).save(history)
    }
}
