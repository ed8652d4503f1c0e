use std::path::{Path, PathBuf};

use scale_core::Sample;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::HistoryStore;

/// Default snapshot file, relative to the working directory.
pub const DEFAULT_HISTORY_FILE: &str = "weight_history.json";

/// History snapshot kept as one pretty-printed JSON array on disk.
/// Reads and writes are synchronous.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> Result<Vec<Sample>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no history file, starting empty");
            return Ok(Vec::new());
        }

        let content =
            std::fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let samples: Vec<Sample> = serde_json::from_str(&content)?;
        info!(path = %self.path.display(), samples = samples.len(), "history loaded");
        Ok(samples)
    }

    fn save(&self, history: &[Sample]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let json = serde_json::to_vec_pretty(history)?;
        std::fs::write(&self.path, json).map_err(|e| StoreError::io(&self.path, e))?;
        debug!(path = %self.path.display(), samples = history.len(), "history saved");
        Ok(())
    }
}
