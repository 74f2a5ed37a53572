use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::store::StoreEntry;

/// Where the store's state lives between processes.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn load(&self) -> Result<HashMap<String, StoreEntry>>;
    async fn persist(&self, snapshot: &HashMap<String, StoreEntry>) -> Result<()>;
}

/// Keeps the last persisted snapshot in memory. A second `Store` opened over the
/// same backend sees what the first one wrote.
#[derive(Default)]
pub struct MemoryBackend {
    snapshot: Mutex<HashMap<String, StoreEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self) -> Result<HashMap<String, StoreEntry>> {
        Ok(self.snapshot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn persist(&self, snapshot: &HashMap<String, StoreEntry>) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(())
    }
}

/// JSON snapshot on disk, replaced atomically on every write.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StoreBackend for FileBackend {
    async fn load(&self) -> Result<HashMap<String, StoreEntry>> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("No store snapshot at {:?}, starting empty", self.path);
            return Ok(HashMap::new());
        }

        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| RelayError::Storage(format!("Failed to read store snapshot: {}", e)))?;
        let entries: HashMap<String, StoreEntry> = serde_json::from_slice(&raw)
            .map_err(|e| RelayError::Encoding(format!("Corrupt store snapshot: {}", e)))?;

        debug!("Loaded {} store keys from {:?}", entries.len(), self.path);
        Ok(entries)
    }

    async fn persist(&self, snapshot: &HashMap<String, StoreEntry>) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| RelayError::Encoding(format!("Failed to encode store snapshot: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RelayError::Storage(format!("Failed to create store directory: {}", e)))?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, &encoded)
            .await
            .map_err(|e| RelayError::Storage(format!("Failed to write store snapshot: {}", e)))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| RelayError::Storage(format!("Failed to replace store snapshot: {}", e)))?;

        Ok(())
    }
}
