//! Persistence seam for device state.
//!
//! Every write is keyed by device, so coordinators sharing one store never
//! read-modify-write each other's data.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state::DeviceState;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted state for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<DeviceState>, StoreError>;

    /// Durably replace the state stored under `key`.
    async fn put(&self, key: &str, state: &DeviceState) -> Result<(), StoreError>;
}

/// Volatile store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, DeviceState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<DeviceState>, StoreError> {
        Ok(self.entries.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    async fn put(&self, key: &str, state: &DeviceState) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), state.clone());
        Ok(())
    }
}

/// One JSON document per device under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<DeviceState>, StoreError> {
        let bytes = match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn put(&self, key: &str, state: &DeviceState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let encoded = serde_json::to_vec_pretty(state)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, encoded).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}
