//! Named state blobs: the load/save capability behind the rule and entity stores.
//!
//! Blobs are JSON documents stored under versioned keys (`v1/<name>`). The sled
//! backend keeps them in a single `state` tree; the memory backend is used by tests
//! and by agents that run without a data directory.

use crate::error::{VigilError, VigilResult};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Layout version baked into every blob key.
pub const BLOB_VERSION: u32 = 1;

const STATE_TREE: &str = "state";

/// Storage key for a blob name.
pub fn blob_key(name: &str) -> String {
    format!("v{}/{}", BLOB_VERSION, name)
}

/// Load/save capability for named state blobs.
pub trait StateBackend: Send + Sync {
    /// Returns `Ok(None)` when the blob was never saved.
    fn load(&self, name: &str) -> VigilResult<Option<Vec<u8>>>;

    fn save(&self, name: &str, blob: &[u8]) -> VigilResult<()>;
}

/// Deserialize a blob, treating a missing blob as `None`.
pub fn load_json<T: DeserializeOwned>(backend: &dyn StateBackend, name: &str) -> VigilResult<Option<T>> {
    match backend.load(name)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn save_json<T: Serialize>(backend: &dyn StateBackend, name: &str, value: &T) -> VigilResult<()> {
    let bytes = serde_json::to_vec(value)?;
    backend.save(name, &bytes)
}

/// Sled-backed blob store. Every save is flushed before returning.
pub struct SledBackend {
    tree: sled::Tree,
}

impl SledBackend {
    /// Opens (or creates) the state database at `path`.
    pub fn open_path(path: &Path) -> VigilResult<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree(STATE_TREE)?;
        Ok(Self { tree })
    }
}

impl StateBackend for SledBackend {
    fn load(&self, name: &str) -> VigilResult<Option<Vec<u8>>> {
        Ok(self.tree.get(blob_key(name).as_bytes())?.map(|v| v.to_vec()))
    }

    fn save(&self, name: &str, blob: &[u8]) -> VigilResult<()> {
        self.tree.insert(blob_key(name).as_bytes(), blob)?;
        self.tree
            .flush()
            .map_err(|e| VigilError::Persistence(format!("flush {}: {}", name, e)))?;
        Ok(())
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a blob named `name` has been saved.
    pub fn contains(&self, name: &str) -> bool {
        self.blobs.contains_key(&blob_key(name))
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self, name: &str) -> VigilResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(&blob_key(name)).map(|v| v.value().clone()))
    }

    fn save(&self, name: &str, blob: &[u8]) -> VigilResult<()> {
        self.blobs.insert(blob_key(name), blob.to_vec());
        Ok(())
    }
}
