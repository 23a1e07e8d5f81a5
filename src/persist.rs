//! Flat JSON document store.
//!
//! One file per document in the data directory. Writes go to a sibling
//! temporary path and are renamed over the live path so a power loss never
//! leaves a half-written document. A missing or corrupt file reads as the
//! default value with a warning; the node does not refuse to start.

use std::fs;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Persisted peer list document (`loadsharing_peers.json`).
pub const PEERS_DOC: &str = "loadsharing_peers.json";
/// Persisted group config document (`loadsharing_config.json`).
pub const CONFIG_DOC: &str = "loadsharing_config.json";

#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Load a document, falling back to the default on a missing or
    /// corrupt file.
    pub fn load<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let path = self.path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
            Err(e) => {
                tracing::warn!("failed to read {}: {}, starting empty", path.display(), e);
                return T::default();
            }
        };

        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("corrupt document {}: {}, starting empty", path.display(), e);
                T::default()
            }
        }
    }

    /// Atomically replace a document: write a sibling temp file, then
    /// rename it over the live path.
    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let text = serde_json::to_string_pretty(value)?;
        fs::write(&tmp, text)
            .map_err(|e| Error::Persist(format!("write {}: {}", tmp.display(), e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::Persist(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }
}
