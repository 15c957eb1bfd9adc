//! Persistence collaborators.
//!
//! The engine treats storage as an external collaborator behind the
//! [`PersistenceBackend`] trait: one JSON document per key. The file backend
//! writes through a temp file followed by an atomic rename so a crash can
//! never leave a half-written snapshot behind. Failures here affect
//! durability only, never in-memory correctness.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::error::EngineError;

/// Key-value store for serialized state trees.
pub trait PersistenceBackend: Send + Sync {
    /// Write the document under `key`.
    fn save(&self, key: &str, blob: &Value) -> Result<(), EngineError>;

    /// Read the document under `key`, `None` if absent.
    fn load(&self, key: &str) -> Result<Option<Value>, EngineError>;

    /// List stored keys.
    fn list_keys(&self) -> Result<Vec<String>, EngineError>;

    /// Delete the document under `key`. Absent keys are fine.
    fn remove(&self, key: &str) -> Result<(), EngineError>;
}

/// Save with retries and doubling backoff, logging each failed attempt.
///
/// Runs inside the offloaded writer task, so the backoff sleeps never touch
/// the dispatch worker.
pub async fn save_with_retry(
    backend: &dyn PersistenceBackend,
    key: &str,
    blob: &Value,
    attempts: u32,
) -> Result<(), EngineError> {
    let mut delay = Duration::from_millis(50);
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match backend.save(key, blob) {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(key, attempt, "snapshot saved after retry");
                }
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(key, attempt, error = %err, "snapshot save failed");
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::persistence(key, "no attempts made")))
}

/// File-per-key backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Create a backend storing `<root>/<key>.json` documents.
    ///
    /// The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, EngineError> {
        // Keys become file names; separators would escape the root.
        if key.is_empty() || key.contains(['/', '\\', '.']) {
            return Err(EngineError::persistence(key, "key must be a bare name"));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl PersistenceBackend for FileBackend {
    fn save(&self, key: &str, blob: &Value) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.root)
            .map_err(|e| EngineError::persistence(key, e.to_string()))?;

        let json = serde_json::to_vec_pretty(blob)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| EngineError::persistence(key, e.to_string()))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.flush())
            .map_err(|e| EngineError::persistence(key, e.to_string()))?;
        // Atomic on the same filesystem: readers see the old or the new
        // document, never a partial write.
        tmp.persist(&path)
            .map_err(|e| EngineError::persistence(key, e.to_string()))?;

        tracing::debug!(key, path = %path.display(), bytes = json.len(), "snapshot written");
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let path = self.path_for(key)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::persistence(key, e.to_string())),
        };
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn list_keys(&self) -> Result<Vec<String>, EngineError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::persistence("<root>", e.to_string())),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::persistence("<root>", e.to_string()))?;
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<(), EngineError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::persistence(key, e.to_string())),
        }
    }
}

/// In-memory backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn save(&self, key: &str, blob: &Value) -> Result<(), EngineError> {
        self.documents
            .lock()
            .map_err(|_| EngineError::persistence(key, "lock poisoned"))?
            .insert(key.to_string(), blob.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>, EngineError> {
        Ok(self
            .documents
            .lock()
            .map_err(|_| EngineError::persistence(key, "lock poisoned"))?
            .get(key)
            .cloned())
    }

    fn list_keys(&self) -> Result<Vec<String>, EngineError> {
        let mut keys: Vec<String> = self
            .documents
            .lock()
            .map_err(|_| EngineError::persistence("<root>", "lock poisoned"))?
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<(), EngineError> {
        self.documents
            .lock()
            .map_err(|_| EngineError::persistence(key, "lock poisoned"))?
            .remove(key);
        Ok(())
    }
}
