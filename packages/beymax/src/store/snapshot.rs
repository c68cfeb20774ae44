//! Durable snapshot backends.
//!
//! The snapshot is a single MessagePack document: a map from scope name to an
//! opaque JSON-compatible value. A missing or empty file reads as an empty
//! snapshot. Writes go to a sibling temp file which is then renamed over the
//! original, so readers never observe a half-written snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use super::StoreError;

/// Scope name -> value, as persisted.
pub type Snapshot = BTreeMap<String, Value>;

/// Where the durable snapshot lives.
#[derive(Debug)]
pub(crate) enum Backend {
    /// MessagePack file on disk.
    File(PathBuf),
    /// Process-local snapshot, for tests and throwaway stores.
    Memory(Mutex<Snapshot>),
}

impl Backend {
    /// Read the durable snapshot (async).
    pub(crate) async fn read(&self) -> Result<Snapshot, StoreError> {
        match self {
            Backend::File(path) => match tokio::fs::read(path).await {
                Ok(bytes) => decode(path, &bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::new()),
                Err(e) => Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                }),
            },
            Backend::Memory(snapshot) => Ok(snapshot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }

    /// Read the durable snapshot without an async context.
    ///
    /// Used by the read-only snapshot helper, which may run from synchronous
    /// predicates.
    pub(crate) fn read_blocking(&self) -> Result<Snapshot, StoreError> {
        match self {
            Backend::File(path) => match std::fs::read(path) {
                Ok(bytes) => decode(path, &bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::new()),
                Err(e) => Err(StoreError::Io {
                    path: path.clone(),
                    source: e,
                }),
            },
            Backend::Memory(snapshot) => Ok(snapshot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()),
        }
    }

    /// Replace the durable snapshot.
    pub(crate) async fn write(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        match self {
            Backend::File(path) => {
                let bytes = rmp_serde::to_vec(snapshot).map_err(|e| StoreError::Encode {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                let tmp = temp_path(path);
                tokio::fs::write(&tmp, &bytes)
                    .await
                    .map_err(|e| StoreError::Io {
                        path: tmp.clone(),
                        source: e,
                    })?;
                tokio::fs::rename(&tmp, path)
                    .await
                    .map_err(|e| StoreError::Io {
                        path: path.clone(),
                        source: e,
                    })
            }
            Backend::Memory(current) => {
                *current.lock().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
                Ok(())
            }
        }
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        match self {
            Backend::File(path) => Some(path),
            Backend::Memory(_) => None,
        }
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Snapshot, StoreError> {
    if bytes.is_empty() {
        return Ok(Snapshot::new());
    }
    rmp_serde::from_slice(bytes).map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::File(dir.path().join("db.msgpack"));

        assert!(backend.read().await.unwrap().is_empty());
        assert!(backend.read_blocking().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        std::fs::write(&path, b"").unwrap();

        let backend = Backend::File(path);
        assert!(backend.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read_preserves_nested_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        let backend = Backend::File(path.clone());

        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "players".into(),
            json!({"u1": {"balance": 10, "tags": ["a", "b"], "ratio": 0.5}}),
        );
        snapshot.insert("core_future_dispatch".into(), json!([]));
        backend.write(&snapshot).await.unwrap();

        assert_eq!(backend.read().await.unwrap(), snapshot);
        assert_eq!(backend.read_blocking().unwrap(), snapshot);
        // Temp file is renamed away.
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.msgpack");
        std::fs::write(&path, b"\xc1\xc1\xc1").unwrap();

        let backend = Backend::File(path);
        assert!(matches!(
            backend.read().await,
            Err(StoreError::Decode { .. })
        ));
    }
}
