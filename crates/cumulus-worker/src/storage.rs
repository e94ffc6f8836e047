// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload store interface and backends.
//!
//! The engine reads function code and task input through a narrow
//! get/put interface and writes call status records through the same one.
//! Keys are `/`-separated relative paths.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Errors from payload store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// No object exists under the key.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The key is not a valid relative path.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Requested byte range lies outside the object.
    #[error("Range {start}..{end} out of bounds for {key} ({len} bytes)")]
    RangeOutOfBounds {
        /// Object key.
        key: String,
        /// Range start (inclusive).
        start: u64,
        /// Range end (exclusive).
        end: u64,
        /// Object length.
        len: u64,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Object store used for payloads and call status records.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read a whole object.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Write an object, replacing any previous content.
    async fn put(&self, key: &str, body: Bytes) -> Result<()>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Read the byte range `start..end` of an object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let body = self.get(key).await?;
        slice_range(key, &body, start, end)
    }
}

/// Slice `start..end` out of an already loaded object.
pub fn slice_range(key: &str, body: &Bytes, start: u64, end: u64) -> Result<Bytes> {
    let len = body.len() as u64;
    if start > end || end > len {
        return Err(StorageError::RangeOutOfBounds {
            key: key.to_string(),
            start,
            end,
            len,
        });
    }
    Ok(body.slice(start as usize..end as usize))
}

/// Store backed by a directory on the local filesystem.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(body) => Ok(Bytes::from(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write to a unique sibling temp file first so readers never see a partial object
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let tmp = path.with_file_name(format!(
            ".{}.{}.partial",
            file_name,
            Uuid::new_v4().simple()
        ));
        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(key = %key, bytes = body.len(), "Stored object");
        Ok(())
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let path = self.path_for(key)?;
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let len = file.metadata().await?.len();
        if start > end || end > len {
            return Err(StorageError::RangeOutOfBounds {
                key: key.to_string(),
                start,
                end,
                len,
            });
        }

        file.seek(SeekFrom::Start(start)).await?;
        let mut body = vec![0u8; (end - start) as usize];
        file.read_exact(&mut body).await?;
        Ok(Bytes::from(body))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// List stored keys starting with `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<()> {
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_put_get() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store
            .put("jobs/abc/func.bin", Bytes::from_static(b"code"))
            .await
            .unwrap();

        let body = store.get("jobs/abc/func.bin").await.unwrap();
        assert_eq!(&body[..], b"code");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("jobs/abc"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("func.bin")]);
    }

    #[tokio::test]
    async fn test_local_store_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(k) if k == "nope"));
    }

    #[tokio::test]
    async fn test_local_store_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());

        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("/etc/passwd").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_get_range() {
        let store = MemoryObjectStore::new();
        store
            .put("data", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let part = store.get_range("data", 2, 5).await.unwrap();
        assert_eq!(&part[..], b"234");

        let err = store.get_range("data", 8, 12).await.unwrap_err();
        assert!(matches!(err, StorageError::RangeOutOfBounds { len: 10, .. }));
    }

    #[tokio::test]
    async fn test_local_store_ranged_read() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .put("exec/A000/data.bin", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let part = store.get_range("exec/A000/data.bin", 3, 7).await.unwrap();
        assert_eq!(&part[..], b"3456");
        assert!(store.get_range("exec/A000/data.bin", 4, 4).await.unwrap().is_empty());

        let err = store
            .get_range("exec/A000/data.bin", 6, 11)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RangeOutOfBounds { len: 10, .. }));
        assert!(matches!(
            store.get_range("exec/A000/missing.bin", 0, 1).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_keys_differing_by_extension_do_not_share_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalObjectStore::new(dir.path()));

        let mut writers = tokio::task::JoinSet::new();
        for round in 0..20u8 {
            for key in ["status/x.json", "status/x.txt"] {
                let store = store.clone();
                let body = Bytes::from(vec![round; 64 * 1024]);
                writers.spawn(async move { store.put(key, body).await });
            }
        }
        while let Some(done) = writers.join_next().await {
            done.unwrap().unwrap();
        }

        for key in ["status/x.json", "status/x.txt"] {
            let body = store.get(key).await.unwrap();
            assert_eq!(body.len(), 64 * 1024);
            assert!(body.iter().all(|b| *b == body[0]));
        }
        let mut names: Vec<_> = std::fs::read_dir(dir.path().join("status"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["x.json", "x.txt"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.delete("missing").await.unwrap();

        let memory = MemoryObjectStore::new();
        memory.delete("missing").await.unwrap();
    }
}
