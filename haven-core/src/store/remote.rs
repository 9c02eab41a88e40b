//! Remote object store abstraction.
//!
//! Objects are addressed by keys of the form
//! `{context-name}/{kind}-{safe-identifier}.yaml`. Implementations must make
//! `put` atomic: readers see the old object or the new one, never a mix.

use crate::error::{HavenError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Blob store holding configuration documents.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch an object.
    ///
    /// # Errors
    ///
    /// `HavenError::NotFound` if the key does not exist,
    /// `HavenError::StoreUnavailable` if the store could not be reached.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or replace an object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Human-readable location, for messages.
    fn describe(&self) -> String;
}

/// Store backed by a directory (a mounted blob container or a local folder).
pub struct FsRemoteStore {
    root: PathBuf,
}

impl FsRemoteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(HavenError::validation("key", format!("'{}' is not a valid object key", key)));
        }
        Ok(self.root.join(relative))
    }

    fn unavailable(key: &str, e: std::io::Error) -> HavenError {
        HavenError::StoreUnavailable { key: key.to_string(), reason: e.to_string() }
    }
}

#[async_trait]
impl RemoteStore for FsRemoteStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HavenError::NotFound { what: format!("remote object '{}'", key) })
            }
            Err(e) => Err(Self::unavailable(key, e)),
        }
    }

    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Self::unavailable(key, e))?;
        }

        // Write to a sibling temp file, then rename over the target
        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await.map_err(|e| Self::unavailable(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::unavailable(key, e));
        }

        debug!(path = %path.display(), "Wrote remote object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path).await.map_err(|e| Self::unavailable(key, e))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// In-memory store for tests. Counts writes and can simulate an outage.
#[derive(Default)]
pub struct MemoryRemoteStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, key: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(HavenError::StoreUnavailable {
                key: key.to_string(),
                reason: "simulated outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.check_available(key)?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| HavenError::NotFound { what: format!("remote object '{}'", key) })
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.check_available(key)?;
        self.objects.write().await.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRemoteStore::new(dir.path());

        assert!(!store.exists("acme/hub-acme.yaml").await.unwrap());
        store.put("acme/hub-acme.yaml", b"name: acme\n").await.unwrap();
        assert!(store.exists("acme/hub-acme.yaml").await.unwrap());
        assert_eq!(store.get("acme/hub-acme.yaml").await.unwrap(), b"name: acme\n");

        store.put("acme/hub-acme.yaml", b"name: acme2\n").await.unwrap();
        assert_eq!(store.get("acme/hub-acme.yaml").await.unwrap(), b"name: acme2\n");

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("acme")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRemoteStore::new(dir.path());
        let err = store.get("acme/leaf-nope.yaml").await.unwrap_err();
        assert!(matches!(err, HavenError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRemoteStore::new(dir.path());
        assert!(store.put("../escape.yaml", b"x").await.is_err());
        assert!(store.put("/abs.yaml", b"x").await.is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_counts_writes() {
        let store = MemoryRemoteStore::new();
        store.put("k", b"v").await.unwrap();
        store.put("k", b"w").await.unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get("k").await.unwrap(), b"w");
    }

    #[tokio::test]
    async fn test_memory_store_outage() {
        let store = MemoryRemoteStore::new();
        store.set_unavailable(true);
        let err = store.exists("k").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
