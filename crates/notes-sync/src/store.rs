//! ObjectStore trait abstraction over bucket-style storage.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `LocalStore` (in notes-daemon) - A directory on disk
//! - `OssStore` (in notes-daemon) - Aliyun OSS over HTTPS
//!
//! Each `put` is atomic per object; there is no cross-object transaction and
//! no conditional write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Full object key
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Last write time as reported by the store
    pub last_modified: DateTime<Utc>,
}

/// Bucket-style storage: flat keys, whole-object reads and writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object. Missing objects are `StoreError::NotFound`.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or replace an object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// List objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Reject keys that cannot be mapped safely onto a path or URL.
pub fn validate_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        Some("empty key")
    } else if key.starts_with('/') {
        Some("leading slash")
    } else if key.contains("//") {
        Some("empty path segment")
    } else if key.split('/').any(|segment| segment == ".." || segment == ".") {
        Some("relative path segment")
    } else if key.contains('\\') {
        Some("backslash")
    } else if key.chars().any(|c| c.is_control()) {
        Some("control character")
    } else if key.len() > 1024 {
        Some("key too long")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidKey(format!("{} ({})", key, reason))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// In-memory object store for testing
#[derive(Default)]
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    /// Keys whose reads fail with an IO error
    failing: RwLock<HashSet<String>>,
    /// Every key written, in order
    writes: RwLock<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make reads of `key` fail, to simulate a flaky download
    pub fn fail_reads(&self, key: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    /// Undo [`InMemoryStore::fail_reads`]
    pub fn restore_reads(&self, key: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Set a specific modification time for recovery scenarios
    pub fn set_last_modified(&self, key: &str, at: DateTime<Utc>) {
        if let Some(object) = self
            .objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(key)
        {
            object.last_modified = at;
        }
    }

    /// Keys written so far, in write order
    pub fn writes(&self) -> Vec<String> {
        self.writes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Forget recorded writes (objects are kept)
    pub fn clear_writes(&self) {
        self.writes.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
        {
            return Err(StoreError::Io(format!("simulated read failure: {}", key)));
        }
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.objects.write().unwrap_or_else(|e| e.into_inner()).insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                last_modified: Utc::now(),
            },
        );
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.to_string());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.bytes.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}

// Allows sharing one store between a reconciler and test assertions
#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<T> {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        (**self).put(key, bytes).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        (**self).list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
