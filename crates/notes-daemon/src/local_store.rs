//! Object store over a local directory using tokio::fs.
//!
//! Keys map onto relative paths below the root. Writes go to a sibling temp
//! file first and are renamed into place, so a reader never sees half an
//! object.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notes_sync::store::{ObjectMeta, ObjectStore, Result, StoreError, validate_key};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const PARTIAL_MARKER: &str = ".partial-";

/// Directory-backed bucket for the daemon
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        if key.ends_with('/') {
            return Err(StoreError::InvalidKey(format!("{} (trailing slash)", key)));
        }
        Ok(key.split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }
}

fn io_error(key: &str, e: std::io::Error) -> StoreError {
    if e.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(format!("{}: {}", key, e))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        fs::read(&path).await.map_err(|e| io_error(key, e))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(format!("{}{}", PARTIAL_MARKER, uuid::Uuid::new_v4()));
        let partial = PathBuf::from(partial);

        fs::write(&partial, bytes)
            .await
            .map_err(|e| io_error(key, e))?;
        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(io_error(key, e));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, dir_key)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(format!("{}: {}", dir.display(), e))),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().to_string();
                let key = format!("{}{}", dir_key, name);
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| StoreError::Io(e.to_string()))?;

                if metadata.is_dir() {
                    // Only descend where matching keys can live
                    let child = format!("{}/", key);
                    if child.starts_with(prefix) || prefix.starts_with(&child) {
                        pending.push((entry.path(), child));
                    }
                    continue;
                }
                if name.contains(PARTIAL_MARKER) || !key.starts_with(prefix) {
                    continue;
                }

                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(ObjectMeta {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::remove_file(&path).await.map_err(|e| io_error(key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().to_path_buf());

        store.put("notes/sync/index.json", b"{}").await.unwrap();
        assert_eq!(store.get("notes/sync/index.json").await.unwrap(), b"{}");
        assert!(temp_dir.path().join("notes/sync/index.json").exists());

        store.put("notes/sync/index.json", b"[]").await.unwrap();
        assert_eq!(store.get("notes/sync/index.json").await.unwrap(), b"[]");

        store.delete("notes/sync/index.json").await.unwrap();
        let err = store.get("notes/sync/index.json").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete("notes/sync/index.json").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().to_path_buf());

        store.put("r/sync/articles/b.json", b"bb").await.unwrap();
        store.put("r/sync/articles/a.json", b"a").await.unwrap();
        store.put("r/sync/index.json", b"{}").await.unwrap();
        store.put("r/20240101/1-x.png", b"png").await.unwrap();

        let listed = store.list("r/sync/articles/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["r/sync/articles/a.json", "r/sync/articles/b.json"]);
        assert_eq!(listed[1].size, 2);

        assert_eq!(store.list("r/").await.unwrap().len(), 4);
        assert!(store.list("missing/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("not-created"));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("bucket"));

        for key in ["../outside", "/abs", "a/../../b", "dir/"] {
            let err = store.put(key, b"x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "{}", key);
        }
        assert!(!temp_dir.path().join("outside").exists());
    }
}
