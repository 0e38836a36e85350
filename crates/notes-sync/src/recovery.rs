//! Orphan recovery: rebuild the remote index from content blobs.
//!
//! Used when an interrupted sync left blobs that the index does not list (or
//! an index that cannot be read at all). Every blob under the articles prefix
//! becomes a document; whatever the old index still says about it (name,
//! folder, timestamps) is reused when the index is readable.
//!
//! Only a malformed index is ignored. Any other failure to read it aborts
//! the recovery, since rebuilding without it would drop every folder and
//! tombstone.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::model::{ContentBlob, Document, DocumentMeta, Folder};
use crate::reconciler::{Reconciler, Result, SyncError};
use crate::store::ObjectStore;
use crate::tombstones::Tombstones;

/// Outcome of [`Reconciler::recover`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Documents now listed by the rebuilt index
    pub documents: Vec<Document>,
    /// Folders carried over from the old index
    pub folders: Vec<Folder>,
    /// Blob keys that could not be read or parsed
    pub skipped: Vec<String>,
    /// Blobs that the old index did not list
    pub orphans: usize,
}

impl<S: ObjectStore> Reconciler<S> {
    /// Rebuild the index from every content blob in the bucket.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let now = Utc::now();

        let (known, folders, mut tombstones) = match self.fetch_index().await {
            Ok(Some(index)) => {
                let tombstones = index.tombstones();
                let known: HashMap<String, DocumentMeta> = index
                    .file_metadata
                    .into_iter()
                    .map(|meta| (meta.id.clone(), meta))
                    .collect();
                (known, index.folders, tombstones)
            }
            Ok(None) => (HashMap::new(), Vec::new(), Tombstones::default()),
            Err(SyncError::MalformedIndex(e)) => {
                warn!("Ignoring malformed index during recovery: {}", e);
                (HashMap::new(), Vec::new(), Tombstones::default())
            }
            Err(e) => return Err(e),
        };

        let listing = self.store().list(&self.layout().articles_prefix()).await?;
        let mut report = RecoveryReport {
            folders,
            ..RecoveryReport::default()
        };

        let dead = tombstones.file_set();
        for object in listing {
            let Some(id) = self.layout().id_from_content_key(&object.key) else {
                continue;
            };
            if dead.contains(id) {
                continue;
            }

            let blob = match self.store().get(&object.key).await {
                Ok(bytes) => serde_json::from_slice::<ContentBlob>(&bytes),
                Err(e) => {
                    warn!("Skipping unreadable blob {}: {}", object.key, e);
                    report.skipped.push(object.key);
                    continue;
                }
            };
            let content = match blob {
                Ok(blob) if blob.id == id => blob.content,
                Ok(blob) => {
                    warn!("Skipping blob {}: it belongs to {}", object.key, blob.id);
                    report.skipped.push(object.key);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping malformed blob {}: {}", object.key, e);
                    report.skipped.push(object.key);
                    continue;
                }
            };

            let document = match known.get(id) {
                Some(meta) => meta.with_content(content),
                None => {
                    report.orphans += 1;
                    Document {
                        id: id.to_string(),
                        name: format!("Recovered {}", id),
                        content,
                        folder_id: None,
                        created_at: object.last_modified,
                        updated_at: object.last_modified,
                    }
                }
            };
            report.documents.push(document);
        }

        let documents: Vec<&Document> = Vec::new();
        let entries = report.documents.iter().map(Document::meta).collect();
        self.publish(&documents, entries, &report.folders, &mut tombstones, now)
            .await?;

        info!(
            "Recovered {} documents ({} orphaned, {} skipped)",
            report.documents.len(),
            report.orphans,
            report.skipped.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncOptions;
    use crate::model::RemoteIndex;
    use crate::store::InMemoryStore;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn doc(id: &str) -> Document {
        Document {
            id: id.into(),
            name: format!("Named {}", id),
            content: format!("body {}", id),
            folder_id: Some("f".into()),
            created_at: ts("2024-01-01T00:00:00Z"),
            updated_at: ts("2024-02-01T00:00:00Z"),
        }
    }

    async fn put_blob(store: &InMemoryStore, id: &str, content: &str) {
        let blob = ContentBlob {
            id: id.into(),
            content: content.into(),
        };
        store
            .put(
                &format!("freeeditor/sync/articles/{}.json", id),
                &serde_json::to_vec(&blob).unwrap(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recover_without_index_uses_placeholders() {
        let store = Arc::new(InMemoryStore::new());
        put_blob(&store, "a", "alpha").await;
        put_blob(&store, "b", "beta").await;
        store.set_last_modified("freeeditor/sync/articles/a.json", ts("2023-05-05T05:05:05Z"));
        store
            .put("freeeditor/sync/articles/broken.json", b"{")
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        let report = reconciler.recover().await.unwrap();

        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.orphans, 2);
        assert_eq!(report.skipped, vec!["freeeditor/sync/articles/broken.json"]);

        let a = &report.documents[0];
        assert_eq!(a.name, "Recovered a");
        assert_eq!(a.content, "alpha");
        assert_eq!(a.updated_at, ts("2023-05-05T05:05:05Z"));

        let index = reconciler.fetch_index().await.unwrap().unwrap();
        let ids: Vec<_> = index.file_metadata.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_recover_reuses_index_metadata_and_respects_tombstones() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        let folder = Folder {
            id: "f".into(),
            name: "Work".into(),
            created_at: ts("2024-01-01T00:00:00Z"),
        };
        reconciler
            .sync(vec![doc("a")], vec![folder.clone()])
            .await
            .unwrap();

        // Simulate an interrupted sync: a blob for c landed, the index never did;
        // d is a leftover blob of a deleted document
        put_blob(&store, "c", "gamma").await;
        put_blob(&store, "d", "stale").await;
        let mut index = reconciler.fetch_index().await.unwrap().unwrap();
        let mut tombstones = Tombstones::default();
        tombstones.add_file("d", Utc::now());
        index.deleted_items = Some(tombstones);
        store
            .put(
                "freeeditor/sync/index.json",
                &serde_json::to_vec(&index).unwrap(),
            )
            .await
            .unwrap();

        let report = reconciler.recover().await.unwrap();
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.orphans, 1);
        assert_eq!(report.documents[0], doc("a"));
        assert_eq!(report.documents[1].name, "Recovered c");
        assert_eq!(report.folders, vec![folder]);

        let rebuilt: RemoteIndex = reconciler.fetch_index().await.unwrap().unwrap();
        assert_eq!(rebuilt.file_metadata.len(), 2);
        assert!(rebuilt.tombstones().contains_file("d"));
    }

    #[tokio::test]
    async fn test_recover_ignores_unreadable_index() {
        let store = Arc::new(InMemoryStore::new());
        put_blob(&store, "a", "alpha").await;
        store
            .put("freeeditor/sync/index.json", b"garbage")
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        let report = reconciler.recover().await.unwrap();
        assert_eq!(report.documents.len(), 1);

        // The index is readable again afterwards
        assert!(reconciler.fetch_index().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_fails_when_index_cannot_be_read() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        let folder = Folder {
            id: "f".into(),
            name: "Work".into(),
            created_at: ts("2024-01-01T00:00:00Z"),
        };
        let mut local = crate::reconcile::LocalState::new(vec![doc("a")], vec![folder]);
        local.deleted.add_file("gone", Utc::now());
        reconciler.sync_with(local).await.unwrap();
        put_blob(&store, "gone", "deleted long ago").await;

        let index_key = "freeeditor/sync/index.json";
        let before = store.get(index_key).await.unwrap();
        store.fail_reads(index_key);
        store.clear_writes();

        let err = reconciler.recover().await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert!(store.writes().is_empty());

        store.restore_reads(index_key);
        assert_eq!(store.get(index_key).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_recover_skips_blob_stored_under_another_id() {
        let store = Arc::new(InMemoryStore::new());
        put_blob(&store, "a", "alpha").await;
        let stray = ContentBlob {
            id: "a".into(),
            content: "copied".into(),
        };
        store
            .put(
                "freeeditor/sync/articles/b.json",
                &serde_json::to_vec(&stray).unwrap(),
            )
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        let report = reconciler.recover().await.unwrap();
        let ids: Vec<_> = report.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(report.skipped, vec!["freeeditor/sync/articles/b.json"]);
    }
}
