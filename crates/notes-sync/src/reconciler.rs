//! Reconciler: synchronizes a local note collection with a bucket.
//!
//! One sync is a sequential pipeline with concurrent fan-out inside it:
//!
//! 1. Fetch the remote index (missing index = first sync, upload local state)
//! 2. Download every content blob the index lists, `concurrency` at a time.
//!    Unreadable blobs degrade the document instead of failing the sync
//! 3. Merge (see [`crate::reconcile`])
//! 4. Upload content blobs, then the new index
//!
//! Every transfer future is owned by the sync future, so dropping it (for
//! example from a `select!` on a shutdown signal) cancels all of them.
//! Content goes up before the index: a failed upload can leave orphaned
//! blobs behind, never an index entry without a blob.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SyncOptions};
use crate::events::{EventBus, SyncEvent};
use crate::layout::{RemoteLayout, is_valid_id};
use crate::model::{ContentBlob, Document, DocumentMeta, Folder, RemoteIndex};
use crate::reconcile::{self, LocalState, MergeKind, RemoteState};
use crate::store::{ObjectStore, StoreError};
use crate::tombstones::Tombstones;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed remote index: {0}")]
    MalformedIndex(#[source] serde_json::Error),

    #[error("Invalid document id: {0:?}")]
    InvalidId(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How a sync resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// No remote index existed; local state was uploaded
    FirstSync,
    /// Local side was empty; remote state was taken without uploading
    AdoptedRemote,
    /// Remote side was empty; local state was uploaded
    AdoptedLocal,
    /// Both sides were merged and the result uploaded
    Merged,
}

/// Result of a sync, handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub kind: SyncKind,
    pub documents: Vec<Document>,
    pub folders: Vec<Folder>,
    /// True when the caller must replace its state with `documents`/`folders`
    pub has_changes: bool,
    /// Documents whose remote content could not be read
    pub degraded: Vec<String>,
    /// Documents in `documents` holding empty stand-in content. The caller
    /// must pass these back in [`LocalState::placeholders`].
    pub placeholders: Vec<String>,
    /// Ids newly recorded as deleted by this sync
    pub newly_deleted: Vec<String>,
    /// Tombstone set as published (or as found, if nothing was uploaded)
    pub tombstones: Tombstones,
}

/// Synchronizes local collections with a bucket through an injected store.
pub struct Reconciler<S: ObjectStore> {
    store: S,
    layout: RemoteLayout,
    options: SyncOptions,
    events: Option<Arc<EventBus>>,
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: S, options: SyncOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store,
            layout: RemoteLayout::new(&options.root),
            options,
            events: None,
        })
    }

    /// Publish progress to `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Sync documents and folders with the bucket.
    pub async fn sync(&self, documents: Vec<Document>, folders: Vec<Folder>) -> Result<SyncOutcome> {
        self.sync_with(LocalState::new(documents, folders)).await
    }

    /// Sync, also propagating deletions recorded locally.
    pub async fn sync_with(&self, local: LocalState) -> Result<SyncOutcome> {
        let now = Utc::now();

        let Some(index) = self.fetch_index().await? else {
            info!("No remote index, uploading local state as first sync");
            self.emit(SyncEvent::IndexMissing {
                timestamp: now.timestamp_millis(),
            });
            return self.first_sync(local, now).await;
        };

        self.emit(SyncEvent::IndexFetched {
            documents: index.file_metadata.len(),
            folders: index.folders.len(),
            timestamp: now.timestamp_millis(),
        });
        debug!(
            "Remote index: {} documents, {} folders",
            index.file_metadata.len(),
            index.folders.len()
        );

        let remote = self.download(&index).await;
        let result = reconcile::merge(&local, &remote, now);
        let needs_upload = result.needs_upload();
        let mut tombstones = result.tombstones;

        if needs_upload {
            let upload: HashSet<&str> = result.upload_ids.iter().map(String::as_str).collect();
            let documents: Vec<&Document> = result
                .documents
                .iter()
                .filter(|d| upload.contains(d.id.as_str()))
                .collect();
            self.publish(
                &documents,
                result.index_entries,
                &result.folders,
                &mut tombstones,
                now,
            )
            .await?;
        } else {
            debug!("Adopted remote state, nothing to upload");
        }

        let kind = match result.kind {
            MergeKind::AdoptRemote => SyncKind::AdoptedRemote,
            MergeKind::AdoptLocal => SyncKind::AdoptedLocal,
            MergeKind::Merged => SyncKind::Merged,
        };
        let outcome = SyncOutcome {
            kind,
            documents: result.documents,
            folders: result.folders,
            has_changes: result.has_changes,
            degraded: result.degraded,
            placeholders: result.placeholders,
            newly_deleted: result.newly_deleted,
            tombstones,
        };
        self.finish(&outcome, now);
        Ok(outcome)
    }

    /// Read the remote index. `None` when it does not exist yet.
    pub async fn fetch_index(&self) -> Result<Option<RemoteIndex>> {
        let key = self.layout.index_key();
        let bytes = match self.store.get(&key).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let index = serde_json::from_slice(&bytes).map_err(SyncError::MalformedIndex)?;
        Ok(Some(index))
    }

    async fn first_sync(&self, local: LocalState, now: DateTime<Utc>) -> Result<SyncOutcome> {
        let mut tombstones = local.deleted.clone();
        let (placeholders, documents): (Vec<&Document>, Vec<&Document>) = local
            .documents
            .iter()
            .partition(|d| local.placeholders.contains(&d.id));
        if !placeholders.is_empty() {
            warn!(
                "Not uploading {} document(s) without downloaded content",
                placeholders.len()
            );
        }
        let placeholders: Vec<String> = placeholders.iter().map(|d| d.id.clone()).collect();
        let entries = local.documents.iter().map(Document::meta).collect();
        self.publish(&documents, entries, &local.folders, &mut tombstones, now)
            .await?;

        let outcome = SyncOutcome {
            kind: SyncKind::FirstSync,
            documents: local.documents,
            folders: local.folders,
            has_changes: false,
            degraded: Vec::new(),
            placeholders,
            newly_deleted: Vec::new(),
            tombstones,
        };
        self.finish(&outcome, now);
        Ok(outcome)
    }

    /// Download every content blob listed in `index`.
    ///
    /// Failures are logged and turn the document into a degraded entry with
    /// empty content.
    async fn download(&self, index: &RemoteIndex) -> RemoteState {
        let results: Vec<(Document, Option<String>)> = stream::iter(&index.file_metadata)
            .map(|meta| self.download_one(meta))
            .buffered(self.options.concurrency)
            .collect()
            .await;

        let mut degraded = HashSet::new();
        let mut documents = Vec::with_capacity(results.len());
        for (document, failure) in results {
            if let Some(reason) = failure {
                warn!("Content for {} unavailable: {}", document.id, reason);
                self.emit(SyncEvent::ContentDegraded {
                    id: document.id.clone(),
                    reason,
                });
                degraded.insert(document.id.clone());
            }
            documents.push(document);
        }

        RemoteState {
            documents,
            folders: index.folders.clone(),
            tombstones: index.tombstones(),
            degraded,
        }
    }

    async fn download_one(&self, meta: &DocumentMeta) -> (Document, Option<String>) {
        match self.read_blob(&meta.id).await {
            Ok(content) => {
                self.emit(SyncEvent::ContentDownloaded {
                    id: meta.id.clone(),
                    size: content.len(),
                });
                (meta.with_content(content), None)
            }
            Err(reason) => (meta.with_content(String::new()), Some(reason)),
        }
    }

    async fn read_blob(&self, id: &str) -> std::result::Result<String, String> {
        let bytes = self
            .store
            .get(&self.layout.content_key(id))
            .await
            .map_err(|e| e.to_string())?;
        let blob: ContentBlob = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
        if blob.id != id {
            return Err(format!("blob belongs to {}", blob.id));
        }
        Ok(blob.content)
    }

    /// Upload content blobs for `documents`, then an index made of
    /// `entries`, `folders` and the pruned `tombstones`.
    pub(crate) async fn publish(
        &self,
        documents: &[&Document],
        entries: Vec<DocumentMeta>,
        folders: &[Folder],
        tombstones: &mut Tombstones,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(bad) = documents.iter().find(|d| !is_valid_id(&d.id)) {
            return Err(SyncError::InvalidId(bad.id.clone()));
        }

        stream::iter(documents.iter().map(Ok::<_, SyncError>))
            .try_for_each_concurrent(self.options.concurrency, |document| async move {
                let bytes = serde_json::to_vec(&document.blob())?;
                self.put(&self.layout.content_key(&document.id), &bytes)
                    .await
            })
            .await?;

        let dropped = tombstones.prune(self.options.tombstone_limit);
        if dropped > 0 {
            info!("Pruned {} old tombstones", dropped);
        }

        let index = RemoteIndex::new(entries, folders, tombstones, now);
        let bytes = serde_json::to_vec_pretty(&index)?;
        self.put(&self.layout.index_key(), &bytes).await
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.store.put(key, bytes).await?;
        debug!("Uploaded {} ({} bytes)", key, bytes.len());
        self.emit(SyncEvent::ObjectUploaded {
            key: key.to_string(),
            size: bytes.len(),
        });
        Ok(())
    }

    fn finish(&self, outcome: &SyncOutcome, now: DateTime<Utc>) {
        info!(
            "Sync complete ({:?}): {} documents, {} folders, changes: {}, degraded: {}",
            outcome.kind,
            outcome.documents.len(),
            outcome.folders.len(),
            outcome.has_changes,
            outcome.degraded.len()
        );
        self.emit(SyncEvent::SyncCompleted {
            documents: outcome.documents.len(),
            folders: outcome.folders.len(),
            has_changes: outcome.has_changes,
            degraded: outcome.degraded.len(),
            timestamp: now.timestamp_millis(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::INDEX_VERSION;
    use crate::store::InMemoryStore;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn doc(id: &str, updated: &str) -> Document {
        Document {
            id: id.into(),
            name: format!("Note {}", id),
            content: format!("# {}\n\nbody @ {}", id, updated),
            folder_id: None,
            created_at: ts("2024-01-01T00:00:00Z"),
            updated_at: ts(updated),
        }
    }

    fn folder(id: &str) -> Folder {
        Folder {
            id: id.into(),
            name: id.to_uppercase(),
            created_at: ts("2024-01-01T00:00:00Z"),
        }
    }

    fn reconciler() -> (Arc<InMemoryStore>, Reconciler<Arc<InMemoryStore>>) {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(Arc::clone(&store), SyncOptions::default()).unwrap();
        (store, reconciler)
    }

    async fn remote_index(store: &InMemoryStore) -> RemoteIndex {
        let bytes = store.get("freeeditor/sync/index.json").await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn remote_content(store: &InMemoryStore, id: &str) -> String {
        let key = format!("freeeditor/sync/articles/{}.json", id);
        let blob: ContentBlob = serde_json::from_slice(&store.get(&key).await.unwrap()).unwrap();
        blob.content
    }

    const T0: &str = "2024-02-01T00:00:00Z";
    const T1: &str = "2024-03-01T00:00:00Z";

    #[tokio::test]
    async fn test_first_sync_uploads_local_state() {
        let (store, reconciler) = reconciler();
        let documents = vec![doc("a", T0), doc("b", T1)];

        let outcome = reconciler
            .sync(documents.clone(), vec![folder("f")])
            .await
            .unwrap();

        assert_eq!(outcome.kind, SyncKind::FirstSync);
        assert!(!outcome.has_changes);
        assert_eq!(outcome.documents, documents);

        let index = remote_index(&store).await;
        assert_eq!(index.file_metadata.len(), 2);
        assert_eq!(index.folders, vec![folder("f")]);
        assert_eq!(index.version, INDEX_VERSION);
        assert_eq!(remote_content(&store, "b").await, documents[1].content);

        // Index is written last
        assert_eq!(
            store.writes().last().map(String::as_str),
            Some("freeeditor/sync/index.json")
        );
    }

    #[tokio::test]
    async fn test_malformed_index_is_an_error() {
        let (store, reconciler) = reconciler();
        store
            .put("freeeditor/sync/index.json", b"not json")
            .await
            .unwrap();

        let err = reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedIndex(_)));
    }

    #[tokio::test]
    async fn test_storage_errors_propagate() {
        let (store, reconciler) = reconciler();
        store.fail_reads("freeeditor/sync/index.json");

        let err = reconciler.sync(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn test_empty_device_adopts_remote_without_uploading() {
        let (store, reconciler) = reconciler();
        reconciler
            .sync(
                vec![doc("a", T0), doc("b", T0), doc("c", T1)],
                vec![folder("f")],
            )
            .await
            .unwrap();
        store.clear_writes();

        let outcome = reconciler.sync(vec![], vec![]).await.unwrap();
        assert_eq!(outcome.kind, SyncKind::AdoptedRemote);
        assert!(outcome.has_changes);
        assert_eq!(outcome.documents.len(), 3);
        assert_eq!(outcome.folders, vec![folder("f")]);
        assert_eq!(outcome.documents[2].content, doc("c", T1).content);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_newer_remote_version_replaces_local() {
        let (store, reconciler) = reconciler();
        reconciler.sync(vec![doc("a", T1)], vec![]).await.unwrap();

        let outcome = reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        assert_eq!(outcome.kind, SyncKind::Merged);
        assert!(outcome.has_changes);
        assert_eq!(outcome.documents, vec![doc("a", T1)]);
        assert_eq!(remote_content(&store, "a").await, doc("a", T1).content);
    }

    #[tokio::test]
    async fn test_local_deletion_propagates_as_tombstone() {
        let (store, reconciler) = reconciler();
        reconciler
            .sync(vec![doc("a", T0), doc("b", T0)], vec![])
            .await
            .unwrap();

        let outcome = reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        assert_eq!(outcome.newly_deleted, vec!["b"]);
        assert!(!outcome.has_changes);

        let index = remote_index(&store).await;
        assert_eq!(index.file_metadata.len(), 1);
        assert!(index.tombstones().contains_file("b"));

        // A stale device that still holds b loses it on its next sync
        let outcome = reconciler
            .sync(vec![doc("a", T0), doc("b", T1)], vec![])
            .await
            .unwrap();
        assert_eq!(outcome.documents, vec![doc("a", T0)]);
        assert!(outcome.has_changes);
    }

    #[tokio::test]
    async fn test_degraded_download_keeps_document_with_empty_content() {
        let (store, reconciler) = reconciler();
        reconciler
            .sync(vec![doc("a", T0), doc("b", T0)], vec![])
            .await
            .unwrap();
        store.fail_reads("freeeditor/sync/articles/a.json");

        let events = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |event| seen_clone.lock().unwrap().push(event));
        let reconciler = reconciler.with_events(events);

        let outcome = reconciler.sync(vec![], vec![]).await.unwrap();
        assert_eq!(outcome.kind, SyncKind::AdoptedRemote);
        assert_eq!(outcome.documents.len(), 2);
        assert_eq!(outcome.documents[0].content, "");
        assert_eq!(outcome.degraded, vec!["a"]);

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|e| matches!(
            e,
            SyncEvent::ContentDegraded { id, .. } if id == "a"
        )));
    }

    #[tokio::test]
    async fn test_degraded_newer_remote_is_not_clobbered() {
        let (store, reconciler) = reconciler();
        reconciler.sync(vec![doc("a", T1)], vec![]).await.unwrap();
        store.fail_reads("freeeditor/sync/articles/a.json");
        store.clear_writes();

        let outcome = reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        assert_eq!(outcome.documents, vec![doc("a", T0)]);
        assert_eq!(outcome.degraded, vec!["a"]);
        assert_eq!(store.writes(), vec!["freeeditor/sync/index.json"]);

        let index = remote_index(&store).await;
        assert_eq!(index.file_metadata[0].updated_at, ts(T1));
    }

    #[tokio::test]
    async fn test_placeholder_is_filled_once_blob_is_readable() {
        let (store, reconciler) = reconciler();
        reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        let key = "freeeditor/sync/articles/a.json";
        store.fail_reads(key);

        let outcome = reconciler.sync(vec![], vec![]).await.unwrap();
        assert_eq!(outcome.placeholders, vec!["a"]);
        assert_eq!(outcome.documents[0].content, "");

        // Still unreadable: nothing is uploaded for the placeholder
        let mut local = LocalState::new(outcome.documents.clone(), vec![]);
        local.placeholders = outcome.placeholders.iter().cloned().collect();
        store.clear_writes();
        let again = reconciler.sync_with(local.clone()).await.unwrap();
        assert_eq!(again.placeholders, vec!["a"]);
        assert_eq!(store.writes(), vec!["freeeditor/sync/index.json"]);

        store.restore_reads(key);
        let outcome = reconciler.sync_with(local).await.unwrap();
        assert!(outcome.has_changes);
        assert!(outcome.placeholders.is_empty());
        assert_eq!(outcome.documents, vec![doc("a", T0)]);
        assert_eq!(remote_content(&store, "a").await, doc("a", T0).content);
    }

    #[tokio::test]
    async fn test_unreadable_blob_is_rewritten_from_local_copy() {
        let (store, reconciler) = reconciler();
        reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        store.delete("freeeditor/sync/articles/a.json").await.unwrap();

        let outcome = reconciler.sync(vec![doc("a", T0)], vec![]).await.unwrap();
        assert!(outcome.degraded.is_empty());
        assert_eq!(remote_content(&store, "a").await, doc("a", T0).content);
    }

    #[tokio::test]
    async fn test_first_sync_skips_placeholders() {
        let (store, reconciler) = reconciler();
        let mut empty = doc("a", T0);
        empty.content.clear();
        let mut local = LocalState::new(vec![empty, doc("b", T0)], vec![]);
        local.placeholders.insert("a".into());

        let outcome = reconciler.sync_with(local).await.unwrap();
        assert_eq!(outcome.kind, SyncKind::FirstSync);
        assert_eq!(outcome.placeholders, vec!["a"]);
        assert!(!store.contains("freeeditor/sync/articles/a.json"));
        assert_eq!(remote_index(&store).await.file_metadata.len(), 2);
    }

    #[tokio::test]
    async fn test_second_sync_reports_no_changes() {
        let (_store, reconciler) = reconciler();
        reconciler
            .sync(vec![doc("a", T1), doc("x", T0)], vec![folder("f")])
            .await
            .unwrap();

        let first = reconciler
            .sync(vec![doc("a", T0), doc("b", T0)], vec![folder("g")])
            .await
            .unwrap();
        assert!(first.has_changes);

        let second = reconciler
            .sync(first.documents.clone(), first.folders.clone())
            .await
            .unwrap();
        assert!(!second.has_changes);
        assert_eq!(second.documents, first.documents);
        assert_eq!(second.folders, first.folders);
    }

    #[tokio::test]
    async fn test_invalid_ids_are_rejected_before_upload() {
        let (store, reconciler) = reconciler();
        let err = reconciler
            .sync(vec![doc("../escape", T0)], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidId(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_are_pruned_on_publish() {
        let store = Arc::new(InMemoryStore::new());
        let options = SyncOptions {
            tombstone_limit: 2,
            ..SyncOptions::default()
        };
        let reconciler = Reconciler::new(Arc::clone(&store), options).unwrap();

        let mut local = LocalState::new(vec![doc("keep", T0)], vec![]);
        for id in ["d1", "d2", "d3"] {
            local.deleted.add_file(id, ts(T0));
        }
        let outcome = reconciler.sync_with(local).await.unwrap();
        assert_eq!(outcome.tombstones.files, vec!["d2", "d3"]);

        let index = remote_index(&store).await;
        assert_eq!(index.tombstones().files, vec!["d2", "d3"]);
    }
}
