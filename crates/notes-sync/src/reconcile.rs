//! Reconciliation of local and remote note collections.
//!
//! Pure merge logic, no I/O. [`crate::Reconciler`] feeds it the downloaded
//! remote state and performs the uploads it asks for.
//!
//! # Algorithm
//!
//! 1. If the local side is empty (and nothing was deleted locally) while the
//!    remote side is not, adopt the remote side and upload nothing
//! 2. If the remote side is empty while the local side is not, adopt the
//!    local side and upload it
//! 3. Otherwise merge: local documents minus remote tombstones; a remote copy
//!    replaces the local one only when its `updatedAt` is strictly later
//! 4. Ids the remote index lists but the local side does not have were
//!    deleted locally: drop them and record tombstones
//! 5. Folders merge by existence only
//!
//! Ids in the incoming tombstone set never appear in the result.
//!
//! # Placeholders
//!
//! A document whose blob could not be downloaded is kept with empty content
//! and flagged as a placeholder. Placeholders are never uploaded. At equal
//! `updatedAt` a readable remote copy replaces a placeholder, while an
//! unflagged local copy is uploaded again to repair an unreadable blob.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::model::{Document, DocumentMeta, Folder};
use crate::tombstones::Tombstones;

/// The caller's side of a sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    pub documents: Vec<Document>,
    pub folders: Vec<Folder>,
    /// Deletions recorded locally since the last sync
    pub deleted: Tombstones,
    /// Documents holding empty stand-in content from a failed download
    pub placeholders: HashSet<String>,
}

impl LocalState {
    pub fn new(documents: Vec<Document>, folders: Vec<Folder>) -> Self {
        Self {
            documents,
            folders,
            deleted: Tombstones::default(),
            placeholders: HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.folders.is_empty()
    }
}

/// The bucket's side of a sync, after content download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteState {
    /// Documents in index order. Degraded ones carry empty content.
    pub documents: Vec<Document>,
    pub folders: Vec<Folder>,
    pub tombstones: Tombstones,
    /// Ids whose content blob could not be read
    pub degraded: HashSet<String>,
}

impl RemoteState {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.folders.is_empty()
    }
}

/// Which path the merge took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// Local side was empty; the remote side was taken as-is
    AdoptRemote,
    /// Remote side was empty; the local side was taken as-is
    AdoptLocal,
    /// Both sides had data
    Merged,
}

/// Result of [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub kind: MergeKind,
    pub documents: Vec<Document>,
    pub folders: Vec<Folder>,
    /// Outgoing tombstones (remote ∪ locally recorded ∪ newly inferred)
    pub tombstones: Tombstones,
    /// Metadata to publish in the new index
    pub index_entries: Vec<DocumentMeta>,
    /// Documents whose content blob must be uploaded
    pub upload_ids: Vec<String>,
    /// Ids removed because they vanished locally
    pub newly_deleted: Vec<String>,
    /// Ids whose remote content could not be read
    pub degraded: Vec<String>,
    /// Result documents whose content is an empty stand-in
    pub placeholders: Vec<String>,
    /// Whether the caller should replace its state with the result
    pub has_changes: bool,
}

impl MergeResult {
    /// Whether this merge writes anything back to the bucket.
    pub fn needs_upload(&self) -> bool {
        self.kind != MergeKind::AdoptRemote
    }
}

/// Merge local and remote collections.
///
/// `now` stamps newly inferred tombstones.
pub fn merge(local: &LocalState, remote: &RemoteState, now: DateTime<Utc>) -> MergeResult {
    if local.is_empty() && local.deleted.is_empty() && !remote.is_empty() {
        return adopt_remote(local, remote);
    }
    if remote.is_empty() && !local.is_empty() {
        return adopt_local(local, remote);
    }
    merge_both(local, remote, now)
}

fn adopt_remote(local: &LocalState, remote: &RemoteState) -> MergeResult {
    let tombstones = remote.tombstones.clone();
    let dead_files = tombstones.file_set();
    let dead_folders = tombstones.folder_set();

    let documents: Vec<Document> = remote
        .documents
        .iter()
        .filter(|d| !dead_files.contains(d.id.as_str()))
        .cloned()
        .collect();
    let folders: Vec<Folder> = remote
        .folders
        .iter()
        .filter(|f| !dead_folders.contains(f.id.as_str()))
        .cloned()
        .collect();

    let degraded: Vec<String> = documents
        .iter()
        .filter(|d| remote.degraded.contains(&d.id))
        .map(|d| d.id.clone())
        .collect();
    let has_changes = differs(local, &documents, &folders);

    MergeResult {
        kind: MergeKind::AdoptRemote,
        index_entries: documents.iter().map(Document::meta).collect(),
        upload_ids: Vec::new(),
        newly_deleted: Vec::new(),
        placeholders: degraded.clone(),
        degraded,
        documents,
        folders,
        tombstones,
        has_changes,
    }
}

fn adopt_local(local: &LocalState, remote: &RemoteState) -> MergeResult {
    let mut tombstones = remote.tombstones.clone();
    tombstones.merge(&local.deleted);

    let (documents, folders) = surviving_local(local, &tombstones);
    let has_changes = differs(local, &documents, &folders);
    let (placeholders, upload_ids): (Vec<String>, Vec<String>) = documents
        .iter()
        .map(|d| d.id.clone())
        .partition(|id| local.placeholders.contains(id));

    MergeResult {
        kind: MergeKind::AdoptLocal,
        index_entries: documents.iter().map(Document::meta).collect(),
        upload_ids,
        newly_deleted: Vec::new(),
        degraded: Vec::new(),
        placeholders,
        documents,
        folders,
        tombstones,
        has_changes,
    }
}

fn merge_both(local: &LocalState, remote: &RemoteState, now: DateTime<Utc>) -> MergeResult {
    let mut tombstones = remote.tombstones.clone();
    tombstones.merge(&local.deleted);

    let (mut documents, local_folders) = surviving_local(local, &tombstones);
    let local_ids: HashSet<&str> = local.documents.iter().map(|d| d.id.as_str()).collect();
    let position: HashMap<String, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.clone(), i))
        .collect();

    // Remote metadata to keep in place of a local entry when the newer remote
    // copy could not be downloaded
    let mut pinned: HashMap<String, DocumentMeta> = HashMap::new();
    let mut vanished = Vec::new();
    let mut degraded = Vec::new();
    // Placeholders that got their real content back from the remote side
    let mut filled: HashSet<String> = HashSet::new();

    for remote_doc in &remote.documents {
        let id = &remote_doc.id;
        if !local_ids.contains(id.as_str()) {
            vanished.push(id.clone());
            continue;
        }
        let Some(&i) = position.get(id) else {
            // Present locally but tombstoned remotely
            continue;
        };
        let unreadable = remote.degraded.contains(id);
        let placeholder = local.placeholders.contains(id);
        if remote_doc.updated_at < documents[i].updated_at {
            continue;
        }
        if remote_doc.updated_at == documents[i].updated_at {
            match (placeholder, unreadable) {
                (true, false) => {
                    documents[i] = remote_doc.clone();
                    filled.insert(id.clone());
                }
                (true, true) => degraded.push(id.clone()),
                (false, true) => {
                    tracing::warn!("Re-uploading content for {}: remote blob unreadable", id)
                }
                (false, false) => {}
            }
            continue;
        }
        if unreadable {
            tracing::warn!(
                "Keeping local copy of {}: newer remote content unavailable",
                id
            );
            pinned.insert(id.clone(), remote_doc.meta());
            degraded.push(id.clone());
            continue;
        }
        documents[i] = remote_doc.clone();
        if placeholder {
            filled.insert(id.clone());
        }
    }
    let newly_deleted = tombstones.add_files(vanished, now);

    let mut folders = local_folders;
    let known: HashSet<&str> = local.folders.iter().map(|f| f.id.as_str()).collect();
    let dead_folders = tombstones.folder_set();
    for folder in &remote.folders {
        if !known.contains(folder.id.as_str()) && !dead_folders.contains(folder.id.as_str()) {
            folders.push(folder.clone());
        }
    }

    let index_entries = documents
        .iter()
        .map(|d| pinned.remove(&d.id).unwrap_or_else(|| d.meta()))
        .collect();
    let placeholders: Vec<String> = documents
        .iter()
        .filter(|d| local.placeholders.contains(&d.id) && !filled.contains(&d.id))
        .map(|d| d.id.clone())
        .collect();
    let held_back: HashSet<&str> = degraded
        .iter()
        .chain(&placeholders)
        .map(String::as_str)
        .collect();
    let upload_ids = documents
        .iter()
        .filter(|d| !held_back.contains(d.id.as_str()))
        .map(|d| d.id.clone())
        .collect();
    let has_changes = differs(local, &documents, &folders) || !filled.is_empty();

    MergeResult {
        kind: MergeKind::Merged,
        documents,
        folders,
        tombstones,
        index_entries,
        upload_ids,
        newly_deleted,
        degraded,
        placeholders,
        has_changes,
    }
}

/// Local documents and folders that are not tombstoned.
fn surviving_local(local: &LocalState, tombstones: &Tombstones) -> (Vec<Document>, Vec<Folder>) {
    let dead_files = tombstones.file_set();
    let dead_folders = tombstones.folder_set();
    let documents = local
        .documents
        .iter()
        .filter(|d| !dead_files.contains(d.id.as_str()))
        .cloned()
        .collect();
    let folders = local
        .folders
        .iter()
        .filter(|f| !dead_folders.contains(f.id.as_str()))
        .cloned()
        .collect();
    (documents, folders)
}

/// True when the caller's state must be replaced by the merged state.
fn differs(local: &LocalState, documents: &[Document], folders: &[Folder]) -> bool {
    if documents.len() != local.documents.len() || folders.len() != local.folders.len() {
        return true;
    }

    let local_versions: HashMap<&str, DateTime<Utc>> = local
        .documents
        .iter()
        .map(|d| (d.id.as_str(), d.updated_at))
        .collect();
    let doc_changed = documents
        .iter()
        .any(|d| local_versions.get(d.id.as_str()) != Some(&d.updated_at));

    let local_folders: HashSet<&str> = local.folders.iter().map(|f| f.id.as_str()).collect();
    let folder_changed = folders.iter().any(|f| !local_folders.contains(f.id.as_str()));

    doc_changed || folder_changed
}
