//! Library: the local note collection the editor mutates.
//!
//! Every document mutation moves `updated_at` strictly forward so the edit
//! wins the next last-write-wins merge. Deletions are recorded as tombstones
//! until the next sync publishes them.
//!
//! Documents whose content could not be downloaded are kept as flagged
//! placeholders. The flag survives restarts and is cleared when the real
//! content arrives or the user writes new content.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::model::{Document, Folder};
use crate::reconcile::LocalState;
use crate::reconciler::SyncOutcome;
use crate::tombstones::Tombstones;

pub const DEFAULT_DOCUMENT_NAME: &str = "Untitled";
pub const DEFAULT_DOCUMENT_CONTENT: &str = "# New document\n\nStart writing...";
pub const DEFAULT_FOLDER_NAME: &str = "New folder";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LibraryError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),
}

pub type Result<T> = std::result::Result<T, LibraryError>;

/// Documents, folders and not-yet-synced deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    folders: Vec<Folder>,
    #[serde(default)]
    deleted: Tombstones,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    placeholders: BTreeSet<String>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(documents: Vec<Document>, folders: Vec<Folder>) -> Self {
        Self {
            documents,
            folders,
            ..Self::default()
        }
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    /// Deletions waiting for the next sync
    pub fn pending_deletions(&self) -> &Tombstones {
        &self.deleted
    }

    /// Whether `id` holds empty stand-in content from a failed download
    pub fn is_placeholder(&self, id: &str) -> bool {
        self.placeholders.contains(id)
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Documents inside `folder_id` (`None` = top level).
    pub fn documents_in(&self, folder_id: Option<&str>) -> impl Iterator<Item = &Document> {
        self.documents
            .iter()
            .filter(move |d| d.folder_id.as_deref() == folder_id)
    }

    pub fn create_document(&mut self, folder_id: Option<&str>) -> Result<&Document> {
        self.ensure_folder(folder_id)?;
        let now = Utc::now();
        self.documents.push(Document {
            id: uuid::Uuid::new_v4().to_string(),
            name: DEFAULT_DOCUMENT_NAME.to_string(),
            content: DEFAULT_DOCUMENT_CONTENT.to_string(),
            folder_id: folder_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        });
        let created = &self.documents[self.documents.len() - 1];
        debug!("Created document {}", created.id);
        Ok(created)
    }

    pub fn create_folder(&mut self, name: &str) -> &Folder {
        let name = if name.trim().is_empty() {
            DEFAULT_FOLDER_NAME
        } else {
            name
        };
        self.folders.push(Folder {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        });
        &self.folders[self.folders.len() - 1]
    }

    pub fn update_content(&mut self, id: &str, content: &str) -> Result<()> {
        let document = self.document_mut(id)?;
        document.content = content.to_string();
        touch(document);
        self.placeholders.remove(id);
        Ok(())
    }

    pub fn rename_document(&mut self, id: &str, name: &str) -> Result<()> {
        let document = self.document_mut(id)?;
        document.name = name.to_string();
        touch(document);
        Ok(())
    }

    /// Folders have no modification time; a rename is not ordered against
    /// a concurrent rename elsewhere.
    pub fn rename_folder(&mut self, id: &str, name: &str) -> Result<()> {
        let folder = self
            .folders
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| LibraryError::FolderNotFound(id.to_string()))?;
        folder.name = name.to_string();
        Ok(())
    }

    /// Move one document into `folder_id` (`None` = top level).
    pub fn move_one(&mut self, id: &str, folder_id: Option<&str>) -> Result<()> {
        self.ensure_folder(folder_id)?;
        let document = self.document_mut(id)?;
        if document.folder_id.as_deref() != folder_id {
            document.folder_id = folder_id.map(str::to_string);
            touch(document);
        }
        Ok(())
    }

    /// Move several documents. Nothing moves unless every id exists.
    ///
    /// Returns the number of documents whose folder changed.
    pub fn move_many(&mut self, ids: &[String], folder_id: Option<&str>) -> Result<usize> {
        self.ensure_folder(folder_id)?;
        self.ensure_documents(ids)?;

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut moved = 0;
        for document in self
            .documents
            .iter_mut()
            .filter(|d| wanted.contains(d.id.as_str()))
        {
            if document.folder_id.as_deref() != folder_id {
                document.folder_id = folder_id.map(str::to_string);
                touch(document);
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub fn delete_one(&mut self, id: &str) -> Result<Document> {
        let position = self
            .documents
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| LibraryError::DocumentNotFound(id.to_string()))?;
        let removed = self.documents.remove(position);
        self.deleted.add_file(removed.id.clone(), Utc::now());
        self.placeholders.remove(id);
        Ok(removed)
    }

    /// Delete several documents. Nothing is deleted unless every id exists.
    pub fn delete_many(&mut self, ids: &[String]) -> Result<usize> {
        self.ensure_documents(ids)?;

        let doomed: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let now = Utc::now();
        let before = self.documents.len();
        let removed: Vec<String> = self
            .documents
            .iter()
            .filter(|d| doomed.contains(d.id.as_str()))
            .map(|d| d.id.clone())
            .collect();
        self.documents.retain(|d| !doomed.contains(d.id.as_str()));
        for id in &removed {
            self.placeholders.remove(id);
        }
        self.deleted.add_files(removed, now);
        Ok(before - self.documents.len())
    }

    /// Delete a folder and every document in it.
    ///
    /// Returns the number of documents removed.
    pub fn delete_folder(&mut self, id: &str) -> Result<usize> {
        let position = self
            .folders
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| LibraryError::FolderNotFound(id.to_string()))?;
        self.folders.remove(position);

        let now = Utc::now();
        self.deleted.add_folder(id, now);
        let contained: Vec<String> = self
            .documents_in(Some(id))
            .map(|d| d.id.clone())
            .collect();
        let removed = contained.len();
        if removed > 0 {
            self.delete_many(&contained)?;
        }
        Ok(removed)
    }

    /// Snapshot handed to the reconciler.
    pub fn local_state(&self) -> LocalState {
        LocalState {
            documents: self.documents.clone(),
            folders: self.folders.clone(),
            deleted: self.deleted.clone(),
            placeholders: self.placeholders.iter().cloned().collect(),
        }
    }

    /// Take in the result of a sync of this library's current state.
    ///
    /// Returns whether the sync brought in remote changes.
    pub fn apply_sync(&mut self, outcome: &SyncOutcome) -> bool {
        let snapshot = self.clone();
        self.apply_sync_since(&snapshot, outcome)
    }

    /// Take in the result of a sync that started from `snapshot`.
    ///
    /// Changes made here after the snapshot was taken stay on top of the
    /// synced state: edited or created documents and folders, and deletions
    /// the sync did not publish. Those go out with the next sync.
    ///
    /// Returns whether the sync brought in remote changes.
    pub fn apply_sync_since(&mut self, snapshot: &Library, outcome: &SyncOutcome) -> bool {
        let sent_files = snapshot.deleted.file_set();
        let sent_folders = snapshot.deleted.folder_set();
        let mut unsent = Tombstones::default();
        unsent.add_files(
            self.deleted
                .files
                .iter()
                .filter(|id| !sent_files.contains(id.as_str()))
                .cloned(),
            self.deleted.deleted_at,
        );
        for id in &self.deleted.folders {
            if !sent_folders.contains(id.as_str()) {
                unsent.add_folder(id.clone(), self.deleted.deleted_at);
            }
        }

        let dead_files = unsent.file_set();
        let mut documents: Vec<Document> = outcome
            .documents
            .iter()
            .filter(|d| !dead_files.contains(d.id.as_str()))
            .cloned()
            .collect();
        let synced: HashSet<&str> = outcome.placeholders.iter().map(String::as_str).collect();
        let mut placeholders: BTreeSet<String> = documents
            .iter()
            .filter(|d| synced.contains(d.id.as_str()))
            .map(|d| d.id.clone())
            .collect();

        let before: HashMap<&str, &Document> = snapshot
            .documents
            .iter()
            .map(|d| (d.id.as_str(), d))
            .collect();
        let mut position: HashMap<String, usize> = documents
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        for document in &self.documents {
            if before.get(document.id.as_str()) == Some(&document) {
                continue;
            }
            match position.get(&document.id) {
                Some(&i) => documents[i] = document.clone(),
                None => {
                    position.insert(document.id.clone(), documents.len());
                    documents.push(document.clone());
                }
            }
            if self.placeholders.contains(&document.id) {
                placeholders.insert(document.id.clone());
            } else {
                placeholders.remove(&document.id);
            }
        }

        let dead_folders = unsent.folder_set();
        let mut folders: Vec<Folder> = outcome
            .folders
            .iter()
            .filter(|f| !dead_folders.contains(f.id.as_str()))
            .cloned()
            .collect();
        let folders_before: HashMap<&str, &Folder> = snapshot
            .folders
            .iter()
            .map(|f| (f.id.as_str(), f))
            .collect();
        for folder in &self.folders {
            if folders_before.get(folder.id.as_str()) == Some(&folder) {
                continue;
            }
            match folders.iter_mut().find(|f| f.id == folder.id) {
                Some(slot) => *slot = folder.clone(),
                None => folders.push(folder.clone()),
            }
        }

        self.documents = documents;
        self.folders = folders;
        self.deleted = unsent;
        self.placeholders = placeholders;
        outcome.has_changes
    }

    /// Replace everything, e.g. after restoring a backup.
    pub fn replace(&mut self, documents: Vec<Document>, folders: Vec<Folder>) {
        self.documents = documents;
        self.folders = folders;
        self.deleted = Tombstones::default();
        self.placeholders.clear();
    }

    fn document_mut(&mut self, id: &str) -> Result<&mut Document> {
        self.documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| LibraryError::DocumentNotFound(id.to_string()))
    }

    fn ensure_folder(&self, folder_id: Option<&str>) -> Result<()> {
        match folder_id {
            Some(id) if self.folder(id).is_none() => {
                Err(LibraryError::FolderNotFound(id.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn ensure_documents(&self, ids: &[String]) -> Result<()> {
        let known: HashSet<&str> = self.documents.iter().map(|d| d.id.as_str()).collect();
        match ids.iter().find(|id| !known.contains(id.as_str())) {
            Some(missing) => Err(LibraryError::DocumentNotFound(missing.clone())),
            None => Ok(()),
        }
    }
}

fn touch(document: &mut Document) {
    document.updated_at = next_version(document.updated_at, Utc::now());
}

/// `now`, or one millisecond past `previous` when the clock has not moved.
fn next_version(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}
