//! Whole-library snapshot backup and restore.
//!
//! Unlike sync, a backup is one object holding every document with its
//! content. Restoring replaces the caller's state outright; no merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::layout::RemoteLayout;
use crate::model::{Document, Folder};
use crate::store::{ObjectStore, StoreError};

/// Version tag written into snapshots.
pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("No backup found in the bucket")]
    NoBackup,

    #[error("Invalid backup: {0}")]
    Invalid(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    files: &'a [Document],
    folders: &'a [Folder],
    export_time: DateTime<Utc>,
    version: &'a str,
}

// Both collections are optional here so a missing one is reported as an
// invalid backup instead of a generic parse error
#[derive(Debug, Deserialize)]
struct StoredSnapshot {
    files: Option<Vec<Document>>,
    folders: Option<Vec<Folder>>,
}

/// Write a snapshot of `documents` and `folders`.
pub async fn backup<S: ObjectStore + ?Sized>(
    store: &S,
    layout: &RemoteLayout,
    documents: &[Document],
    folders: &[Folder],
) -> Result<()> {
    let snapshot = Snapshot {
        files: documents,
        folders,
        export_time: Utc::now(),
        version: BACKUP_VERSION,
    };
    let bytes = serde_json::to_vec_pretty(&snapshot)?;
    store.put(&layout.backup_key(), &bytes).await?;
    info!(
        "Backed up {} documents and {} folders",
        documents.len(),
        folders.len()
    );
    Ok(())
}

/// Read the snapshot back.
pub async fn restore<S: ObjectStore + ?Sized>(
    store: &S,
    layout: &RemoteLayout,
) -> Result<(Vec<Document>, Vec<Folder>)> {
    let bytes = match store.get(&layout.backup_key()).await {
        Ok(bytes) => bytes,
        Err(e) if e.is_not_found() => return Err(BackupError::NoBackup),
        Err(e) => return Err(e.into()),
    };
    let snapshot: StoredSnapshot =
        serde_json::from_slice(&bytes).map_err(|e| BackupError::Invalid(e.to_string()))?;

    match (snapshot.files, snapshot.folders) {
        (Some(files), Some(folders)) => {
            info!(
                "Restored {} documents and {} folders",
                files.len(),
                folders.len()
            );
            Ok((files, folders))
        }
        _ => Err(BackupError::Invalid("missing files or folders".into())),
    }
}
