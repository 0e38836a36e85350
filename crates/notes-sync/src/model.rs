//! Note library data model and the remote index wire format.
//!
//! All types serialize with camelCase keys so the JSON written to the bucket
//! matches what the editor front-end reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tombstones::Tombstones;

/// Version tag written into sync indexes.
pub const INDEX_VERSION: &str = "2.0";

/// A Markdown document.
///
/// `updated_at` is the only ordering signal used when two copies of the same
/// document disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub name: String,
    pub content: String,
    pub folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Metadata projection stored in the remote index.
    pub fn meta(&self) -> DocumentMeta {
        DocumentMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            folder_id: self.folder_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Content blob stored next to the index.
    pub fn blob(&self) -> ContentBlob {
        ContentBlob {
            id: self.id.clone(),
            content: self.content.clone(),
        }
    }
}

/// A folder. Folders carry no modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Document without its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: String,
    pub name: String,
    pub folder_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMeta {
    /// Rebuild a full document from metadata and a body.
    pub fn with_content(&self, content: String) -> Document {
        Document {
            id: self.id.clone(),
            name: self.name.clone(),
            content,
            folder_id: self.folder_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Body of one document, stored at `articles/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlob {
    pub id: String,
    pub content: String,
}

/// Remote manifest: folders, per-document metadata and deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIndex {
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub file_metadata: Vec<DocumentMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_items: Option<Tombstones>,
    pub export_time: DateTime<Utc>,
    pub version: String,
}

impl RemoteIndex {
    /// Build an index at the current format version. Empty tombstone sets
    /// are left out.
    pub fn new(
        file_metadata: Vec<DocumentMeta>,
        folders: &[Folder],
        tombstones: &Tombstones,
        export_time: DateTime<Utc>,
    ) -> Self {
        Self {
            folders: folders.to_vec(),
            file_metadata,
            deleted_items: (!tombstones.is_empty()).then(|| tombstones.clone()),
            export_time,
            version: INDEX_VERSION.to_string(),
        }
    }

    /// True when the index lists neither documents nor folders.
    pub fn is_empty(&self) -> bool {
        self.file_metadata.is_empty() && self.folders.is_empty()
    }

    /// Remote tombstones, or an empty set when the index has none.
    pub fn tombstones(&self) -> Tombstones {
        self.deleted_items.clone().unwrap_or_default()
    }
}
