//! Deterministic object keys.

use chrono::{DateTime, Utc};

use crate::config::DEFAULT_ROOT;

/// Key scheme for everything this crate writes to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The sync index: `{root}/sync/index.json`
    pub fn index_key(&self) -> String {
        format!("{}/sync/index.json", self.root)
    }

    /// Prefix under which every content blob lives
    pub fn articles_prefix(&self) -> String {
        format!("{}/sync/articles/", self.root)
    }

    /// Content blob for one document: `{root}/sync/articles/{id}.json`
    pub fn content_key(&self, id: &str) -> String {
        format!("{}{}.json", self.articles_prefix(), id)
    }

    /// Document id from a content blob key, if the key is one
    pub fn id_from_content_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let prefix = self.articles_prefix();
        let id = key.strip_prefix(prefix.as_str())?.strip_suffix(".json")?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }

    /// Whole-library snapshot
    pub fn backup_key(&self) -> String {
        format!("{}/backup/freeeditor-backup.json", self.root)
    }

    /// Date-partitioned image key: `{root}/{yyyymmdd}/{millis}-{suffix}.{ext}`
    pub fn image_key(&self, now: DateTime<Utc>, suffix: &str, ext: &str) -> String {
        format!(
            "{}/{}/{}-{}.{}",
            self.root,
            now.format("%Y%m%d"),
            now.timestamp_millis(),
            suffix,
            ext
        )
    }
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

/// Check that a document id can be embedded in an object key.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\')
        && !id.chars().any(|c| c.is_control())
}
