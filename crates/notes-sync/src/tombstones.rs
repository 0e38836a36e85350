//! Deletion records carried in the remote index.
//!
//! Ids are kept in insertion order (oldest first) so retention can drop the
//! oldest deletions when the set grows past its limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default cap on retained ids per kind (documents, folders).
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 10_000;

/// Ids of deleted documents and folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstones {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    /// Time of the most recent deletion recorded in this set
    #[serde(default)]
    pub deleted_at: DateTime<Utc>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.folders.is_empty()
    }

    pub fn contains_file(&self, id: &str) -> bool {
        self.files.iter().any(|f| f == id)
    }

    pub fn contains_folder(&self, id: &str) -> bool {
        self.folders.iter().any(|f| f == id)
    }

    /// Lookup set over deleted document ids.
    pub fn file_set(&self) -> HashSet<&str> {
        self.files.iter().map(String::as_str).collect()
    }

    /// Lookup set over deleted folder ids.
    pub fn folder_set(&self) -> HashSet<&str> {
        self.folders.iter().map(String::as_str).collect()
    }

    /// Record a deleted document. Returns false if it was already recorded.
    pub fn add_file(&mut self, id: impl Into<String>, at: DateTime<Utc>) -> bool {
        let id = id.into();
        if self.contains_file(&id) {
            return false;
        }
        self.files.push(id);
        self.touch(at);
        true
    }

    /// Record several deleted documents at once.
    ///
    /// Returns the ids that were not recorded before, in input order.
    pub fn add_files(
        &mut self,
        ids: impl IntoIterator<Item = String>,
        at: DateTime<Utc>,
    ) -> Vec<String> {
        let mut seen: HashSet<String> = self.files.iter().cloned().collect();
        let added: Vec<String> = ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if !added.is_empty() {
            self.files.extend(added.iter().cloned());
            self.touch(at);
        }
        added
    }

    /// Record a deleted folder. Returns false if it was already recorded.
    pub fn add_folder(&mut self, id: impl Into<String>, at: DateTime<Utc>) -> bool {
        let id = id.into();
        if self.contains_folder(&id) {
            return false;
        }
        self.folders.push(id);
        self.touch(at);
        true
    }

    /// Union with another set. Ids already present keep their position.
    pub fn merge(&mut self, other: &Tombstones) {
        let mut seen: HashSet<String> = self.files.iter().cloned().collect();
        for id in &other.files {
            if seen.insert(id.clone()) {
                self.files.push(id.clone());
            }
        }

        let mut seen: HashSet<String> = self.folders.iter().cloned().collect();
        for id in &other.folders {
            if seen.insert(id.clone()) {
                self.folders.push(id.clone());
            }
        }

        self.touch(other.deleted_at);
    }

    /// Drop the oldest ids so each kind holds at most `limit` entries.
    ///
    /// Returns the number of ids dropped.
    pub fn prune(&mut self, limit: usize) -> usize {
        let mut dropped = 0;
        if self.files.len() > limit {
            let excess = self.files.len() - limit;
            self.files.drain(..excess);
            dropped += excess;
        }
        if self.folders.len() > limit {
            let excess = self.folders.len() - limit;
            self.folders.drain(..excess);
            dropped += excess;
        }
        dropped
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.deleted_at {
            self.deleted_at = at;
        }
    }
}
