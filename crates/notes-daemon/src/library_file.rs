//! Persistence for the local library.
//!
//! The whole library (documents, folders and pending deletions) is one JSON
//! file. Saves write a temp file next to it and rename it into place.

use anyhow::{Context, Result};
use notes_sync::Library;
use std::fs;
use std::path::{Path, PathBuf};

pub struct LibraryFile {
    path: PathBuf,
}

impl LibraryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the library. A missing file is an empty library.
    pub fn load(&self) -> Result<Library> {
        if !self.path.exists() {
            return Ok(Library::new());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read library {}", self.path.display()))?;
        let library = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse library {}", self.path.display()))?;
        Ok(library)
    }

    pub fn save(&self, library: &Library) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(library)?;
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace library {}", self.path.display()))?;
        Ok(())
    }

    /// Load, apply `change`, save.
    pub fn update<T>(&self, change: impl FnOnce(&mut Library) -> Result<T>) -> Result<T> {
        let mut library = self.load()?;
        let value = change(&mut library)?;
        self.save(&library)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty_library() {
        let temp_dir = TempDir::new().unwrap();
        let file = LibraryFile::new(temp_dir.path().join("library.json"));
        assert_eq!(file.load().unwrap(), Library::new());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let file = LibraryFile::new(temp_dir.path().join("nested/library.json"));

        let id = file
            .update(|library| {
                let folder = library.create_folder("Work").id.clone();
                let id = library.create_document(Some(&folder))?.id.clone();
                library.update_content(&id, "# Standup")?;
                Ok(id)
            })
            .unwrap();

        let reloaded = file.load().unwrap();
        assert_eq!(reloaded.document(&id).unwrap().content, "# Standup");
        assert_eq!(reloaded.folders().len(), 1);
        assert!(!temp_dir.path().join("nested/library.json.tmp").exists());
    }

    #[test]
    fn test_pending_deletions_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let file = LibraryFile::new(temp_dir.path().join("library.json"));

        file.update(|library| {
            let id = library.create_document(None)?.id.clone();
            library.delete_one(&id)?;
            Ok(())
        })
        .unwrap();

        let reloaded = file.load().unwrap();
        assert_eq!(reloaded.pending_deletions().files.len(), 1);
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let file = LibraryFile::new(temp_dir.path().join("library.json"));
        file.update(|library| {
            library.create_document(None)?;
            Ok(())
        })
        .unwrap();
        let before = file.load().unwrap();

        let result = file.update(|library| {
            library.create_document(None)?;
            library.delete_one("missing")?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(file.load().unwrap(), before);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("library.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(LibraryFile::new(path).load().is_err());
    }
}
