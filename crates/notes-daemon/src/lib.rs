//! notes-daemon library: Exposes the daemon components for testing.
//!
//! A thin layer over notes-sync with the native pieces: directory and OSS
//! object stores, the library file, configuration and the sync loop.

pub mod config;
pub mod library_file;
pub mod local_store;
pub mod oss_store;
pub mod scheduler;

// Re-export key types for convenience
pub use config::{Backend, ConfigOverrides, DaemonConfig};
pub use library_file::LibraryFile;
pub use local_store::LocalStore;
pub use oss_store::OssStore;
pub use scheduler::{Scheduler, sync_library};

use notes_sync::ObjectStore;
use std::sync::Arc;

/// Open the object store a backend points at.
pub fn open_store(backend: &Backend) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match backend {
        Backend::Local(dir) => Arc::new(LocalStore::new(dir.clone())),
        Backend::Oss(storage) => Arc::new(OssStore::new(storage.clone())?),
    };
    Ok(store)
}
