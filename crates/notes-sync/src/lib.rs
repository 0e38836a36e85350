//! notes-sync: Synchronization of a markdown note library with an object
//! storage bucket.
//!
//! This crate provides the core functionality for:
//! - The note data model and the remote index/blob layout
//! - Last-write-wins merging with deletion tombstones
//! - A reconciler that drives a sync through an `ObjectStore`
//! - Backup/restore snapshots, orphan recovery and image uploads
//! - The local `Library` the editor mutates between syncs

pub mod backup;
pub mod config;
pub mod events;
pub mod layout;
pub mod library;
pub mod media;
pub mod model;
pub mod reconcile;
pub mod reconciler;
pub mod recovery;
pub mod store;
pub mod tombstones;

pub use backup::{BackupError, backup, restore};
pub use config::{ConfigError, StorageConfig, SyncOptions};
pub use events::{EventBus, Subscription, SyncEvent};
pub use layout::RemoteLayout;
pub use library::{Library, LibraryError};
pub use media::{MediaError, upload_image, upload_image_url};
pub use model::{ContentBlob, Document, DocumentMeta, Folder, RemoteIndex};
pub use reconcile::{LocalState, MergeKind, MergeResult, RemoteState};
pub use reconciler::{Reconciler, SyncError, SyncKind, SyncOutcome};
pub use recovery::RecoveryReport;
pub use store::{InMemoryStore, ObjectMeta, ObjectStore, StoreError};
pub use tombstones::Tombstones;
