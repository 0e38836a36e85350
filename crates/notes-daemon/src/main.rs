//! notes-daemon: Headless sync for a markdown note library.
//!
//! Uses the same notes-sync core as the editor, but runs as a native binary
//! against a library file and an OSS bucket (or a local directory).

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use notes_sync::{
    EventBus, Library, ObjectStore, Reconciler, backup, media, restore, upload_image_url,
};
use notes_daemon::{
    Backend, ConfigOverrides, DaemonConfig, LibraryFile, Scheduler, open_store, sync_library,
};

#[derive(Parser, Debug)]
#[command(name = "notes-daemon")]
#[command(about = "Sync a markdown note library with an object storage bucket")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, env = "NOTES_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Path to the library file
    #[arg(short, long, env = "NOTES_LIBRARY", default_value = "library.json", global = true)]
    library: PathBuf,

    #[command(flatten)]
    overrides: ConfigOverrides,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync once and exit
    Sync,
    /// Sync periodically until Ctrl+C
    Run,
    /// Upload a snapshot of the whole library
    Backup,
    /// Replace the library with the uploaded snapshot
    Restore,
    /// Rebuild the remote index from the content objects
    Recover,
    /// Upload an image and print where it went
    UploadImage {
        file: PathBuf,
    },
    /// Create a document
    New {
        /// Folder id (top level when omitted)
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// File to read the content from
        #[arg(long)]
        content: Option<PathBuf>,
    },
    /// Create a folder
    Mkdir {
        name: String,
    },
    /// Move documents into a folder
    Mv {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Target folder id (top level when omitted)
        #[arg(long)]
        to: Option<String>,
    },
    /// Delete documents, or a folder and everything in it
    Rm {
        #[arg(required_unless_present = "folder")]
        ids: Vec<String>,
        #[arg(long, conflicts_with = "ids")]
        folder: Option<String>,
    },
    /// List folders and documents
    Ls,
}

/// Everything a remote command needs.
struct Remote {
    config: DaemonConfig,
    backend: Backend,
    reconciler: Reconciler<Arc<dyn ObjectStore>>,
    events: Arc<EventBus>,
}

impl Remote {
    fn open(args: &Args) -> Result<Self> {
        let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;
        config.apply(&args.overrides);
        let backend = config.backend()?;
        match &backend {
            Backend::Local(dir) => info!("Bucket: local directory {:?}", dir),
            Backend::Oss(storage) => info!("Bucket: oss://{} ({})", storage.bucket, storage.region),
        }

        let store = open_store(&backend)?;
        let events = Arc::new(EventBus::new());
        let reconciler =
            Reconciler::new(store, config.sync.clone())?.with_events(Arc::clone(&events));
        Ok(Self {
            config,
            backend,
            reconciler,
            events,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,notes_daemon=debug"
    } else {
        "info,notes_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let file = LibraryFile::new(args.library.clone());
    debug!("Library file: {:?}", file.path());

    match &args.command {
        Command::Sync => {
            let remote = Remote::open(&args)?;
            let _events = remote.events.subscribe(|event| {
                debug!("{}", serde_json::to_string(&event).unwrap_or_default());
            });
            tokio::select! {
                result = sync_library(&remote.reconciler, &file) => {
                    let outcome = result?;
                    println!(
                        "{:?}: {} documents, {} folders, changes: {}",
                        outcome.kind,
                        outcome.documents.len(),
                        outcome.folders.len(),
                        outcome.has_changes
                    );
                }
                _ = tokio::signal::ctrl_c() => bail!("Sync interrupted"),
            }
        }
        Command::Run => {
            let remote = Remote::open(&args)?;
            let period = remote.config.interval()?;
            info!("Syncing every {:?}. Press Ctrl+C to stop.", period);

            let token = CancellationToken::new();
            let shutdown = token.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => warn!("Cannot listen for Ctrl+C, stopping: {}", e),
                }
                shutdown.cancel();
            });

            let scheduler = Scheduler::new(remote.reconciler, file, period);
            scheduler.run(token).await;
        }
        Command::Backup => {
            let remote = Remote::open(&args)?;
            let library = file.load()?;
            let store = remote.reconciler.store();
            backup(store, remote.reconciler.layout(), library.documents(), library.folders())
                .await?;
            println!(
                "Backed up {} documents and {} folders",
                library.documents().len(),
                library.folders().len()
            );
        }
        Command::Restore => {
            let remote = Remote::open(&args)?;
            let (documents, folders) =
                restore(remote.reconciler.store(), remote.reconciler.layout()).await?;
            let (document_count, folder_count) = (documents.len(), folders.len());
            file.update(|library| {
                library.replace(documents, folders);
                Ok(())
            })?;
            println!(
                "Restored {} documents and {} folders",
                document_count, folder_count
            );
        }
        Command::Recover => {
            let remote = Remote::open(&args)?;
            let report = remote.reconciler.recover().await?;
            println!(
                "Rebuilt index: {} documents ({} orphaned), {} unreadable",
                report.documents.len(),
                report.orphans,
                report.skipped.len()
            );
            for key in &report.skipped {
                println!("  skipped {}", key);
            }
        }
        Command::UploadImage { file: image } => {
            let remote = Remote::open(&args)?;
            let bytes = std::fs::read(image)
                .with_context(|| format!("Failed to read image {}", image.display()))?;
            let name = image
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("Not a file: {}", image.display()))?;

            let store = remote.reconciler.store();
            let layout = remote.reconciler.layout();
            match &remote.backend {
                Backend::Oss(storage) => {
                    let url = upload_image_url(store, layout, storage, &name, &bytes).await?;
                    println!("{}", url);
                }
                Backend::Local(dir) => {
                    let key = media::upload_image(store, layout, &name, &bytes).await?;
                    println!("{}", dir.join(key).display());
                }
            }
        }
        Command::New {
            folder,
            name,
            content,
        } => {
            let content = match content {
                Some(path) => Some(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?,
                ),
                None => None,
            };
            let id = file.update(|library| {
                let id = library.create_document(folder.as_deref())?.id.clone();
                if let Some(name) = name {
                    library.rename_document(&id, name)?;
                }
                if let Some(content) = &content {
                    library.update_content(&id, content)?;
                }
                Ok(id)
            })?;
            println!("{}", id);
        }
        Command::Mkdir { name } => {
            let id = file.update(|library| Ok(library.create_folder(name).id.clone()))?;
            println!("{}", id);
        }
        Command::Mv { ids, to } => {
            let moved = file.update(|library| match ids.as_slice() {
                [id] => {
                    library.move_one(id, to.as_deref())?;
                    Ok(1)
                }
                _ => Ok(library.move_many(ids, to.as_deref())?),
            })?;
            println!("Moved {} document(s)", moved);
        }
        Command::Rm { ids, folder } => {
            let removed = file.update(|library| match (folder, ids.as_slice()) {
                (Some(folder), _) => Ok(library.delete_folder(folder)?),
                (None, [id]) => {
                    library.delete_one(id)?;
                    Ok(1)
                }
                (None, _) => Ok(library.delete_many(ids)?),
            })?;
            println!("Deleted {} document(s)", removed);
        }
        Command::Ls => print_library(&file.load()?),
    }

    Ok(())
}

fn print_library(library: &Library) {
    for folder in library.folders() {
        println!("{}/  [{}]", folder.name, folder.id);
        for document in library.documents_in(Some(&folder.id)) {
            println!(
                "  {}  [{}]  {}",
                document.name,
                document.id,
                document.updated_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    for document in library.documents_in(None) {
        println!(
            "{}  [{}]  {}",
            document.name,
            document.id,
            document.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    let pending = library.pending_deletions();
    if !pending.is_empty() {
        println!(
            "({} document and {} folder deletion(s) not yet synced)",
            pending.files.len(),
            pending.folders.len()
        );
    }
}
