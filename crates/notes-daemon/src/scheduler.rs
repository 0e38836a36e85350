//! Periodic sync loop.
//!
//! One sync at a time: the next tick is only awaited after the previous sync
//! finished, and ticks missed while syncing are skipped. Cancelling the token
//! drops an in-flight sync, which cancels all of its transfers.

use anyhow::Result;
use notes_sync::{ObjectStore, Reconciler, SyncOutcome};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::library_file::LibraryFile;

/// Sync the library file once and save the merged result.
///
/// The file is read again after the network round trip, so edits saved
/// while the sync was running are kept and go out with the next sync.
pub async fn sync_library<S: ObjectStore>(
    reconciler: &Reconciler<S>,
    file: &LibraryFile,
) -> Result<SyncOutcome> {
    let snapshot = file.load()?;
    let outcome = reconciler.sync_with(snapshot.local_state()).await?;

    if !outcome.degraded.is_empty() {
        warn!(
            "{} document(s) could not be downloaded: {}",
            outcome.degraded.len(),
            outcome.degraded.join(", ")
        );
    }
    let changed = file.update(|library| {
        if *library != snapshot {
            debug!("Library changed during sync, keeping local edits");
        }
        Ok(library.apply_sync_since(&snapshot, &outcome))
    })?;
    if changed {
        info!("Library updated from remote");
    }
    Ok(outcome)
}

pub struct Scheduler<S: ObjectStore> {
    reconciler: Reconciler<S>,
    file: LibraryFile,
    period: Duration,
}

impl<S: ObjectStore> Scheduler<S> {
    pub fn new(reconciler: Reconciler<S>, file: LibraryFile, period: Duration) -> Self {
        Self {
            reconciler,
            file,
            period,
        }
    }

    /// Sync every period until `token` is cancelled.
    ///
    /// Failed syncs are logged and retried on the next tick. Returns the
    /// number of successful syncs.
    pub async fn run(&self, token: CancellationToken) -> usize {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut completed = 0;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    warn!("Shutdown during sync, abandoning it");
                    break;
                }
                result = sync_library(&self.reconciler, &self.file) => match result {
                    Ok(outcome) => {
                        completed += 1;
                        info!(
                            "Sync #{} done: {} documents, changes: {}",
                            completed,
                            outcome.documents.len(),
                            outcome.has_changes
                        );
                    }
                    Err(e) => error!("Sync failed: {:#}", e),
                },
            }
        }

        info!("Scheduler stopped after {} sync(s)", completed);
        completed
    }
}
