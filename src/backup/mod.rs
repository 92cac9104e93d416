use std::os::raw::c_int;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::backup::{Backup, StepResult};
use rusqlite::ffi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::ManagedConnection;
use crate::{Error, Result};

/// Progress of a running or finished backup, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupProgress {
    pub remaining: i64,
    pub page_count: i64,
    pub copied: i64,
}

pub type BackupProgressFn = Arc<dyn Fn(BackupProgress) + Send + Sync>;

#[derive(Clone)]
pub struct BackupOptions {
    /// Pages copied per step; 0 copies all remaining pages in one step.
    pub pages_per_step: i32,
    /// Pause between steps, yielding the source database to other writers.
    pub sleep_interval: Duration,
    /// Schema to copy on both sides ("main", "temp", or an attached name).
    pub database: String,
    /// Invoked after every step with `(remaining, page_count, copied)`.
    pub progress: Option<BackupProgressFn>,
    /// Checked at every inter-step point; cancelling aborts the session.
    pub cancel: Option<CancellationToken>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            pages_per_step: 0,
            sleep_interval: Duration::from_millis(250),
            database: "main".to_string(),
            progress: None,
            cancel: None,
        }
    }
}

impl std::fmt::Debug for BackupOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOptions")
            .field("pages_per_step", &self.pages_per_step)
            .field("sleep_interval", &self.sleep_interval)
            .field("database", &self.database)
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Consecutive non-advancing Busy/Locked steps tolerated before the copy is
/// abandoned. A writer that never yields would otherwise spin forever.
const MAX_STALLED_STEPS: usize = 32;

/// Drive the incremental copy loop between two exclusively held connections.
///
/// Runs synchronously; the session layer dispatches it to a blocking worker.
/// A step failure aborts the session and reports how many pages were copied;
/// pages already written to the target are left as the engine produced them.
pub(crate) fn run(
    source: &ManagedConnection,
    target: &mut ManagedConnection,
    options: &BackupOptions,
) -> Result<BackupProgress> {
    // Handles from different loaded engine instances must never be mixed;
    // the session layer checks this too, this is the last line of defense.
    if source.provenance() != target.provenance() {
        return Err(Error::HandleIncompatible {
            source_instance: source.provenance(),
            target_instance: target.provenance(),
        });
    }

    let schema = options.database.as_str();
    let backup = Backup::new_with_names(source.raw(), schema, target.raw_mut(), schema)
        .map_err(|e| Error::BackupStep {
            pages_copied: 0,
            source: e,
        })?;

    let pages: c_int = if options.pages_per_step <= 0 {
        -1
    } else {
        options.pages_per_step
    };

    let mut copied: i64 = 0;
    let mut stalled = 0;
    loop {
        if let Some(token) = &options.cancel {
            if token.is_cancelled() {
                info!(copied, "backup cancelled");
                return Err(Error::BackupCancelled {
                    pages_copied: copied,
                });
            }
        }

        let step = backup.step(pages);
        let progress = backup.progress();
        let advanced = i64::from(progress.pagecount - progress.remaining) > copied;
        copied = i64::from(progress.pagecount - progress.remaining);
        let snapshot = BackupProgress {
            remaining: i64::from(progress.remaining),
            page_count: i64::from(progress.pagecount),
            copied,
        };

        match step {
            Ok(StepResult::Done) => {
                if let Some(notify) = &options.progress {
                    notify(snapshot);
                }
                info!(pages = snapshot.page_count, "backup complete");
                return Ok(snapshot);
            }
            // Busy/Locked mean the source or target was momentarily in use;
            // the next step retries after the inter-step pause, up to the
            // stall bound.
            Ok(_) => {
                stalled = if advanced { 0 } else { stalled + 1 };
                if stalled >= MAX_STALLED_STEPS {
                    info!(copied, "backup made no progress, giving up");
                    return Err(Error::BackupStep {
                        pages_copied: copied,
                        source: rusqlite::Error::SqliteFailure(
                            ffi::Error::new(ffi::SQLITE_BUSY),
                            Some("backup stalled: source or target stayed busy".to_string()),
                        ),
                    });
                }
                debug!(remaining = snapshot.remaining, copied, "backup step");
                if let Some(notify) = &options.progress {
                    notify(snapshot);
                }
                std::thread::sleep(options.sleep_interval);
            }
            Err(e) => {
                return Err(Error::BackupStep {
                    pages_copied: copied,
                    source: e,
                });
            }
        }
    }
}
