//! Sync status values and the reporter that delivers them to the caller

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

use crate::manifest::ManifestSummary;

/// Progress of a running scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanProgress {
    pub files_processed: u64,
    pub files_total: u64,
    pub chunks_indexed: u64,
}

/// Result of the last successful reconcile
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchSummary {
    pub branch: String,
    pub last_sync_time: DateTime<Utc>,
    pub total_files: u64,
    pub total_chunks: u64,
    pub manifest: Option<ManifestSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    Idle {
        reason: Option<String>,
    },
    Scanning {
        message: String,
        progress: ScanProgress,
    },
    Watching(WatchSummary),
    Error {
        message: String,
    },
}

impl SyncStatus {
    pub fn idle() -> Self {
        SyncStatus::Idle { reason: None }
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self, SyncStatus::Scanning { .. })
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle { reason: None } => write!(f, "idle"),
            SyncStatus::Idle {
                reason: Some(reason),
            } => write!(f, "idle ({})", reason),
            SyncStatus::Scanning { message, progress } => write!(
                f,
                "scanning ({}): {}/{} files, {} chunks",
                message, progress.files_processed, progress.files_total, progress.chunks_indexed
            ),
            SyncStatus::Watching(summary) => write!(
                f,
                "watching {}: {} files, {} chunks, synced {}",
                summary.branch,
                summary.total_files,
                summary.total_chunks,
                summary.last_sync_time.format("%Y-%m-%d %H:%M:%S")
            ),
            SyncStatus::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Delivers status updates to the owning caller.
///
/// Clones share one outlet. Once [`StatusReporter::close`] runs, every clone
/// (including ones held by a reconcile still in flight) silently drops what
/// it is given and the caller's stream ends.
#[derive(Clone)]
pub struct StatusReporter {
    outlet: Arc<Mutex<Option<mpsc::UnboundedSender<SyncStatus>>>>,
}

impl StatusReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncStatus>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outlet: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn emit(&self, status: SyncStatus) {
        let Ok(guard) = self.outlet.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            trace!("status: {}", status);
            // Receiver gone means nobody is listening; nothing to do
            let _ = tx.send(status);
        }
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.outlet.lock() {
            guard.take();
        }
    }
}
