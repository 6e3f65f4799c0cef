//! Sync orchestrator - single-flight reconcile state machine
//!
//! The orchestrator owns the last fully processed snapshot and the in-flight
//! flag. Each trigger is turned into a [`Dispatch`]: discarded while a
//! reconcile runs, settled on the spot (no change, detached HEAD), or handed
//! back as a [`Reconciliation`] the caller drives to completion and then
//! returns through [`SyncOrchestrator::complete`].

use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::{classify, Transition};
use crate::error::WatchError;
use crate::git::{self, Snapshot};
use crate::manifest::{ManifestSource, ManifestSummary};
use crate::scan::{ProgressSink, ScanPipeline, ScanRequest};
use crate::status::{ScanProgress, StatusReporter, SyncStatus, WatchSummary};

/// Counters shared with the watcher handle
#[derive(Debug, Default)]
pub struct WatcherStats {
    pub triggers_received: AtomicU64,
    pub triggers_discarded: AtomicU64,
    pub scans_started: AtomicU64,
    pub scans_failed: AtomicU64,
}

impl WatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            triggers_received: self.triggers_received.load(Ordering::SeqCst),
            triggers_discarded: self.triggers_discarded.load(Ordering::SeqCst),
            scans_started: self.scans_started.load(Ordering::SeqCst),
            scans_failed: self.scans_failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub triggers_received: u64,
    pub triggers_discarded: u64,
    pub scans_started: u64,
    pub scans_failed: u64,
}

/// What the orchestrator decided for one trigger
#[derive(Debug)]
pub enum Dispatch {
    /// A reconcile is running; the trigger was dropped
    Discarded,
    /// The head could not be read; the trigger was ignored
    Unreadable(WatchError),
    /// Handled without a scan (`NoChange` or `DetachedEntered`)
    Settled(Transition),
    /// A scan is needed; run it and pass the outcome to `complete`
    Reconcile(Reconciliation),
}

/// Result of one reconcile run
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub snapshot: Snapshot,
    pub transition: Transition,
    pub result: std::result::Result<WatchSummary, String>,
}

impl ReconcileOutcome {
    pub fn status(&self) -> SyncStatus {
        match &self.result {
            Ok(summary) => SyncStatus::Watching(summary.clone()),
            Err(message) => SyncStatus::Error {
                message: message.clone(),
            },
        }
    }
}

pub struct SyncOrchestrator {
    repo_root: PathBuf,
    manifest: Option<Arc<dyn ManifestSource>>,
    pipeline: Arc<dyn ScanPipeline>,
    reporter: StatusReporter,
    stats: Arc<WatcherStats>,
    last_snapshot: Option<Snapshot>,
    in_flight: bool,
    discarded_in_flight: u32,
    status: SyncStatus,
}

impl SyncOrchestrator {
    pub fn new(
        repo_root: PathBuf,
        manifest: Option<Arc<dyn ManifestSource>>,
        pipeline: Arc<dyn ScanPipeline>,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            repo_root,
            manifest,
            pipeline,
            reporter,
            stats: Arc::new(WatcherStats::default()),
            last_snapshot: None,
            in_flight: false,
            discarded_in_flight: 0,
            status: SyncStatus::idle(),
        }
    }

    /// Start from a known snapshot instead of establishing on the first trigger
    pub fn with_baseline(mut self, snapshot: Snapshot) -> Self {
        self.last_snapshot = Some(snapshot);
        self
    }

    pub fn stats(&self) -> Arc<WatcherStats> {
        self.stats.clone()
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    pub fn last_snapshot(&self) -> Option<&Snapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Handle one trigger: read the head and decide what to do
    pub fn handle_trigger(&mut self) -> Dispatch {
        self.stats.triggers_received.fetch_add(1, Ordering::SeqCst);

        if self.in_flight {
            return self.discard();
        }

        match git::read_snapshot(&self.repo_root) {
            Ok(snapshot) => self.observe(snapshot),
            Err(e) if e.is_unreadable_head() => {
                debug!("Ignoring trigger, head unreadable: {}", e);
                Dispatch::Unreadable(e)
            }
            Err(e) => {
                warn!("Ignoring trigger, failed to read head: {}", e);
                Dispatch::Unreadable(e)
            }
        }
    }

    /// Classify an already-read snapshot against the last processed one
    pub fn observe(&mut self, snapshot: Snapshot) -> Dispatch {
        if self.in_flight {
            return self.discard();
        }

        let transition = classify(self.last_snapshot.as_ref(), &snapshot);

        if !transition.needs_reconcile() {
            if transition == Transition::DetachedEntered {
                info!(
                    "HEAD detached at {}, indexing suspended",
                    snapshot.short_revision()
                );
                self.status = SyncStatus::Idle {
                    reason: Some(format!(
                        "detached HEAD at {}; indexing suspended until a branch is checked out",
                        snapshot.short_revision()
                    )),
                };
                self.reporter.emit(self.status.clone());
                self.last_snapshot = Some(snapshot);
            } else {
                debug!("No head change at {}", snapshot.short_revision());
            }
            return Dispatch::Settled(transition);
        }

        let Some(branch) = snapshot.branch().map(str::to_string) else {
            return Dispatch::Settled(Transition::NoChange);
        };

        info!("{}", transition);
        self.in_flight = true;
        self.discarded_in_flight = 0;
        self.stats.scans_started.fetch_add(1, Ordering::SeqCst);

        Dispatch::Reconcile(Reconciliation {
            repo_root: self.repo_root.clone(),
            branch,
            snapshot,
            transition,
            manifest: self.manifest.clone(),
            pipeline: self.pipeline.clone(),
            reporter: self.reporter.clone(),
        })
    }

    /// Finish a reconcile: clear the in-flight flag and adopt its snapshot.
    ///
    /// Returns how many triggers were discarded while it ran.
    pub fn complete(&mut self, outcome: &ReconcileOutcome) -> u32 {
        if outcome.result.is_err() {
            self.stats.scans_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.status = outcome.status();
        self.last_snapshot = Some(outcome.snapshot.clone());
        self.finish_in_flight()
    }

    /// Clear the in-flight flag after a reconcile that never produced an outcome
    pub fn abandon(&mut self, reason: &str) -> u32 {
        warn!("Reconcile abandoned: {}", reason);
        self.stats.scans_failed.fetch_add(1, Ordering::SeqCst);
        self.status = SyncStatus::Error {
            message: reason.to_string(),
        };
        self.reporter.emit(self.status.clone());
        self.finish_in_flight()
    }

    fn finish_in_flight(&mut self) -> u32 {
        self.in_flight = false;
        std::mem::take(&mut self.discarded_in_flight)
    }

    fn discard(&mut self) -> Dispatch {
        self.discarded_in_flight += 1;
        self.stats.triggers_discarded.fetch_add(1, Ordering::SeqCst);
        debug!("Reconcile in flight, trigger discarded");
        Dispatch::Discarded
    }
}

/// One scan cycle, detached from the orchestrator so it can run as its own task
pub struct Reconciliation {
    repo_root: PathBuf,
    branch: String,
    snapshot: Snapshot,
    transition: Transition,
    manifest: Option<Arc<dyn ManifestSource>>,
    pipeline: Arc<dyn ScanPipeline>,
    reporter: StatusReporter,
}

impl fmt::Debug for Reconciliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciliation")
            .field("branch", &self.branch)
            .field("snapshot", &self.snapshot)
            .field("transition", &self.transition)
            .field("has_manifest_source", &self.manifest.is_some())
            .finish()
    }
}

impl Reconciliation {
    pub fn transition(&self) -> &Transition {
        &self.transition
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Fetch manifest, scan, refresh manifest, report. Never fails: every
    /// error ends up in the outcome as an `Error` status message.
    pub async fn run(self) -> ReconcileOutcome {
        let message = self.transition.to_string();
        self.reporter.emit(SyncStatus::Scanning {
            message: message.clone(),
            progress: ScanProgress::default(),
        });

        let manifest = self.fetch_manifest().await;
        if manifest.is_none() {
            debug!("Scanning {} without a manifest", self.branch);
        }

        let progress_reporter = self.reporter.clone();
        let progress_message = message.clone();
        let sink: ProgressSink = Arc::new(move |progress| {
            progress_reporter.emit(SyncStatus::Scanning {
                message: progress_message.clone(),
                progress,
            });
        });

        let request = ScanRequest {
            repo_root: self.repo_root.clone(),
            branch: self.branch.clone(),
            revision: self.snapshot.revision().to_string(),
            manifest,
        };

        let result = match self.pipeline.scan(request, sink).await {
            Ok(report) if report.success => {
                let refreshed = self.fetch_manifest().await;
                let (total_files, total_chunks) = match &refreshed {
                    Some(m) => (m.total_files, m.total_chunks),
                    None => (report.files_processed, report.chunks_indexed),
                };
                info!(
                    "Scan of {} complete: {} files, {} chunks",
                    self.branch, total_files, total_chunks
                );
                Ok(WatchSummary {
                    branch: self.branch.clone(),
                    last_sync_time: Utc::now(),
                    total_files,
                    total_chunks,
                    manifest: refreshed,
                })
            }
            Ok(report) => {
                let reason = report.failure_message();
                warn!("Scan of {} failed: {}", self.branch, reason);
                Err(reason)
            }
            Err(e) => {
                warn!("Scan of {} failed: {}", self.branch, e);
                Err(e.to_string())
            }
        };

        let outcome = ReconcileOutcome {
            snapshot: self.snapshot,
            transition: self.transition,
            result,
        };
        self.reporter.emit(outcome.status());
        outcome
    }

    /// Best-effort manifest lookup; any failure means "no manifest"
    async fn fetch_manifest(&self) -> Option<ManifestSummary> {
        let source = self.manifest.as_ref()?;
        match source.fetch(&self.branch).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!("Proceeding without manifest for {}: {}", self.branch, e);
                None
            }
        }
    }
}
