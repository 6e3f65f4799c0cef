//! Watcher - the single consumer loop behind the trigger channels
//!
//! [`Watcher::start`] wires the trigger source, the orchestrator and the
//! optional journal together and spawns one task that owns all of them.
//! Triggers keep arriving while a reconciliation runs on its own task, so
//! the orchestrator can discard them instead of letting them queue up.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::WatchError;
use crate::git::RepoLayout;
use crate::manifest::{HttpManifestClient, ManifestSource};
use crate::scan::{CommandPipeline, ScanPipeline};
use crate::state::{EventJournal, EventType, JournalEntryBuilder};
use crate::status::{StatusReporter, SyncStatus};
use crate::sync::{Dispatch, ReconcileOutcome, StatsSnapshot, SyncOrchestrator, WatcherStats};
use crate::trigger::{SetupReport, TriggerKind, TriggerSource};

/// Pending wake-ups beyond this are coalesced by the producers
const TRIGGER_QUEUE_DEPTH: usize = 64;

/// Knobs for the trigger channels and the catch-up re-check
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub push_enabled: bool,
    pub catch_up: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            push_enabled: true,
            catch_up: true,
        }
    }
}

impl WatcherOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            poll_interval: config.poll_interval()?,
            push_enabled: config.watcher.push_enabled,
            catch_up: config.watcher.catch_up,
        })
    }
}

/// Everything needed to start watching one repository
pub struct Watcher {
    repo_root: PathBuf,
    pipeline: Arc<dyn ScanPipeline>,
    manifest: Option<Arc<dyn ManifestSource>>,
    journal: Option<EventJournal>,
    options: WatcherOptions,
}

impl Watcher {
    pub fn new(repo_root: impl Into<PathBuf>, pipeline: Arc<dyn ScanPipeline>) -> Self {
        Self {
            repo_root: repo_root.into(),
            pipeline,
            manifest: None,
            journal: None,
            options: WatcherOptions::default(),
        }
    }

    /// Assemble a watcher from configuration: command pipeline, optional
    /// manifest client, optional journal
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        if config.scan.command.is_empty() {
            return Err(anyhow!(
                "No scan pipeline configured; set scan.command in the config file"
            ));
        }
        let pipeline =
            CommandPipeline::from_config(config).context("Failed to set up scan pipeline")?;

        let mut watcher = Self::new(config.repository_root()?, Arc::new(pipeline))
            .with_options(WatcherOptions::from_config(config)?);

        if let Some(client) = HttpManifestClient::from_config(config) {
            watcher = watcher.with_manifest(Arc::new(client));
        }

        if config.journal.enabled {
            let journal = EventJournal::open_at(Path::new(&config.journal.path))
                .context("Failed to open transition journal")?;
            match journal.prune_older_than(config.journal.retention_days) {
                Ok(0) => {}
                Ok(pruned) => info!("Pruned {} journal entries", pruned),
                Err(e) => warn!("Journal pruning failed: {:#}", e),
            }
            watcher = watcher.with_journal(journal);
        }

        Ok(watcher)
    }

    pub fn with_manifest(mut self, manifest: Arc<dyn ManifestSource>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn with_journal(mut self, journal: EventJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_options(mut self, options: WatcherOptions) -> Self {
        self.options = options;
        self
    }

    /// Start the trigger channels and the consumer loop.
    ///
    /// Must be called inside a tokio runtime. Channel setup problems never
    /// fail the start; they are listed in the returned [`SetupReport`].
    pub fn start(self) -> (WatcherHandle, SetupReport) {
        let (reporter, statuses) = StatusReporter::channel();
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let disposed = Arc::new(AtomicBool::new(false));

        let (triggers, report) = match RepoLayout::discover(&self.repo_root) {
            Ok(layout) => TriggerSource::start(
                &layout,
                self.options.poll_interval,
                self.options.push_enabled,
                trigger_tx.clone(),
            ),
            Err(e) => TriggerSource::poll_only(
                self.options.poll_interval,
                trigger_tx.clone(),
                WatchError::SetupFailure {
                    path: self.repo_root.clone(),
                    reason: e.to_string(),
                },
            ),
        };

        let orchestrator = SyncOrchestrator::new(
            self.repo_root.clone(),
            self.manifest,
            self.pipeline,
            reporter.clone(),
        );
        let stats = orchestrator.stats();

        reporter.emit(orchestrator.status().clone());
        let _ = trigger_tx.try_send(TriggerKind::Startup);

        info!(
            "Watching {} (poll every {:?}, push {})",
            self.repo_root.display(),
            self.options.poll_interval,
            if report.push_active() { "on" } else { "off" }
        );

        let watch_loop = WatchLoop {
            orchestrator,
            journal: self.journal,
            catch_up: self.options.catch_up,
            in_flight: None,
            disposed: disposed.clone(),
        };
        let task = tokio::spawn(watch_loop.run(trigger_rx, shutdown_rx));

        (
            WatcherHandle {
                triggers: Some(triggers),
                trigger_tx,
                shutdown_tx,
                disposed,
                reporter,
                statuses,
                stats,
                task: Some(task),
            },
            report,
        )
    }
}

/// Owner's side of a running watcher
pub struct WatcherHandle {
    triggers: Option<TriggerSource>,
    trigger_tx: mpsc::Sender<TriggerKind>,
    shutdown_tx: broadcast::Sender<()>,
    disposed: Arc<AtomicBool>,
    reporter: StatusReporter,
    statuses: mpsc::UnboundedReceiver<SyncStatus>,
    stats: Arc<WatcherStats>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    /// Next status update; `None` once the watcher has been disposed
    pub async fn next_status(&mut self) -> Option<SyncStatus> {
        self.statuses.recv().await
    }

    /// Request an immediate check. Returns false if a wake-up could not be queued.
    pub fn trigger(&self) -> bool {
        self.trigger_tx.try_send(TriggerKind::Manual).is_ok()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop both trigger channels, end the status stream and wait for the
    /// consumer loop to exit. A reconciliation still running finishes on
    /// its own task and its result is dropped.
    pub async fn dispose(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Watcher loop ended abnormally: {}", e);
            }
        }
        info!("Watcher disposed");
    }

    fn shutdown(&mut self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(mut triggers) = self.triggers.take() {
            triggers.stop();
        }
        self.reporter.close();
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the consumer task
struct WatchLoop {
    orchestrator: SyncOrchestrator,
    journal: Option<EventJournal>,
    catch_up: bool,
    in_flight: Option<JoinHandle<ReconcileOutcome>>,
    /// Set by the handle before the shutdown signal; no trigger is handled after it
    disposed: Arc<AtomicBool>,
}

impl WatchLoop {
    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<TriggerKind>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!("Watcher loop started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    debug!("Shutdown signal received in watcher loop");
                    break;
                }

                joined = wait_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    self.finish(joined);
                }

                Some(kind) = triggers.recv() => {
                    self.dispatch(kind);
                }
            }
        }

        triggers.close();
        let mut dropped = 0;
        while triggers.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Dropped {} pending triggers at shutdown", dropped);
        }

        if self.in_flight.take().is_some() {
            debug!("Reconcile still running at shutdown, leaving it to finish");
        }
        debug!("Watcher loop exiting");
    }

    fn dispatch(&mut self, kind: TriggerKind) {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("Ignoring {} trigger, watcher disposed", kind);
            return;
        }
        debug!("Trigger: {}", kind);

        match self.orchestrator.handle_trigger() {
            Dispatch::Discarded | Dispatch::Unreadable(_) => {}
            Dispatch::Settled(transition) => {
                if let (Some(event_type), Some(snapshot)) = (
                    EventType::for_transition(&transition),
                    self.orchestrator.last_snapshot(),
                ) {
                    let entry = JournalEntryBuilder::new(event_type, transition.to_string())
                        .branch(snapshot.branch())
                        .revision(snapshot.revision());
                    self.journal(entry);
                }
            }
            Dispatch::Reconcile(job) => {
                debug!("Reconcile started by {} trigger", kind);
                if let Some(event_type) = EventType::for_transition(job.transition()) {
                    let entry = JournalEntryBuilder::new(event_type, job.transition().to_string())
                        .branch(job.snapshot().branch())
                        .revision(job.snapshot().revision())
                        .details_json(job.transition());
                    self.journal(entry);
                }
                self.in_flight = Some(tokio::spawn(job.run()));
            }
        }
    }

    fn finish(&mut self, joined: std::result::Result<ReconcileOutcome, JoinError>) {
        let discarded = match joined {
            Ok(outcome) => {
                let event_type = if outcome.result.is_ok() {
                    EventType::ScanCompleted
                } else {
                    EventType::ScanFailed
                };
                let mut entry = JournalEntryBuilder::new(event_type, outcome.status().to_string())
                    .branch(outcome.snapshot.branch())
                    .revision(outcome.snapshot.revision());
                if let Ok(summary) = &outcome.result {
                    entry = entry.details_json(summary);
                }
                self.journal(entry);
                self.orchestrator.complete(&outcome)
            }
            Err(e) => {
                error!("Reconcile task failed: {}", e);
                self.orchestrator
                    .abandon(&format!("reconcile task failed: {}", e))
            }
        };

        if discarded > 0 {
            debug!("{} triggers discarded during reconcile", discarded);
            if self.catch_up {
                self.dispatch(TriggerKind::CatchUp);
            }
        }
    }

    fn journal(&self, entry: JournalEntryBuilder) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(entry) {
                warn!("Failed to journal event: {:#}", e);
            }
        }
    }
}

async fn wait_in_flight(
    task: &mut Option<JoinHandle<ReconcileOutcome>>,
) -> std::result::Result<ReconcileOutcome, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
