//! Trigger sources - native change notifications plus a fixed-interval poll
//!
//! Both channels push into one `mpsc` sender that the watcher loop drains.
//! Nothing here deduplicates: the orchestrator's single-flight guard is the
//! only place that decides whether a trigger does any work.

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::WatchError;
use crate::git::RepoLayout;

/// Why the watcher loop was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Initial check when the watcher starts
    Startup,
    /// Native notification on a watched path
    Push,
    /// Poll interval elapsed
    Poll,
    /// Explicit request from the handle owner
    Manual,
    /// Forced re-check after triggers were discarded mid-reconcile
    CatchUp,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerKind::Startup => "startup",
            TriggerKind::Push => "push",
            TriggerKind::Poll => "poll",
            TriggerKind::Manual => "manual",
            TriggerKind::CatchUp => "catch-up",
        };
        f.write_str(name)
    }
}

/// Which trigger channels came up, and what failed on the way
#[derive(Debug, Default)]
pub struct SetupReport {
    pub push_paths: Vec<PathBuf>,
    pub poll_interval: Option<Duration>,
    pub failures: Vec<WatchError>,
}

impl SetupReport {
    pub fn push_active(&self) -> bool {
        !self.push_paths.is_empty()
    }

    /// True when some requested channel could not be established
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Running trigger channels. Dropping this stops both of them.
pub struct TriggerSource {
    watcher: Option<RecommendedWatcher>,
    poll_task: Option<JoinHandle<()>>,
}

impl TriggerSource {
    /// Start the poll channel and, when `push_enabled`, the push channel
    pub fn start(
        layout: &RepoLayout,
        poll_interval: Duration,
        push_enabled: bool,
        sender: mpsc::Sender<TriggerKind>,
    ) -> (Self, SetupReport) {
        let mut report = SetupReport::default();

        let watcher = if push_enabled {
            start_push_channel(layout, sender.clone(), &mut report)
        } else {
            debug!("Push channel disabled by configuration");
            None
        };

        let poll_task = Some(start_poll_channel(poll_interval, sender));
        report.poll_interval = Some(poll_interval);

        if report.is_degraded() {
            warn!(
                "Trigger setup degraded ({} failures), push active: {}",
                report.failures.len(),
                report.push_active()
            );
        }

        (
            Self {
                watcher,
                poll_task,
            },
            report,
        )
    }

    /// Start only the poll channel, recording why push could not be set up
    pub fn poll_only(
        poll_interval: Duration,
        sender: mpsc::Sender<TriggerKind>,
        failure: WatchError,
    ) -> (Self, SetupReport) {
        warn!("Push channel unavailable ({}), running poll-only", failure);
        let report = SetupReport {
            push_paths: Vec::new(),
            poll_interval: Some(poll_interval),
            failures: vec![failure],
        };
        (
            Self {
                watcher: None,
                poll_task: Some(start_poll_channel(poll_interval, sender)),
            },
            report,
        )
    }

    /// Stop both channels. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        if self.watcher.take().is_some() {
            debug!("Push channel unsubscribed");
        }
    }
}

impl Drop for TriggerSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// File names inside the metadata directory that count as head changes
fn watched_names(layout: &RepoLayout, packed_refs_present: bool) -> Vec<OsString> {
    let mut names = vec![OsString::from("HEAD")];
    if packed_refs_present && layout.common_dir == layout.git_dir {
        names.push(OsString::from("packed-refs"));
    }
    names
}

/// Whether a notify event touches the head pointer, packed refs, or a branch ref
fn is_relevant(
    event: &Event,
    git_dir: &Path,
    common_dir: &Path,
    refs_dir: &Path,
    names: &[OsString],
    watch_packed_refs: bool,
) -> bool {
    event.paths.iter().any(|path| {
        if path.starts_with(refs_dir) {
            return !path.extension().is_some_and(|ext| ext == "lock");
        }
        let Some(name) = path.file_name() else {
            return false;
        };
        let Some(parent) = path.parent() else {
            return false;
        };
        (parent == git_dir && names.iter().any(|n| n == name))
            || (watch_packed_refs && parent == common_dir && name == "packed-refs")
    })
}

fn canonical_or_raw(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn start_push_channel(
    layout: &RepoLayout,
    sender: mpsc::Sender<TriggerKind>,
    report: &mut SetupReport,
) -> Option<RecommendedWatcher> {
    let packed_refs_present = layout.packed_refs_path().is_file();
    let names = watched_names(layout, packed_refs_present);
    // Some notifiers report resolved paths (e.g. /private/var on macOS)
    let git_dir = canonical_or_raw(&layout.git_dir);
    let common_dir = canonical_or_raw(&layout.common_dir);
    let refs_dir = canonical_or_raw(&layout.branch_refs_dir());
    let watch_packed_refs = packed_refs_present;

    let filter_git_dir = git_dir.clone();
    let filter_common_dir = common_dir.clone();
    let filter_refs_dir = refs_dir.clone();

    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_relevant(
                    &event,
                    &filter_git_dir,
                    &filter_common_dir,
                    &filter_refs_dir,
                    &names,
                    watch_packed_refs,
                ) {
                    trace!("Head metadata changed: {:?}", event.paths);
                    // A full channel already holds a pending wake-up
                    let _ = sender.try_send(TriggerKind::Push);
                }
            }
            Err(e) => warn!("Push channel error: {}", e),
        },
        NotifyConfig::default(),
    );

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            report.failures.push(WatchError::SetupFailure {
                path: git_dir,
                reason: format!("watcher init failed: {}", e),
            });
            return None;
        }
    };

    // HEAD is replaced by rename, so watch its directory rather than the file
    let mut targets = vec![(git_dir, RecursiveMode::NonRecursive)];
    if watch_packed_refs && common_dir != targets[0].0 {
        targets.push((common_dir, RecursiveMode::NonRecursive));
    }
    targets.push((refs_dir, RecursiveMode::Recursive));

    for (path, mode) in targets {
        match watcher.watch(&path, mode) {
            Ok(()) => {
                debug!("Watching {} ({:?})", path.display(), mode);
                report.push_paths.push(path);
            }
            Err(e) => {
                warn!("Failed to watch {}: {}", path.display(), e);
                report.failures.push(WatchError::SetupFailure {
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }

    if report.push_paths.is_empty() {
        info!("No push subscriptions succeeded, running poll-only");
        return None;
    }

    Some(watcher)
}

fn start_poll_channel(
    poll_interval: Duration,
    sender: mpsc::Sender<TriggerKind>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first immediate tick; startup has its own trigger
        timer.tick().await;

        loop {
            timer.tick().await;
            match sender.try_send(TriggerKind::Poll) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!("Trigger queue full, poll tick coalesced");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    })
}
