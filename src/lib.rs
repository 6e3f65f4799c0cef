//! headwatch - Repository head watcher driving a reindex pipeline
//!
//! headwatch follows the checked-out branch and commit of one working tree
//! and decides, from a stream of change notifications and poll ticks,
//! whether a reindex is needed, which kind, and when.
//!
//! ## Core Features
//!
//! - **Head Snapshots**: Reads `.git/HEAD`, loose refs and `packed-refs` directly
//! - **Transition Classification**: Branch switch, new commit, detached HEAD and recovery
//! - **Single-Flight Reconciles**: At most one scan runs; triggers arriving meanwhile are dropped
//! - **Push + Poll Triggers**: Native file notifications backed by a fixed-interval poll
//! - **Manifest Service**: Optional remote summary of what was already indexed
//! - **Transition Journal**: SQLite history of what the watcher saw and did
//!
//! ## Modules
//!
//! - [`git`]: Head snapshot reader
//! - [`classify`]: Snapshot comparison
//! - [`sync`]: Reconcile state machine
//! - [`trigger`]: Push and poll trigger channels
//! - [`daemon`]: The watcher loop and its disposal handle
//! - [`config`]: Configuration management and parsing

pub mod classify;
pub mod config;
pub mod daemon;
pub mod error;
pub mod git;
pub mod manifest;
pub mod scan;
pub mod state;
pub mod status;
pub mod sync;
pub mod trigger;

pub use classify::{classify, Transition};
pub use config::Config;
pub use daemon::{Watcher, WatcherHandle, WatcherOptions};
pub use error::{Result, WatchError};
pub use git::{read_snapshot, RepoLayout, Snapshot};
pub use manifest::{HttpManifestClient, ManifestSource, ManifestSummary};
pub use scan::{CommandPipeline, ProgressSink, ScanPipeline, ScanReport, ScanRequest};
pub use state::{EventJournal, EventType};
pub use status::{ScanProgress, StatusReporter, SyncStatus, WatchSummary};
pub use sync::{Dispatch, SyncOrchestrator};
pub use trigger::{SetupReport, TriggerKind};
