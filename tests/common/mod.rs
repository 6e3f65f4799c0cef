//! Common test utilities and helpers for headwatch tests
#![allow(dead_code)]

use assert_fs::prelude::*;
use assert_fs::TempDir;
use async_trait::async_trait;
use headwatch::error::Result;
use headwatch::{
    ProgressSink, ScanPipeline, ScanProgress, ScanReport, ScanRequest, SyncStatus, WatcherHandle,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

pub use std::time::Duration;

pub const REV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const REV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const REV_C: &str = "cccccccccccccccccccccccccccccccccccccccc";

/// A working tree with just enough `.git` metadata for head reads
pub struct FakeRepo {
    pub dir: TempDir,
}

impl FakeRepo {
    /// Repository checked out on `branch` at `revision`
    pub fn on_branch(branch: &str, revision: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        dir.child(".git/refs/heads")
            .create_dir_all()
            .expect("Failed to create refs dir");
        let repo = Self { dir };
        repo.set_ref(branch, revision);
        repo.checkout(branch);
        repo
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Point a loose branch ref at `revision`
    pub fn set_ref(&self, branch: &str, revision: &str) {
        self.dir
            .child(format!(".git/refs/heads/{}", branch))
            .write_str(&format!("{}\n", revision))
            .expect("Failed to write ref");
    }

    /// Make HEAD a symbolic ref to `branch`
    pub fn checkout(&self, branch: &str) {
        self.dir
            .child(".git/HEAD")
            .write_str(&format!("ref: refs/heads/{}\n", branch))
            .expect("Failed to write HEAD");
    }

    /// Point HEAD at `branch` the way git does: write a lock file, then rename it over HEAD
    pub fn checkout_by_rename(&self, branch: &str) {
        let lock = self.dir.child(".git/HEAD.lock");
        lock.write_str(&format!("ref: refs/heads/{}\n", branch))
            .expect("Failed to write HEAD.lock");
        std::fs::rename(lock.path(), self.dir.child(".git/HEAD").path())
            .expect("Failed to rename HEAD.lock");
    }

    /// Make HEAD a raw revision id
    pub fn detach(&self, revision: &str) {
        self.dir
            .child(".git/HEAD")
            .write_str(&format!("{}\n", revision))
            .expect("Failed to write HEAD");
    }

    /// Write a `packed-refs` file listing the given branches
    pub fn pack_refs(&self, refs: &[(&str, &str)]) {
        let mut content = String::from("# pack-refs with: peeled fully-peeled sorted \n");
        for (branch, revision) in refs {
            content.push_str(&format!("{} refs/heads/{}\n", revision, branch));
        }
        self.dir
            .child(".git/packed-refs")
            .write_str(&content)
            .expect("Failed to write packed-refs");
    }
}

/// Scan pipeline that records every request and replays scripted reports.
///
/// With no scripted report left it reports success with one file and
/// two chunks.
#[derive(Default)]
pub struct RecordingPipeline {
    requests: Mutex<Vec<ScanRequest>>,
    reports: Mutex<VecDeque<ScanReport>>,
}

impl RecordingPipeline {
    pub fn scripted(reports: Vec<ScanReport>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            reports: Mutex::new(reports.into()),
        }
    }

    pub fn requests(&self) -> Vec<ScanRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn revisions(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.revision).collect()
    }
}

#[async_trait]
impl ScanPipeline for RecordingPipeline {
    async fn scan(&self, request: ScanRequest, progress: ProgressSink) -> Result<ScanReport> {
        self.requests.lock().unwrap().push(request);
        progress(ScanProgress {
            files_processed: 1,
            files_total: 1,
            chunks_indexed: 2,
        });
        let scripted = self.reports.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(ScanReport {
            success: true,
            files_processed: 1,
            chunks_indexed: 2,
            errors: Vec::new(),
        }))
    }
}

pub fn failed_report(message: &str) -> ScanReport {
    ScanReport {
        success: false,
        errors: vec![message.to_string()],
        ..Default::default()
    }
}

/// Pull statuses until one satisfies `done`, returning everything seen
pub async fn collect_until(
    handle: &mut WatcherHandle,
    done: impl Fn(&SyncStatus) -> bool,
) -> Vec<SyncStatus> {
    let mut seen = Vec::new();
    loop {
        let status = tokio::time::timeout(Duration::from_secs(10), handle.next_status())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for status, saw {:?}", seen))
            .expect("Status stream ended early");
        let finished = done(&status);
        seen.push(status);
        if finished {
            return seen;
        }
    }
}

pub fn is_watching(status: &SyncStatus) -> bool {
    matches!(status, SyncStatus::Watching(_))
}
