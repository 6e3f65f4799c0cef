mod common;

use assert_fs::prelude::*;
use assert_matches::assert_matches;
use common::*;
use headwatch::{Config, EventJournal, EventType, SyncStatus, Watcher, WatcherOptions};
use predicates::prelude::*;
use std::sync::Arc;

fn polling(interval_ms: u64) -> WatcherOptions {
    WatcherOptions {
        poll_interval: Duration::from_millis(interval_ms),
        push_enabled: false,
        catch_up: true,
    }
}

#[tokio::test]
async fn test_poll_picks_up_new_commit() {
    let repo = FakeRepo::on_branch("main", REV_A);
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, report) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(50))
        .start();
    assert!(!report.is_degraded());

    let startup = collect_until(&mut handle, is_watching).await;
    assert_eq!(startup[0], SyncStatus::idle());
    assert_matches!(&startup[1], SyncStatus::Scanning { message, .. } if message == "established on main");

    repo.set_ref("main", REV_B);
    let advance = collect_until(&mut handle, is_watching).await;

    assert_matches!(&advance[0], SyncStatus::Scanning { message, .. } if message.starts_with("new commit"));
    assert_matches!(advance.last(), Some(SyncStatus::Watching(summary)) if summary.branch == "main" && summary.total_files == 1 && summary.total_chunks == 2);
    assert_eq!(pipeline.revisions(), vec![REV_A.to_string(), REV_B.to_string()]);

    handle.dispose().await;
}

#[tokio::test]
async fn test_branch_switch_detach_and_recover() {
    let repo = FakeRepo::on_branch("main", REV_A);
    repo.set_ref("feature-x", REV_B);
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, _) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(50))
        .start();
    collect_until(&mut handle, is_watching).await;

    repo.checkout("feature-x");
    let switched = collect_until(&mut handle, is_watching).await;
    assert_matches!(&switched[0], SyncStatus::Scanning { message, .. } if message == "branch changed: main -> feature-x");
    assert_matches!(switched.last(), Some(SyncStatus::Watching(summary)) if summary.branch == "feature-x");

    repo.detach(REV_C);
    let detached = collect_until(&mut handle, |s| matches!(s, SyncStatus::Idle { .. })).await;
    assert_matches!(detached.as_slice(), [SyncStatus::Idle { reason: Some(reason) }] if reason.contains("detached"));

    // Give a few poll ticks the chance to (wrongly) scan the detached head
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.requests().len(), 2);

    repo.checkout("main");
    let recovered = collect_until(&mut handle, is_watching).await;
    assert_matches!(&recovered[0], SyncStatus::Scanning { message, .. } if message == "returned to branch main");
    assert_eq!(pipeline.requests().len(), 3);
    assert_eq!(pipeline.requests()[2].branch, "main");

    handle.dispose().await;
}

#[tokio::test]
async fn test_failed_scan_then_next_commit_recovers() {
    let repo = FakeRepo::on_branch("main", REV_A);
    let pipeline = Arc::new(RecordingPipeline::scripted(vec![failed_report(
        "index store locked",
    )]));

    let (mut handle, _) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(50))
        .start();

    let first = collect_until(&mut handle, |s| {
        matches!(s, SyncStatus::Error { .. } | SyncStatus::Watching(_))
    })
    .await;
    assert_matches!(first.last(), Some(SyncStatus::Error { message }) if message == "index store locked");

    // Same head is not retried on every poll
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.requests().len(), 1);

    repo.set_ref("main", REV_B);
    collect_until(&mut handle, is_watching).await;
    assert_eq!(pipeline.revisions(), vec![REV_A.to_string(), REV_B.to_string()]);
    assert_eq!(handle.stats().scans_failed, 1);

    handle.dispose().await;
}

#[tokio::test]
async fn test_packed_ref_only_branch_is_watched() {
    let repo = FakeRepo::on_branch("main", REV_A);
    repo.pack_refs(&[("release", REV_B)]);
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, _) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(50))
        .start();
    collect_until(&mut handle, is_watching).await;

    repo.checkout("release");
    let switched = collect_until(&mut handle, is_watching).await;
    assert_matches!(switched.last(), Some(SyncStatus::Watching(summary)) if summary.branch == "release");
    assert_eq!(pipeline.requests()[1].revision, REV_B);

    handle.dispose().await;
}

#[tokio::test]
async fn test_head_rename_wakes_watcher_through_push() {
    let repo = FakeRepo::on_branch("main", REV_A);
    repo.set_ref("feature-x", REV_B);
    let pipeline = Arc::new(RecordingPipeline::default());

    let options = WatcherOptions {
        poll_interval: Duration::from_secs(3600),
        push_enabled: true,
        catch_up: true,
    };
    let (mut handle, report) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(options)
        .start();
    if !report.push_active() {
        // No native notifications on this platform; nothing to exercise
        handle.dispose().await;
        return;
    }
    collect_until(&mut handle, is_watching).await;

    repo.checkout_by_rename("feature-x");
    let switched = collect_until(&mut handle, is_watching).await;

    assert_matches!(&switched[0], SyncStatus::Scanning { message, .. } if message == "branch changed: main -> feature-x");
    assert_matches!(switched.last(), Some(SyncStatus::Watching(summary)) if summary.branch == "feature-x");
    assert_eq!(pipeline.revisions(), vec![REV_A.to_string(), REV_B.to_string()]);

    handle.dispose().await;
}

#[tokio::test]
async fn test_trigger_just_before_dispose_is_not_scanned() {
    let repo = FakeRepo::on_branch("main", REV_A);
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, _) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(3_600_000))
        .start();
    collect_until(&mut handle, is_watching).await;

    repo.set_ref("main", REV_B);
    assert!(handle.trigger());
    handle.dispose().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.revisions(), vec![REV_A.to_string()]);
}

#[tokio::test]
async fn test_dispose_ends_status_stream() {
    let repo = FakeRepo::on_branch("main", REV_A);
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, _) = Watcher::new(repo.root(), pipeline.clone())
        .with_options(polling(50))
        .start();
    collect_until(&mut handle, is_watching).await;

    let stats_before = handle.stats();
    handle.dispose().await;

    // Head changes after disposal are never scanned
    repo.set_ref("main", REV_B);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.requests().len(), 1);
    assert!(stats_before.scans_started >= 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_configured_command_pipeline_end_to_end() {
    let repo = FakeRepo::on_branch("main", REV_A);
    let data = assert_fs::TempDir::new().unwrap();
    let marker = data.child("scanned");
    let journal_path = data.child("events.db");

    let mut config = Config::default();
    config.repository.root = repo.root().to_string_lossy().into_owned();
    config.watcher.poll_interval = "50ms".to_string();
    config.watcher.push_enabled = false;
    config.journal.path = journal_path.path().to_string_lossy().into_owned();
    config.scan.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            r#"echo "$HEADWATCH_BRANCH $HEADWATCH_REVISION" > '{}'
echo '{{"type":"progress","files_processed":3,"files_total":3,"chunks_indexed":7}}'
echo '{{"type":"result","success":true,"files_processed":3,"chunks_indexed":7}}'"#,
            marker.path().display()
        ),
    ];

    let (mut handle, _) = Watcher::from_config(&config).unwrap().start();
    let statuses = collect_until(&mut handle, is_watching).await;

    assert!(statuses.iter().any(|s| matches!(
        s,
        SyncStatus::Scanning { progress, .. } if progress.chunks_indexed == 7
    )));
    assert_matches!(statuses.last(), Some(SyncStatus::Watching(summary)) if summary.total_files == 3 && summary.total_chunks == 7);
    marker.assert(predicate::str::contains(format!("main {}", REV_A)));

    // Give the loop a moment to journal the outcome before disposal
    let reader = EventJournal::open_at(journal_path.path()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.recent(Some(EventType::ScanCompleted), 1).unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("scan outcome journaled");
    handle.dispose().await;

    let entries = reader.recent(None, 10).unwrap();
    assert_eq!(entries[0].event_type, EventType::ScanCompleted);
    assert_eq!(entries[1].event_type, EventType::BranchSwitch);
    let details: serde_json::Value =
        serde_json::from_str(entries[1].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["kind"], "branch_switch");
    assert!(details["from"].is_null());
    assert_eq!(details["to"], "main");
}

#[tokio::test]
async fn test_not_a_repository_keeps_watcher_alive() {
    let empty = assert_fs::TempDir::new().unwrap();
    let pipeline = Arc::new(RecordingPipeline::default());

    let (mut handle, report) = Watcher::new(empty.path(), pipeline.clone())
        .with_options(polling(20))
        .start();
    assert!(report.is_degraded());

    assert_eq!(
        collect_until(&mut handle, |_| true).await,
        vec![SyncStatus::idle()]
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.stats().triggers_received >= 2);
    assert!(pipeline.requests().is_empty());

    // The repository appearing later is picked up by the poll channel
    let repo = FakeRepo { dir: empty };
    repo.dir.child(".git/refs/heads").create_dir_all().unwrap();
    repo.set_ref("main", REV_A);
    repo.checkout("main");
    collect_until(&mut handle, is_watching).await;
    assert_eq!(pipeline.revisions(), vec![REV_A.to_string()]);

    handle.dispose().await;
}
