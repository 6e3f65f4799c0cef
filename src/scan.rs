//! Scan pipeline seam
//!
//! The pipeline that walks the tree and produces chunks lives outside this
//! crate. [`ScanPipeline`] is the boundary; [`CommandPipeline`] adapts an
//! external indexer process to it.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, WatchError};
use crate::manifest::ManifestSummary;
use crate::status::ScanProgress;

/// Callback receiving progress ticks from a running scan
pub type ProgressSink = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Everything a pipeline needs to scan one revision
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub repo_root: PathBuf,
    pub branch: String,
    pub revision: String,
    pub manifest: Option<ManifestSummary>,
}

/// Outcome reported by a pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ScanReport {
    pub success: bool,
    #[serde(default)]
    pub files_processed: u64,
    #[serde(default)]
    pub chunks_indexed: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ScanReport {
    /// Human readable reason for a failed report
    pub fn failure_message(&self) -> String {
        if self.errors.is_empty() {
            "scan pipeline reported failure".to_string()
        } else {
            self.errors.join("; ")
        }
    }
}

#[async_trait]
pub trait ScanPipeline: Send + Sync {
    /// Run one scan. An `Err` means the pipeline could not run at all;
    /// a run that completed badly returns a report with `success: false`.
    async fn scan(&self, request: ScanRequest, progress: ProgressSink) -> Result<ScanReport>;
}

/// Lines an external indexer may print on stdout
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PipelineLine {
    Progress {
        files_processed: u64,
        files_total: u64,
        #[serde(default)]
        chunks_indexed: u64,
    },
    Result(ScanReport),
}

/// Runs a configured external program as the scan pipeline.
///
/// The program gets the target revision in `HEADWATCH_*` environment
/// variables and may report progress as JSON lines on stdout.
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandPipeline {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| WatchError::ScanFailure("scan command is empty".to_string()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut pipeline = Self::new(&config.scan.command)?;
        pipeline.env = config
            .scan
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(pipeline)
    }

    fn build_command(&self, request: &ScanRequest) -> AsyncCommand {
        let mut command = AsyncCommand::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&request.repo_root)
            .env("HEADWATCH_REPO_ROOT", &request.repo_root)
            .env("HEADWATCH_BRANCH", &request.branch)
            .env("HEADWATCH_REVISION", &request.revision)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        if let Some(manifest) = &request.manifest {
            command
                .env("HEADWATCH_MANIFEST_FILES", manifest.total_files.to_string())
                .env("HEADWATCH_MANIFEST_CHUNKS", manifest.total_chunks.to_string());
        }

        command
    }
}

#[async_trait]
impl ScanPipeline for CommandPipeline {
    async fn scan(&self, request: ScanRequest, progress: ProgressSink) -> Result<ScanReport> {
        info!(
            "Running scan pipeline '{}' for {} at {}",
            self.program, request.branch, request.revision
        );

        let mut child = self
            .build_command(&request)
            .spawn()
            .map_err(|e| WatchError::ScanFailure(format!("failed to start {}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WatchError::ScanFailure("pipeline stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| WatchError::ScanFailure("pipeline stderr unavailable".to_string()))?;

        // Drain stderr concurrently so a chatty pipeline cannot block on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut last_progress = ScanProgress::default();
        let mut final_report = None;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("Lost scan pipeline output: {}", e);
                    if let Err(kill_err) = child.kill().await {
                        warn!("Failed to stop scan pipeline: {}", kill_err);
                    }
                    stderr_task.abort();
                    return Err(e.into());
                }
            }

            // Indexers may log file names in any encoding
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            match serde_json::from_str::<PipelineLine>(line) {
                Ok(PipelineLine::Progress {
                    files_processed,
                    files_total,
                    chunks_indexed,
                }) => {
                    last_progress = ScanProgress {
                        files_processed,
                        files_total,
                        chunks_indexed,
                    };
                    progress(last_progress);
                }
                Ok(PipelineLine::Result(report)) => final_report = Some(report),
                Err(_) => debug!("pipeline: {}", line),
            }
        }

        let status = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!("Scan pipeline exited with {}", status);
            let detail = stderr_text.trim();
            let message = if detail.is_empty() {
                format!("{} exited with {}", self.program, status)
            } else {
                format!("{} exited with {}: {}", self.program, status, detail)
            };
            return Ok(ScanReport {
                success: false,
                files_processed: last_progress.files_processed,
                chunks_indexed: last_progress.chunks_indexed,
                errors: vec![message],
            });
        }

        Ok(final_report.unwrap_or(ScanReport {
            success: true,
            files_processed: last_progress.files_processed,
            chunks_indexed: last_progress.chunks_indexed,
            errors: Vec::new(),
        }))
    }
}
