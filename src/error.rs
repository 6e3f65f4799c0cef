use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WatchError>;

/// Failures the watcher core distinguishes between.
///
/// None of these are fatal: the watcher logs or reports them and keeps
/// listening for the next trigger.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("not a git repository: {}", path.display())]
    NotARepository { path: PathBuf },

    #[error("reference {name} does not resolve to a revision")]
    UnresolvedReference { name: String },

    #[error("unrecognised HEAD contents: {content:?}")]
    MalformedHead { content: String },

    #[error("manifest unavailable: {0}")]
    ManifestUnavailable(String),

    #[error("scan failed: {0}")]
    ScanFailure(String),

    #[error("could not watch {}: {reason}", path.display())]
    SetupFailure { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Whether the repository metadata is missing or malformed, as opposed
    /// to an I/O failure while reading it.
    ///
    /// The watcher ignores triggers either way and keeps its last status;
    /// only I/O failures are logged as warnings.
    pub fn is_unreadable_head(&self) -> bool {
        matches!(
            self,
            WatchError::NotARepository { .. }
                | WatchError::UnresolvedReference { .. }
                | WatchError::MalformedHead { .. }
        )
    }
}
