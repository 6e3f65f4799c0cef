//! Transition classification between two head snapshots

use serde::Serialize;
use std::fmt;

use crate::git::{short_id, Snapshot};

/// What changed between the last processed snapshot and the current one.
///
/// Exactly one is produced per comparison, even when several fields differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    NoChange,
    /// `from` is absent for the initial establish event
    BranchSwitch { from: Option<String>, to: String },
    RevisionAdvance { from: String, to: String },
    DetachedEntered,
    DetachedRecovered { branch: String },
}

impl Transition {
    /// Whether this transition requires a scan
    pub fn needs_reconcile(&self) -> bool {
        matches!(
            self,
            Transition::BranchSwitch { .. }
                | Transition::RevisionAdvance { .. }
                | Transition::DetachedRecovered { .. }
        )
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::NoChange => write!(f, "no change"),
            Transition::BranchSwitch { from: None, to } => write!(f, "established on {}", to),
            Transition::BranchSwitch {
                from: Some(from),
                to,
            } => write!(f, "branch changed: {} -> {}", from, to),
            Transition::RevisionAdvance { from, to } => {
                write!(f, "new commit: {} -> {}", short_id(from), short_id(to))
            }
            Transition::DetachedEntered => write!(f, "entered detached HEAD"),
            Transition::DetachedRecovered { branch } => {
                write!(f, "returned to branch {}", branch)
            }
        }
    }
}

/// Compare the last processed snapshot against the current one.
///
/// A branch change wins over a simultaneous revision change: switching
/// branches already implies the tree moved, so one reconcile covers both.
/// Moving between detached revisions is not reported because indexing is
/// suspended until a branch is checked out again.
pub fn classify(previous: Option<&Snapshot>, current: &Snapshot) -> Transition {
    let Some(previous) = previous else {
        return match current.branch() {
            None => Transition::DetachedEntered,
            Some(branch) => Transition::BranchSwitch {
                from: None,
                to: branch.to_string(),
            },
        };
    };

    match (previous.branch(), current.branch()) {
        (Some(_), None) => Transition::DetachedEntered,
        (None, Some(branch)) => Transition::DetachedRecovered {
            branch: branch.to_string(),
        },
        (None, None) => Transition::NoChange,
        (Some(before), Some(after)) if before != after => Transition::BranchSwitch {
            from: Some(before.to_string()),
            to: after.to_string(),
        },
        (Some(_), Some(_)) if previous.revision() != current.revision() => {
            Transition::RevisionAdvance {
                from: previous.revision().to_string(),
                to: current.revision().to_string(),
            }
        }
        (Some(_), Some(_)) => Transition::NoChange,
    }
}
