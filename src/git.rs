//! Head state reader - derives a normalized snapshot from git metadata
//!
//! Reads `.git/HEAD` directly instead of shelling out to `git`, so a snapshot
//! costs a couple of small file reads and can be taken on every poll tick.
//! Linked worktrees (`.git` file with a `gitdir:` line) and `packed-refs`
//! are understood; object and pack formats are never touched.

use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, trace};

use crate::error::{Result, WatchError};

const HEAD_FILE: &str = "HEAD";
const PACKED_REFS_FILE: &str = "packed-refs";
const BRANCH_PREFIX: &str = "refs/heads/";
const MAX_SYMREF_DEPTH: usize = 5;

/// Normalized view of the repository head at one instant.
///
/// `branch` is absent exactly when the head is detached; the constructors
/// are the only way to build one, so that holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    branch: Option<String>,
    revision: String,
}

impl Snapshot {
    pub fn on_branch(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            revision: revision.into(),
        }
    }

    pub fn detached(revision: impl Into<String>) -> Self {
        Self {
            branch: None,
            revision: revision.into(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn is_detached(&self) -> bool {
        self.branch.is_none()
    }

    /// First seven characters of the revision, for log lines
    pub fn short_revision(&self) -> &str {
        short_id(&self.revision)
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..7).unwrap_or(id)
}

/// Where a repository keeps the metadata the watcher cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    /// Working tree root
    pub root: PathBuf,
    /// Per-worktree metadata directory (holds HEAD)
    pub git_dir: PathBuf,
    /// Shared metadata directory (holds refs and packed-refs)
    pub common_dir: PathBuf,
}

impl RepoLayout {
    /// Locate the metadata directories for the working tree at `root`
    pub fn discover(root: &Path) -> Result<Self> {
        let dot_git = root.join(".git");

        let git_dir = if dot_git.is_dir() {
            dot_git
        } else if dot_git.is_file() {
            let content = fs::read_to_string(&dot_git)?;
            let target = content
                .lines()
                .find_map(|line| line.trim().strip_prefix("gitdir:"))
                .map(str::trim)
                .ok_or_else(|| WatchError::NotARepository {
                    path: root.to_path_buf(),
                })?;
            let target = PathBuf::from(target);
            if target.is_absolute() {
                target
            } else {
                root.join(target)
            }
        } else {
            return Err(WatchError::NotARepository {
                path: root.to_path_buf(),
            });
        };

        if !git_dir.is_dir() {
            return Err(WatchError::NotARepository {
                path: root.to_path_buf(),
            });
        }

        let common_dir = match fs::read_to_string(git_dir.join("commondir")) {
            Ok(content) => {
                let target = PathBuf::from(content.trim());
                if target.is_absolute() {
                    target
                } else {
                    git_dir.join(target)
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => git_dir.clone(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            root: root.to_path_buf(),
            git_dir,
            common_dir,
        })
    }

    pub fn head_path(&self) -> PathBuf {
        self.git_dir.join(HEAD_FILE)
    }

    /// Directory holding loose branch references
    pub fn branch_refs_dir(&self) -> PathBuf {
        self.common_dir.join("refs").join("heads")
    }

    pub fn packed_refs_path(&self) -> PathBuf {
        self.common_dir.join(PACKED_REFS_FILE)
    }

    /// Read HEAD and resolve it into a snapshot
    pub fn read_snapshot(&self) -> Result<Snapshot> {
        let head = match fs::read_to_string(self.head_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WatchError::NotARepository {
                    path: self.root.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let head = head.trim();

        if let Some(reference) = symbolic_target(head) {
            let revision = self.resolve_reference(reference)?;
            let branch = reference.strip_prefix(BRANCH_PREFIX).unwrap_or(reference);
            debug!("HEAD -> {} at {}", branch, short_id(&revision));
            return Ok(Snapshot::on_branch(branch, revision));
        }

        if is_revision_id(head) {
            debug!("HEAD detached at {}", short_id(head));
            return Ok(Snapshot::detached(head));
        }

        Err(WatchError::MalformedHead {
            content: head.to_string(),
        })
    }

    /// Follow a reference name to the revision id it points at
    fn resolve_reference(&self, name: &str) -> Result<String> {
        let mut current = name.to_string();

        for _ in 0..MAX_SYMREF_DEPTH {
            let Some(content) = self.read_loose_ref(&current)? else {
                return self.lookup_packed_ref(&current)?.ok_or_else(|| {
                    WatchError::UnresolvedReference {
                        name: current.clone(),
                    }
                });
            };

            match symbolic_target(&content) {
                Some(next) => {
                    trace!("{} -> {}", current, next);
                    current = next.to_string();
                }
                None if is_revision_id(&content) => return Ok(content),
                None => return Err(WatchError::UnresolvedReference { name: current }),
            }
        }

        Err(WatchError::UnresolvedReference { name: current })
    }

    /// Loose ref contents, checking the worktree directory before the shared one
    fn read_loose_ref(&self, name: &str) -> Result<Option<String>> {
        let mut dirs = vec![&self.git_dir];
        if self.common_dir != self.git_dir {
            dirs.push(&self.common_dir);
        }

        for dir in dirs {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(content) => return Ok(Some(content.trim().to_string())),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    fn lookup_packed_ref(&self, name: &str) -> Result<Option<String>> {
        let content = match fs::read_to_string(self.packed_refs_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(find_packed_ref(&content, name))
    }
}

/// Read the head snapshot of the working tree at `root`
pub fn read_snapshot(root: &Path) -> Result<Snapshot> {
    RepoLayout::discover(root)?.read_snapshot()
}

fn symbolic_target(content: &str) -> Option<&str> {
    content
        .strip_prefix("ref:")
        .map(str::trim)
        .filter(|target| !target.is_empty())
}

/// Full SHA-1 or SHA-256 object id
fn is_revision_id(candidate: &str) -> bool {
    static REVISION_ID: OnceLock<Regex> = OnceLock::new();
    REVISION_ID
        .get_or_init(|| Regex::new(r"^(?:[0-9a-f]{40}|[0-9a-f]{64})$").expect("valid regex"))
        .is_match(candidate)
}

fn find_packed_ref(content: &str, name: &str) -> Option<String> {
    content
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .find(|(_, refname)| refname.trim() == name)
        .map(|(id, _)| id.trim().to_string())
        .filter(|id| is_revision_id(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const REV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const REV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn init_repo(head: &str) -> TempDir {
        let temp = TempDir::new().unwrap();
        let git = temp.path().join(".git");
        fs::create_dir_all(git.join("refs/heads")).unwrap();
        fs::write(git.join("HEAD"), format!("{head}\n")).unwrap();
        temp
    }

    fn write_ref(repo: &TempDir, name: &str, revision: &str) {
        let path = repo.path().join(".git").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("{revision}\n")).unwrap();
    }

    #[test]
    fn test_branch_head_resolves_loose_ref() {
        let repo = init_repo("ref: refs/heads/main");
        write_ref(&repo, "refs/heads/main", REV_A);

        let snapshot = read_snapshot(repo.path()).unwrap();
        assert_eq!(snapshot, Snapshot::on_branch("main", REV_A));
        assert!(!snapshot.is_detached());
        assert_eq!(snapshot.short_revision(), "aaaaaaa");
    }

    #[test]
    fn test_nested_branch_name() {
        let repo = init_repo("ref: refs/heads/feature/login");
        write_ref(&repo, "refs/heads/feature/login", REV_B);

        let snapshot = read_snapshot(repo.path()).unwrap();
        assert_eq!(snapshot.branch(), Some("feature/login"));
        assert_eq!(snapshot.revision(), REV_B);
    }

    #[test]
    fn test_branch_head_falls_back_to_packed_refs() {
        let repo = init_repo("ref: refs/heads/release");
        fs::write(
            repo.path().join(".git/packed-refs"),
            format!(
                "# pack-refs with: peeled fully-peeled sorted\n{REV_A} refs/heads/main\n{REV_B} refs/heads/release\n^{REV_A}\n"
            ),
        )
        .unwrap();

        let snapshot = read_snapshot(repo.path()).unwrap();
        assert_eq!(snapshot, Snapshot::on_branch("release", REV_B));
    }

    #[test]
    fn test_loose_ref_wins_over_packed_ref() {
        let repo = init_repo("ref: refs/heads/main");
        fs::write(
            repo.path().join(".git/packed-refs"),
            format!("{REV_A} refs/heads/main\n"),
        )
        .unwrap();
        write_ref(&repo, "refs/heads/main", REV_B);

        assert_eq!(read_snapshot(repo.path()).unwrap().revision(), REV_B);
    }

    #[test]
    fn test_detached_head() {
        let repo = init_repo(REV_A);

        let snapshot = read_snapshot(repo.path()).unwrap();
        assert!(snapshot.is_detached());
        assert_eq!(snapshot.branch(), None);
        assert_eq!(snapshot.revision(), REV_A);
    }

    #[test]
    fn test_missing_git_dir_is_not_a_repository() {
        let temp = TempDir::new().unwrap();
        assert_matches!(
            read_snapshot(temp.path()),
            Err(WatchError::NotARepository { .. })
        );
    }

    #[test]
    fn test_missing_head_is_not_a_repository() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".git")).unwrap();

        assert_matches!(
            read_snapshot(temp.path()),
            Err(WatchError::NotARepository { .. })
        );
    }

    #[test]
    fn test_unborn_branch_is_unresolved() {
        let repo = init_repo("ref: refs/heads/main");

        let err = read_snapshot(repo.path()).unwrap_err();
        assert!(err.is_unreadable_head());
        assert_matches!(err, WatchError::UnresolvedReference { name } if name == "refs/heads/main");
    }

    #[test]
    fn test_garbage_head_is_malformed() {
        let repo = init_repo("not a head");
        assert_matches!(
            read_snapshot(repo.path()),
            Err(WatchError::MalformedHead { .. })
        );
    }

    #[test]
    fn test_symbolic_ref_chain() {
        let repo = init_repo("ref: refs/heads/alias");
        write_ref(&repo, "refs/heads/alias", "ref: refs/heads/main");
        write_ref(&repo, "refs/heads/main", REV_A);

        let snapshot = read_snapshot(repo.path()).unwrap();
        assert_eq!(snapshot.branch(), Some("alias"));
        assert_eq!(snapshot.revision(), REV_A);
    }

    #[test]
    fn test_linked_worktree_layout() {
        let main = init_repo("ref: refs/heads/main");
        write_ref(&main, "refs/heads/main", REV_A);
        write_ref(&main, "refs/heads/topic", REV_B);

        let worktree_meta = main.path().join(".git/worktrees/topic");
        fs::create_dir_all(&worktree_meta).unwrap();
        fs::write(worktree_meta.join("HEAD"), "ref: refs/heads/topic\n").unwrap();
        fs::write(worktree_meta.join("commondir"), "../..\n").unwrap();

        let worktree = TempDir::new().unwrap();
        fs::write(
            worktree.path().join(".git"),
            format!("gitdir: {}\n", worktree_meta.display()),
        )
        .unwrap();

        let layout = RepoLayout::discover(worktree.path()).unwrap();
        assert_eq!(layout.git_dir, worktree_meta);
        assert!(layout.branch_refs_dir().ends_with("refs/heads"));

        let snapshot = layout.read_snapshot().unwrap();
        assert_eq!(snapshot, Snapshot::on_branch("topic", REV_B));
    }

    #[test]
    fn test_revision_id_validation() {
        assert!(is_revision_id(REV_A));
        assert!(is_revision_id(&"c".repeat(64)));
        assert!(!is_revision_id("abc123"));
        assert!(!is_revision_id(&"Z".repeat(40)));
    }
}
