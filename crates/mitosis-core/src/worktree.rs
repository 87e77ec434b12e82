use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git command failed: {detail}")]
    Backend { detail: String },

    #[error("working tree '{id}' already exists")]
    AlreadyExists { id: String },

    #[error("invalid identifier '{value}'")]
    InvalidIdentifier { value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live working tree under the managed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingTree {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("static regex"))
}

/// Service for managing the isolated working copies cells run in.
///
/// Each cell gets its own tree on a derived branch (`cell/<id>`), so two
/// cells never fight over a checked-out branch. Identifiers are restricted
/// to a conservative character set before they reach the git CLI.
pub struct WorktreeService {
    repo_root: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeService {
    pub fn new(repo_root: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            repo_root,
            base_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a tree for `id`, branched from `source_branch`.
    ///
    /// Branch: `cell/<id>`
    /// Path:   `<base_dir>/<id>/`
    ///
    /// Not idempotent: an existing tree with the same id is an error.
    pub async fn create(&self, id: &str, source_branch: &str) -> Result<WorkingTree, WorktreeError> {
        validate_identifier(id)?;
        validate_identifier(source_branch)?;

        let branch = derived_branch(id);
        let path = self.base_dir.join(id);

        if path.exists() {
            return Err(WorktreeError::AlreadyExists { id: id.to_string() });
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;

        let output = Command::new("git")
            .args([
                "worktree",
                "add",
                "-b",
                &branch,
                &path.display().to_string(),
                source_branch,
            ])
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::Backend {
                detail: stderr.trim().to_string(),
            });
        }

        info!(
            id,
            path = %path.display(),
            branch = %branch,
            source = source_branch,
            "created working tree"
        );

        Ok(WorkingTree {
            id: id.to_string(),
            path,
            branch,
            head_commit: String::new(),
        })
    }

    /// Force-remove the tree for `id` and delete its derived branch.
    ///
    /// An absent tree still attempts branch deletion; callers treat absence
    /// as already-removed.
    pub async fn remove(&self, id: &str) -> Result<(), WorktreeError> {
        validate_identifier(id)?;
        let path = self.base_dir.join(id);

        if path.exists() {
            let output = Command::new("git")
                .args([
                    "worktree",
                    "remove",
                    "--force",
                    &path.display().to_string(),
                ])
                .current_dir(&self.repo_root)
                .output()
                .await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(
                    id,
                    error = %stderr.trim(),
                    "worktree remove failed, deleting directory and pruning"
                );
                let _ = tokio::fs::remove_dir_all(&path).await;
                let _ = Command::new("git")
                    .args(["worktree", "prune"])
                    .current_dir(&self.repo_root)
                    .output()
                    .await;
            }
        }

        let _ = Command::new("git")
            .args(["branch", "-D", &derived_branch(id)])
            .current_dir(&self.repo_root)
            .output()
            .await;

        info!(id, "removed working tree");
        Ok(())
    }

    /// Enumerate live trees under the managed directory.
    pub async fn list(&self) -> Result<Vec<WorkingTree>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::Backend {
                detail: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let base = self.base_dir.canonicalize().unwrap_or_else(|_| self.base_dir.clone());

        Ok(parse_porcelain(&stdout)
            .into_iter()
            .filter(|entry| entry.path.starts_with(&base) || entry.path.starts_with(&self.base_dir))
            .filter_map(|entry| {
                let id = entry.path.file_name()?.to_string_lossy().to_string();
                Some(WorkingTree {
                    id,
                    path: entry.path,
                    branch: entry.branch,
                    head_commit: entry.head_commit,
                })
            })
            .collect())
    }

    /// Drop stale administrative entries for trees whose directories vanished.
    pub async fn prune(&self) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_root)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::Backend {
                detail: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Remove every live tree under the managed directory. Best-effort per
    /// tree; the first error is reported after all removals were attempted.
    pub async fn cleanup_all(&self) -> Result<usize, WorktreeError> {
        let trees = self.list().await?;
        let mut removed = 0;
        let mut first_err = None;

        for tree in trees {
            match self.remove(&tree.id).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(id = %tree.id, error = %e, "cleanup: failed to remove tree");
                    first_err.get_or_insert(e);
                }
            }
        }

        self.prune().await?;

        match first_err {
            Some(e) if removed == 0 => Err(e),
            _ => Ok(removed),
        }
    }
}

/// Branch name derived from a tree id, avoiding "already checked out"
/// collisions with the source branch.
fn derived_branch(id: &str) -> String {
    format!("cell/{id}")
}

fn validate_identifier(value: &str) -> Result<(), WorktreeError> {
    if identifier_pattern().is_match(value) {
        Ok(())
    } else {
        Err(WorktreeError::InvalidIdentifier {
            value: value.to_string(),
        })
    }
}

struct PorcelainEntry {
    path: PathBuf,
    branch: String,
    head_commit: String,
}

/// Parse `git worktree list --porcelain` output.
fn parse_porcelain(output: &str) -> Vec<PorcelainEntry> {
    let mut entries = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut head = String::new();
    let mut branch = String::new();

    for line in output.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p));
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            head = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = b.strip_prefix("refs/heads/").unwrap_or(b).to_string();
        } else if line.is_empty() {
            if let Some(p) = path.take() {
                entries.push(PorcelainEntry {
                    path: p,
                    branch: std::mem::take(&mut branch),
                    head_commit: std::mem::take(&mut head),
                });
            }
        }
    }

    if let Some(p) = path.take() {
        entries.push(PorcelainEntry {
            path: p,
            branch,
            head_commit: head,
        });
    }

    entries
}
