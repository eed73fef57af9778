//! Worktree manager: allocates and tears down isolated git working copies
//! keyed by item id (§4.4).
//!
//! Adapted from the teacher's `WorktreeManager` (git `worktree add`/`remove
//! --force` wrapper, `git_lock: Arc<Mutex<()>>` serializing concurrent
//! invocations, `git worktree list --porcelain` parsing). Branch
//! merge/delete/checkout machinery has no counterpart in this spec (no
//! integration-back-to-trunk step is specified here) and is not carried
//! over; `acquire`/`release` replace `create_worktree`/`remove_worktree`
//! with the simpler item-keyed pair this spec calls for.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::item::ItemId;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit { command: String, code: i32, stderr: String },

    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// A handle to one acquired worktree. Owned exclusively by the Iteration
/// that acquired it for its lifetime (§3 Ownership); released on every exit
/// path (success, failure, cancellation, panic).
#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub item_id: ItemId,
    pub path: PathBuf,
    /// `None` when `max_parallel = 1` and the acquired path equals
    /// `workdir` itself -- there is no branch to remove, since no
    /// worktree was actually created.
    branch: Option<String>,
}

impl WorktreeHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head_commit: String,
}

/// Manages isolated working copies for agent iterations.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    max_parallel: usize,
    git_lock: Arc<Mutex<()>>,
    /// Paths currently checked out, guarding against a duplicate disambiguator.
    allocated: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            max_parallel: self.max_parallel,
            git_lock: Arc::clone(&self.git_lock),
            allocated: Arc::clone(&self.allocated),
        }
    }
}

impl WorktreeManager {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
        max_parallel: usize,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--git-dir")
            .current_dir(&repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git rev-parse".into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path.file_name().and_then(|n| n.to_str()).unwrap_or("repo");
            let base_name = format!("{repo_name}-ralph-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            max_parallel,
            git_lock: Arc::new(Mutex::new(())),
            allocated: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Provision an isolated working copy for `item_id`. For
    /// `max_parallel = 1` the acquired path MAY equal `workdir` (§4.4); we
    /// take that shortcut since there is no concurrent iteration that could
    /// collide with it.
    pub fn acquire(&self, item_id: &str) -> Result<WorktreeHandle, WorktreeError> {
        if self.max_parallel == 1 {
            return Ok(WorktreeHandle {
                item_id: item_id.to_string(),
                path: self.repo_path.clone(),
                branch: None,
            });
        }

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let disambiguator = Uuid::new_v4().simple().to_string();
        let branch_name = format!("ralph/{item_id}/{disambiguator}");
        let dir_name = branch_name.replace('/', "--");
        let worktree_path = self.worktree_base.join(&dir_name);

        if !self.worktree_base.exists() {
            std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
                message: format!(
                    "failed to create worktree base directory: {}",
                    self.worktree_base.display()
                ),
                source: e,
            })?;
        }

        let output = Command::new("git")
            .args(["worktree", "add", "-b"])
            .arg(&branch_name)
            .arg(&worktree_path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree add -b".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.cleanup_partial(&worktree_path);
            return Err(WorktreeError::GitExit {
                command: "worktree add".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        self.allocated.lock().unwrap_or_else(|e| e.into_inner()).insert(worktree_path.clone());

        Ok(WorktreeHandle {
            item_id: item_id.to_string(),
            path: worktree_path,
            branch: Some(branch_name),
        })
    }

    /// Revert any partial mutation and delete the worktree directory.
    /// Idempotent: releasing a handle twice, or a handle whose path equals
    /// `workdir` (the `max_parallel = 1` shortcut), is a no-op.
    pub fn release(&self, handle: &WorktreeHandle) -> Result<(), WorktreeError> {
        let Some(branch) = &handle.branch else {
            return Ok(());
        };

        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&handle.path)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree remove".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::GitExit {
                    command: "worktree remove".into(),
                    code: output.status.code().unwrap_or(-1),
                    stderr,
                });
            }
        }

        self.allocated.lock().unwrap_or_else(|e| e.into_inner()).remove(&handle.path);

        let _ = Command::new("git")
            .args(["branch", "-D", branch])
            .current_dir(&self.repo_path)
            .output();

        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.repo_path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git worktree list".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "worktree list".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        parse_porcelain_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Probe the worktree for uncommitted changes (used by the evaluator's
    /// `strict_landing` check).
    pub fn has_uncommitted_changes(&self, handle: &WorktreeHandle) -> Result<bool, WorktreeError> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&handle.path)
            .output()
            .map_err(|e| WorktreeError::GitCommand {
                message: "failed to run git status --porcelain".into(),
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(WorktreeError::GitExit {
                command: "status".into(),
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(!output.stdout.is_empty())
    }

    fn cleanup_partial(&self, path: &Path) {
        if path.exists() {
            tracing::warn!(path = %path.display(), "cleaning up partial worktree directory");
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.repo_path)
            .output();
    }
}

fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_head: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let (Some(path), Some(head)) = (current_path.take(), current_head.take()) {
                worktrees.push(WorktreeInfo { path, branch: current_branch.take(), head_commit: head });
            } else {
                current_branch = None;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("HEAD ") {
            current_head = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("branch ") {
            current_branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_string());
        }
    }

    if let (Some(path), Some(head)) = (current_path, current_head) {
        worktrees.push(WorktreeInfo { path, branch: current_branch, head_commit: head });
    }

    Ok(worktrees)
}
