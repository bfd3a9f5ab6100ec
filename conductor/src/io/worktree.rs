//! Goal worktrees: naming, lookup, and lock-guarded git mutations.
//!
//! Every operation that touches a project's base checkout holds the
//! `worktree-base` lock for that project. Branch creation nests the `branch`
//! lock inside it; merges take `merge` first and `worktree-base` inside it.
//! A failed acquisition returns before git runs.
//!
//! Goal ids are matched by prefix, so `goal-g1-2-x` counts as a worktree of
//! both `g1` and `g1-2`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use super::git::Git;
use super::lock::LockManager;
use super::project::ProjectInfo;
use crate::core::lock::{LockRequest, LockType, sanitize_resource};

/// Why a goal's worktree could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeLookupError {
    #[error("workspace {} does not exist", .0.display())]
    WorkspaceMissing(PathBuf),
    #[error("no worktree matching '{pattern}' under {}", .dir.display())]
    NotFound { dir: PathBuf, pattern: String },
    #[error("several worktrees match '{pattern}' under {}: {}", .dir.display(), .matches.join(", "))]
    Ambiguous {
        dir: PathBuf,
        pattern: String,
        matches: Vec<String>,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Branch and directory name for a goal worktree.
pub fn worktree_name(goal_id: &str, slug: &str) -> String {
    let slug = sanitize_resource(slug.trim());
    if slug.is_empty() {
        format!("goal-{goal_id}")
    } else {
        format!("goal-{goal_id}-{slug}")
    }
}

/// True if `dir_name` is a worktree directory for `goal_id`.
pub fn is_goal_worktree(dir_name: &str, goal_id: &str) -> bool {
    let prefix = format!("goal-{goal_id}");
    match dir_name.strip_prefix(&prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('-'),
        None => false,
    }
}

/// Find the single worktree directory for `goal_id` under `workspace`.
pub fn resolve_goal_worktree(
    workspace: &Path,
    goal_id: &str,
) -> Result<PathBuf, WorktreeLookupError> {
    let pattern = format!("goal-{goal_id}-*");
    let entries = match fs::read_dir(workspace) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorktreeLookupError::WorkspaceMissing(workspace.to_path_buf()));
        }
        Err(e) => {
            return Err(anyhow!(e)
                .context(format!("read workspace {}", workspace.display()))
                .into());
        }
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| anyhow!("read workspace entry: {e}"))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && is_goal_worktree(&name, goal_id) {
            matches.push(name);
        }
    }
    matches.sort();

    match matches.len() {
        0 => Err(WorktreeLookupError::NotFound {
            dir: workspace.to_path_buf(),
            pattern,
        }),
        1 => Ok(workspace.join(&matches[0])),
        _ => Err(WorktreeLookupError::Ambiguous {
            dir: workspace.to_path_buf(),
            pattern,
            matches,
        }),
    }
}

/// Lock-guarded git operations on project checkouts.
#[derive(Debug, Clone)]
pub struct WorktreeOps {
    locks: LockManager,
}

impl WorktreeOps {
    pub fn new(locks: LockManager) -> Self {
        Self { locks }
    }

    /// Create branch `goal-<id>-<slug>` and its worktree from the base branch.
    #[instrument(skip_all, fields(project = %project.name, goal_id))]
    pub fn create_goal_worktree(
        &self,
        project: &ProjectInfo,
        goal_id: &str,
        slug: &str,
        owner: &str,
    ) -> Result<PathBuf> {
        let name = worktree_name(goal_id, slug);
        let path = project.workspace.join(&name);
        let request = self.request(project, Some(goal_id), owner);

        self.locks.with_lock(
            LockType::WorktreeBase,
            &project.name,
            self.locks.default_timeout(LockType::WorktreeBase),
            &request,
            |_| {
                self.locks.with_lock(
                    LockType::Branch,
                    &name,
                    self.locks.default_timeout(LockType::Branch),
                    &request,
                    |_| {
                        if path.exists() {
                            return Err(anyhow!("worktree {} already exists", path.display()));
                        }
                        let git = Git::new(&project.repo);
                        if git.branch_exists(&name)? {
                            return Err(anyhow!("branch {name} already exists"));
                        }
                        git.add_worktree(&name, &path, &project.base_branch)?;
                        info!(path = %path.display(), branch = %name, "goal worktree created");
                        Ok(path.clone())
                    },
                )
            },
        )
    }

    /// Fast-forward the base checkout.
    #[instrument(skip_all, fields(project = %project.name))]
    pub fn pull_base(&self, project: &ProjectInfo, owner: &str) -> Result<()> {
        let request = self.request(project, None, owner);
        self.locks.with_lock(
            LockType::WorktreeBase,
            &project.name,
            self.locks.default_timeout(LockType::WorktreeBase),
            &request,
            |_| Git::new(&project.repo).pull_ff_only(),
        )
    }

    /// Merge `branch` into the base branch with a merge commit.
    #[instrument(skip_all, fields(project = %project.name, branch))]
    pub fn merge_goal_branch(&self, project: &ProjectInfo, branch: &str, owner: &str) -> Result<()> {
        let request = self.request(project, None, owner);
        self.locks.with_lock(
            LockType::Merge,
            &project.name,
            self.locks.default_timeout(LockType::Merge),
            &request,
            |_| {
                self.locks.with_lock(
                    LockType::WorktreeBase,
                    &project.name,
                    self.locks.default_timeout(LockType::WorktreeBase),
                    &request,
                    |_| {
                        let git = Git::new(&project.repo);
                        git.ensure_clean()?;
                        if git.current_branch()? != project.base_branch {
                            git.checkout_branch(&project.base_branch)?;
                        }
                        git.merge_no_ff(branch, &format!("Merge {branch}"))?;
                        info!("goal branch merged");
                        Ok(())
                    },
                )
            },
        )
    }

    fn request(&self, project: &ProjectInfo, goal_id: Option<&str>, owner: &str) -> LockRequest {
        LockRequest {
            owner: Some(owner.to_string()),
            goal_id: goal_id.map(str::to_string),
            project: Some(project.name.clone()),
            pid: None,
        }
    }
}
