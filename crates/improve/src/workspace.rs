//! Workspace lifecycle: one git worktree per improvement branch.
//!
//! The manager owns the registry of active workspaces. Pipelines borrow a
//! workspace through a `WorkspaceLease` and must release it with an explicit
//! disposition; leases that are dropped without release stay registered and
//! are settled by `settle_abandoned` when the loop exits.

use crate::event_log::EventLog;
use crate::git::{self, GitError};
use improve_core::{Config, EventKind, Workspace};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("workspace for {0} is already in use")]
    AlreadyActive(String),
    #[error("workspace path {0} exists and is not a worktree")]
    PathOccupied(PathBuf),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// What happened to a workspace when it was let go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Destroyed,
    Preserved { commits_ahead: u32 },
}

/// How a lease holder wants its workspace released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Remove worktree and branch (confirmed merge or confirmed no-op).
    Destroy,
    /// Keep everything for inspection or resumption.
    Preserve,
    /// Destroy only when the branch carries no commits beyond the base.
    ExitPolicy,
}

#[derive(Debug)]
pub struct WorkspaceManager {
    repo: PathBuf,
    base_branch: String,
    path_template: String,
    events: Arc<EventLog>,
    /// Concurrent `git worktree` calls contend on repository lock files.
    worktree_lock: tokio::sync::Mutex<()>,
    active: Mutex<HashMap<String, PathBuf>>,
}

impl WorkspaceManager {
    pub fn new(repo: impl Into<PathBuf>, config: &Config, events: Arc<EventLog>) -> Self {
        Self {
            repo: repo.into(),
            base_branch: config.base_branch.clone(),
            path_template: config.worktree_path_template.clone(),
            events,
            worktree_lock: tokio::sync::Mutex::new(()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Where a fresh worktree for `branch` is placed.
    pub fn path_for(&self, branch: &str) -> PathBuf {
        let expanded = git::expand_worktree_template(&self.path_template, &self.repo, branch);
        git::resolve_worktree_path(&expanded, &self.repo)
    }

    /// Branches currently leased or awaiting settlement.
    pub fn active_branches(&self) -> Vec<String> {
        let mut branches: Vec<String> = self.registry().keys().cloned().collect();
        branches.sort();
        branches
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, PathBuf>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or resume the workspace for `branch`.
    ///
    /// A branch that already carries commits beyond the base is reattached
    /// (`resumed = true`). A branch with nothing on it is stale: it and any
    /// worktree still bound to it are removed and recreated from the base.
    pub async fn create(self: &Arc<Self>, branch: &str) -> Result<WorkspaceLease> {
        let _guard = self.worktree_lock.lock().await;

        if self.registry().contains_key(branch) {
            return Err(WorkspaceError::AlreadyActive(branch.to_string()));
        }

        let existing = self.worktree_for(branch).await?;
        let mut resumed = false;
        let mut commits_ahead = 0;

        if git::branch_exists(&self.repo, branch).await? {
            commits_ahead = git::commits_ahead(&self.repo, &self.base_branch, branch).await?;
            if commits_ahead > 0 {
                resumed = true;
            } else {
                debug!(branch, "removing stale branch with no commits");
                if let Some(path) = &existing {
                    git::remove_worktree_force(&self.repo, path).await?;
                }
                git::delete_branch(&self.repo, branch).await?;
            }
        } else if let Some(path) = &existing {
            // Worktree left behind by a branch deleted out from under it.
            git::remove_worktree_force(&self.repo, path).await?;
        }
        git::prune_worktrees(&self.repo).await?;

        let path = match existing.filter(|p| resumed && p.exists()) {
            Some(path) => path,
            None => {
                let path = self.path_for(branch);
                if path.exists() {
                    return Err(WorkspaceError::PathOccupied(path));
                }
                if !resumed {
                    git::create_branch(&self.repo, branch, &self.base_branch).await?;
                }
                git::create_worktree(&self.repo, &path, branch).await?;
                path
            }
        };

        self.registry().insert(branch.to_string(), path.clone());
        info!(
            branch,
            path = %path.display(),
            resumed,
            commits_ahead,
            "workspace ready"
        );
        self.events.emit(EventKind::WorkspaceCreated {
            branch: branch.to_string(),
            path: path.display().to_string(),
            resumed,
        });

        Ok(WorkspaceLease {
            manager: Arc::clone(self),
            workspace: Workspace {
                path,
                branch: branch.to_string(),
                resumed,
                has_commits: commits_ahead > 0,
            },
            released: false,
        })
    }

    async fn worktree_for(&self, branch: &str) -> Result<Option<PathBuf>> {
        let worktrees = git::list_worktrees(&self.repo).await?;
        Ok(worktrees
            .into_iter()
            .find(|w| w.branch.as_deref() == Some(branch))
            .map(|w| w.path))
    }

    /// Remove the worktree and delete the branch. Safe to call repeatedly.
    pub async fn cleanup(&self, branch: &str) -> Result<()> {
        let _guard = self.worktree_lock.lock().await;
        let registered = self.registry().remove(branch);

        let mut removed = false;
        if let Some(path) = self.worktree_for(branch).await?.or(registered) {
            if path.exists() {
                git::remove_worktree_force(&self.repo, &path).await?;
                removed = true;
            }
        }
        git::prune_worktrees(&self.repo).await?;

        if git::branch_exists(&self.repo, branch).await? {
            git::delete_branch(&self.repo, branch).await?;
            removed = true;
        }

        if removed {
            info!(branch, "workspace removed");
            self.events.emit(EventKind::WorkspaceRemoved {
                branch: branch.to_string(),
            });
        }
        Ok(())
    }

    pub async fn commits_ahead(&self, branch: &str) -> Result<u32> {
        Ok(git::commits_ahead(&self.repo, &self.base_branch, branch).await?)
    }

    /// Stage and commit everything in the workspace. `false` when clean.
    pub async fn commit_all(&self, workspace: &Workspace, message: &str) -> Result<bool> {
        Ok(git::commit_all(&workspace.path, message).await?)
    }

    /// Let go of a registered workspace.
    pub async fn release(&self, branch: &str, release: Release) -> Result<Disposition> {
        let destroy = match release {
            Release::Destroy => true,
            Release::Preserve => false,
            Release::ExitPolicy => {
                !git::branch_exists(&self.repo, branch).await?
                    || self.commits_ahead(branch).await? == 0
            }
        };

        if destroy {
            self.cleanup(branch).await?;
            return Ok(Disposition::Destroyed);
        }

        let path = self
            .registry()
            .remove(branch)
            .unwrap_or_else(|| self.path_for(branch));
        let commits_ahead = self.commits_ahead(branch).await.unwrap_or_else(|err| {
            warn!(branch, error = %err, "could not count commits on preserved branch");
            0
        });
        info!(branch, path = %path.display(), commits_ahead, "workspace preserved");
        self.events.emit(EventKind::WorkspacePreserved {
            branch: branch.to_string(),
            path: path.display().to_string(),
            commits_ahead,
        });
        Ok(Disposition::Preserved { commits_ahead })
    }

    /// Apply the exit policy to every workspace whose lease was never released.
    pub async fn settle_abandoned(&self) -> Vec<(String, Disposition)> {
        let mut settled = Vec::new();
        for branch in self.active_branches() {
            match self.release(&branch, Release::ExitPolicy).await {
                Ok(disposition) => settled.push((branch, disposition)),
                Err(err) => {
                    warn!(branch = %branch, error = %err, "failed to settle workspace on exit");
                    self.registry().remove(&branch);
                }
            }
        }
        settled
    }
}

/// Exclusive use of one workspace for the duration of a pipeline.
#[derive(Debug)]
pub struct WorkspaceLease {
    manager: Arc<WorkspaceManager>,
    workspace: Workspace,
    released: bool,
}

impl WorkspaceLease {
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn path(&self) -> &Path {
        &self.workspace.path
    }

    pub fn branch(&self) -> &str {
        &self.workspace.branch
    }

    pub fn manager(&self) -> &Arc<WorkspaceManager> {
        &self.manager
    }

    pub async fn release(mut self, release: Release) -> Result<Disposition> {
        self.released = true;
        self.manager.release(&self.workspace.branch, release).await
    }

    /// Give up the lease but keep the workspace registered; the merge queue
    /// or the exit sweep settles it.
    pub fn detach(mut self) -> Workspace {
        self.released = true;
        self.workspace.clone()
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                branch = %self.workspace.branch,
                "workspace lease dropped without release; exit sweep will settle it"
            );
        }
    }
}
