//! Serialized merge decisions.
//!
//! A single consumer task owns the integration target. Pipelines submit
//! `MergeJob`s through a cloneable handle and wait on a oneshot reply; jobs
//! are processed one at a time in the order they were enqueued.

use crate::event_log::EventLog;
use crate::git::{self, GitError};
use crate::workspace::{Release, WorkspaceManager};
use async_trait::async_trait;
use improve_core::reconcile::{merge_commit_body, merge_commit_subject};
use improve_core::{EventKind, Id, MergeMode, Workspace};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum MergeQueueError {
    #[error("merge queue is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MergeQueueError>;

#[derive(Debug, Clone)]
pub struct MergeJob {
    pub id: Id,
    pub improvement_id: u32,
    pub branch: String,
    pub workspace: Workspace,
    pub task: String,
    pub task_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged { commit: Option<String> },
    /// Could not be merged cleanly after re-sync; the improvement fails.
    NotMergeable { reason: String },
    /// The merge itself broke; needs a human.
    Failed { reason: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::Merged { .. } => None,
            Self::NotMergeable { reason } | Self::Failed { reason } => Some(reason.clone()),
        }
    }
}

/// Performs the merge for one job. Called by exactly one task at a time.
#[async_trait]
pub trait MergeProcessor: Send + Sync {
    async fn process(&self, job: &MergeJob) -> MergeOutcome;
}

struct Queued {
    job: MergeJob,
    reply: oneshot::Sender<MergeOutcome>,
}

/// Handle to the merge consumer. Cheap to clone.
#[derive(Clone)]
pub struct MergeQueue {
    tx: mpsc::UnboundedSender<Queued>,
    pending: Arc<AtomicUsize>,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeQueue")
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MergeQueue {
    /// Start the consumer task. It exits once every handle has been dropped
    /// and the backlog of jobs is drained.
    pub fn spawn(processor: Arc<dyn MergeProcessor>, events: Arc<EventLog>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Queued>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = Arc::clone(&pending);
        let worker_events = Arc::clone(&events);
        let handle = tokio::spawn(async move {
            while let Some(Queued { job, reply }) = rx.recv().await {
                info!(
                    job_id = %job.id,
                    improvement_id = job.improvement_id,
                    branch = %job.branch,
                    "processing merge job"
                );
                let outcome = processor.process(&job).await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);

                info!(
                    job_id = %job.id,
                    branch = %job.branch,
                    merged = outcome.is_merged(),
                    reason = outcome.reason().as_deref().unwrap_or(""),
                    "merge job finished"
                );
                worker_events.emit(EventKind::MergeCompleted {
                    job_id: job.id.clone(),
                    improvement_id: job.improvement_id,
                    branch: job.branch.clone(),
                    success: outcome.is_merged(),
                    reason: outcome.reason(),
                    commit: match &outcome {
                        MergeOutcome::Merged { commit } => commit.clone(),
                        _ => None,
                    },
                });

                if reply.send(outcome).is_err() {
                    warn!(job_id = %job.id, "merge requester went away before the result");
                }
            }
        });

        (
            Self {
                tx,
                pending,
                events,
            },
            handle,
        )
    }

    /// Jobs enqueued but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Submit a job and wait for its turn and its result.
    pub async fn enqueue(&self, job: MergeJob) -> Result<MergeOutcome> {
        let (reply, rx) = oneshot::channel();
        let position = self.pending.fetch_add(1, Ordering::SeqCst);

        self.events.emit(EventKind::MergeQueued {
            job_id: job.id.clone(),
            improvement_id: job.improvement_id,
            branch: job.branch.clone(),
            position,
        });
        info!(job_id = %job.id, branch = %job.branch, position, "merge job queued");

        if self.tx.send(Queued { job, reply }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(MergeQueueError::Closed);
        }
        rx.await.map_err(|_| MergeQueueError::Closed)
    }
}

// --- Git-backed processor ---

/// Merges improvement branches into the base branch.
#[derive(Debug)]
pub struct GitMergeProcessor {
    workspaces: Arc<WorkspaceManager>,
    mode: MergeMode,
    remote: String,
    gh_bin: PathBuf,
}

impl GitMergeProcessor {
    pub fn new(workspaces: Arc<WorkspaceManager>, mode: MergeMode, remote: String, gh_bin: PathBuf) -> Self {
        Self {
            workspaces,
            mode,
            remote,
            gh_bin,
        }
    }

    /// Bring the branch up to date with `upstream` inside its workspace.
    async fn resync(&self, job: &MergeJob, upstream: &str) -> std::result::Result<(), MergeOutcome> {
        let message = format!("Merge {upstream} into {}", job.branch);
        match git::merge_branch(&job.workspace.path, upstream, &message).await {
            Ok(()) => Ok(()),
            Err(GitError::MergeConflict(detail)) => Err(MergeOutcome::NotMergeable {
                reason: format!("conflicts with {upstream}: {detail}"),
            }),
            Err(err) => Err(MergeOutcome::Failed {
                reason: format!("re-sync with {upstream} failed: {err}"),
            }),
        }
    }

    /// Merge into the base branch in the primary checkout.
    ///
    /// If the primary checkout is on another branch and clean, it is switched
    /// to the base branch first and left there.
    async fn merge_local(&self, job: &MergeJob) -> MergeOutcome {
        let repo = self.workspaces.repo();
        let base = self.workspaces.base_branch();

        if let Err(outcome) = self.resync(job, base).await {
            return outcome;
        }
        match git::is_ancestor(repo, base, &job.branch).await {
            Ok(true) => {}
            Ok(false) => {
                return MergeOutcome::NotMergeable {
                    reason: format!("{base} is not an ancestor of {} after re-sync", job.branch),
                }
            }
            Err(err) => return MergeOutcome::Failed { reason: err.to_string() },
        }

        match git::current_branch(repo).await {
            Ok(current) if current == base => {}
            Ok(current) => {
                if !git::is_working_tree_clean(repo).await.unwrap_or(false) {
                    return MergeOutcome::Failed {
                        reason: format!("primary checkout is on {current} with local changes"),
                    };
                }
                info!(from = %current, to = %base, "switching primary checkout to the base branch");
                if let Err(err) = git::checkout_branch(repo, base).await {
                    return MergeOutcome::Failed { reason: err.to_string() };
                }
            }
            Err(err) => return MergeOutcome::Failed { reason: err.to_string() },
        }

        let message = format!(
            "{}\n\n{}",
            merge_commit_subject(&job.branch, &job.task_fingerprint),
            merge_commit_body(&job.task)
        );
        match git::merge_branch(repo, &job.branch, &message).await {
            Ok(()) => MergeOutcome::Merged {
                commit: git::rev_parse(repo, "HEAD").await.ok(),
            },
            Err(GitError::MergeConflict(detail)) => MergeOutcome::NotMergeable { reason: detail },
            Err(err) => MergeOutcome::Failed { reason: err.to_string() },
        }
    }

    async fn merge_review_request(&self, job: &MergeJob) -> MergeOutcome {
        let repo = self.workspaces.repo();
        let base = self.workspaces.base_branch();
        let upstream = format!("{}/{base}", self.remote);

        if let Err(err) = git::fetch(repo, &self.remote, base).await {
            return MergeOutcome::Failed { reason: err.to_string() };
        }
        if let Err(outcome) = self.resync(job, &upstream).await {
            return outcome;
        }
        if let Err(err) = git::push_branch(repo, &self.remote, &job.branch).await {
            return MergeOutcome::Failed { reason: err.to_string() };
        }

        let subject = merge_commit_subject(&job.branch, &job.task_fingerprint);
        let body = merge_commit_body(&job.task);

        let existing = match git::find_review_request(&self.gh_bin, repo, &job.branch).await {
            Ok(found) => found.filter(git::ReviewRequest::is_open),
            Err(err) => return MergeOutcome::Failed { reason: err.to_string() },
        };
        let request = match existing {
            Some(request) => request,
            None => {
                let title = job.task.lines().next().unwrap_or(&job.branch);
                if let Err(err) =
                    git::create_review_request(&self.gh_bin, repo, base, &job.branch, title, &body).await
                {
                    return MergeOutcome::Failed { reason: err.to_string() };
                }
                match git::find_review_request(&self.gh_bin, repo, &job.branch).await {
                    Ok(Some(request)) => request,
                    Ok(None) => {
                        return MergeOutcome::Failed {
                            reason: "pull request not found after creation".to_string(),
                        }
                    }
                    Err(err) => return MergeOutcome::Failed { reason: err.to_string() },
                }
            }
        };
        info!(branch = %job.branch, url = %request.url, "review request ready");

        if request.mergeable.eq_ignore_ascii_case("conflicting") {
            return MergeOutcome::NotMergeable {
                reason: format!("pull request {} has conflicts", request.url),
            };
        }

        match git::merge_review_request(&self.gh_bin, repo, request.number, &subject, &body).await {
            Ok(()) => {
                if let Err(err) = git::fetch(repo, &self.remote, base).await {
                    warn!(error = %err, "fetch after merge failed");
                }
                MergeOutcome::Merged {
                    commit: git::rev_parse(repo, &upstream).await.ok(),
                }
            }
            Err(GitError::MergeConflict(detail)) => MergeOutcome::NotMergeable { reason: detail },
            Err(err) => MergeOutcome::Failed { reason: err.to_string() },
        }
    }
}

#[async_trait]
impl MergeProcessor for GitMergeProcessor {
    async fn process(&self, job: &MergeJob) -> MergeOutcome {
        let outcome = match self.mode {
            MergeMode::Local => self.merge_local(job).await,
            MergeMode::ReviewRequest => self.merge_review_request(job).await,
        };

        let release = if outcome.is_merged() {
            Release::Destroy
        } else {
            Release::Preserve
        };
        if let Err(err) = self.workspaces.release(&job.branch, release).await {
            warn!(branch = %job.branch, error = %err, "failed to release workspace after merge");
        }
        outcome
    }
}
