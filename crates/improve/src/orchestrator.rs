//! Root loop: resolves tasks, runs pipelines, and counts merges.
//!
//! The orchestrator keeps up to `parallelism` pipelines in flight, each on its
//! own improvement id and workspace, and stops when `target` improvements
//! have merged, after three consecutive failures, or on cancellation. A
//! backlog entry is removed only after its improvement has merged.

use crate::event_log::EventLog;
use crate::git::{self, GitError};
use crate::merge_queue::{GitMergeProcessor, MergeQueue};
use crate::pipeline::{Pipeline, PipelineContext, PipelineOutcome};
use crate::reconcile::{self, ReconciliationEngine};
use crate::runner::{AgentRequest, AgentRunner};
use crate::validator::Validator;
use crate::workspace::WorkspaceManager;
use improve_core::backlog::BacklogError;
use improve_core::{prompt, BacklogStore, Config, EventKind, Id, Improvement, MergeMode, StepKind};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive failed improvements that stop the loop.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("required dependency not available: {0}")]
    DependencyMissing(String),
    #[error("stopping after {failures} consecutive failures (last: {last})")]
    TooManyFailures { failures: u32, last: String },
    #[error("interrupted after {completed} merged improvement(s)")]
    Interrupted { completed: u32 },
    #[error("pipeline worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("backlog error: {0}")]
    Backlog(#[from] BacklogError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Where an in-flight task came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskSource {
    Override(String),
    Backlog(String),
}

impl TaskSource {
    fn text(&self) -> &str {
        match self {
            Self::Override(text) | Self::Backlog(text) => text,
        }
    }
}

/// Final tally of one loop.
#[derive(Debug, Clone)]
pub struct LoopSummary {
    pub session_id: Id,
    pub completed: u32,
    pub target: u32,
    pub attempted: u32,
    pub failed: u32,
}

/// Check that `git` and the agent executable respond to `--version`.
pub async fn preflight(config: &Config) -> Result<()> {
    if !git::is_available(Path::new("git")).await {
        return Err(OrchestratorError::DependencyMissing("git".to_string()));
    }
    let agent = config.agent_bin();
    if !git::is_available(&agent).await {
        return Err(OrchestratorError::DependencyMissing(agent.display().to_string()));
    }
    if config.merge_mode == MergeMode::ReviewRequest && !git::is_available(&config.gh_bin).await {
        return Err(OrchestratorError::DependencyMissing(config.gh_bin.display().to_string()));
    }
    Ok(())
}

#[derive(Debug)]
pub struct Orchestrator {
    config: Arc<Config>,
    repo: PathBuf,
    events: Arc<EventLog>,
    runner: Arc<dyn AgentRunner>,
    backlog: BacklogStore,
    cancel: CancellationToken,
    task_override: Option<String>,
    merged_ids: BTreeSet<u32>,
}

/// Mutable loop bookkeeping.
#[derive(Debug, Default)]
struct LoopState {
    completed: u32,
    attempted: u32,
    failed: u32,
    consecutive_failures: u32,
    last_failure: Option<String>,
    launched_any: bool,
    stopping: bool,
}

impl LoopState {
    fn record_failure(&mut self, detail: String) {
        self.failed += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(detail);
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.stopping = true;
        }
    }

    fn hard_stopped(&self) -> bool {
        self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES
    }
}

impl Orchestrator {
    pub fn new(
        config: Config,
        repo: impl Into<PathBuf>,
        events: Arc<EventLog>,
        runner: Arc<dyn AgentRunner>,
        cancel: CancellationToken,
    ) -> Self {
        let backlog = BacklogStore::new(&config.backlog_file);
        Self {
            config: Arc::new(config),
            repo: repo.into(),
            events,
            runner,
            backlog,
            cancel,
            task_override: None,
            merged_ids: BTreeSet::new(),
        }
    }

    /// Work on `task` first instead of the backlog head.
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        let task = task.into();
        let task = task.trim();
        self.task_override = (!task.is_empty()).then(|| task.to_string());
        self
    }

    /// Run until the target is reached or the loop has to stop.
    pub async fn run(mut self) -> Result<LoopSummary> {
        let session_id = Id::new();
        let target = self.config.target;
        let parallelism = self.config.parallelism.max(1);

        let workspaces = Arc::new(WorkspaceManager::new(
            &self.repo,
            &self.config,
            Arc::clone(&self.events),
        ));
        let processor = Arc::new(GitMergeProcessor::new(
            Arc::clone(&workspaces),
            self.config.merge_mode,
            self.config.remote.clone(),
            self.config.gh_bin.clone(),
        ));
        let (merges, consumer) = MergeQueue::spawn(processor, Arc::clone(&self.events));
        let ctx = Arc::new(PipelineContext {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            workspaces: Arc::clone(&workspaces),
            validator: Validator::from_config(&self.config),
            merges,
            events: Arc::clone(&self.events),
            cancel: self.cancel.clone(),
        });

        info!(
            session_id = %session_id,
            target,
            parallelism,
            repo = %self.repo.display(),
            "improvement loop started"
        );
        self.events.emit(EventKind::LoopStarted {
            session_id: session_id.clone(),
            target,
            parallelism,
        });

        let result = self.drive(&ctx, target, parallelism).await;

        for (branch, disposition) in workspaces.settle_abandoned().await {
            info!(branch = %branch, ?disposition, "settled abandoned workspace");
        }
        drop(ctx);
        if let Err(e) = consumer.await {
            warn!(error = %e, "merge queue consumer ended abnormally");
        }

        let (state, fatal) = match result {
            Ok(state) => (state, None),
            Err((state, err)) => (state, Some(err)),
        };

        let reason = if let Some(err) = &fatal {
            err.to_string()
        } else if state.hard_stopped() {
            format!("{} consecutive failures", state.consecutive_failures)
        } else if state.completed >= target {
            "target reached".to_string()
        } else {
            "interrupted".to_string()
        };
        info!(
            session_id = %session_id,
            completed = state.completed,
            attempted = state.attempted,
            failed = state.failed,
            reason = %reason,
            "improvement loop stopped"
        );
        self.events.emit(EventKind::LoopStopped {
            session_id: session_id.clone(),
            completed: state.completed,
            reason,
        });

        if self.config.reconcile_on_exit {
            match ReconciliationEngine::new(&self.config, &self.repo).run(false).await {
                Ok(report) => info!(removed = report.total_removed(), "exit reconciliation finished"),
                Err(e) => warn!(error = %e, "exit reconciliation failed"),
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        if state.hard_stopped() {
            return Err(OrchestratorError::TooManyFailures {
                failures: state.consecutive_failures,
                last: state.last_failure.unwrap_or_default(),
            });
        }
        if state.completed < target {
            return Err(OrchestratorError::Interrupted {
                completed: state.completed,
            });
        }

        Ok(LoopSummary {
            session_id,
            completed: state.completed,
            target,
            attempted: state.attempted,
            failed: state.failed,
        })
    }

    async fn drive(
        &mut self,
        ctx: &Arc<PipelineContext>,
        target: u32,
        parallelism: usize,
    ) -> std::result::Result<LoopState, (LoopState, OrchestratorError)> {
        let mut state = LoopState::default();
        let mut in_flight: JoinSet<(usize, TaskSource, PipelineOutcome)> = JoinSet::new();
        let mut running: HashMap<u32, TaskSource> = HashMap::new();
        let mut free_workers: BTreeSet<usize> = (0..parallelism).collect();

        loop {
            while !state.stopping
                && running.len() < parallelism
                && state.completed + (running.len() as u32) < target
            {
                if self.cancel.is_cancelled() {
                    state.stopping = true;
                    break;
                }
                if state.launched_any && !self.cooldown().await {
                    state.stopping = true;
                    break;
                }
                state.launched_any = true;

                let source = match self.next_task(&running).await {
                    Ok(Some(source)) => source,
                    Ok(None) => {
                        state.record_failure("refill added no tasks".to_string());
                        continue;
                    }
                    Err(e) => {
                        state.stopping = true;
                        drain(&mut in_flight).await;
                        return Err((state, e));
                    }
                };
                let id = match self.next_id(&running).await {
                    Ok(id) => id,
                    Err(e) => {
                        state.stopping = true;
                        drain(&mut in_flight).await;
                        return Err((state, e));
                    }
                };
                let Some(worker_id) = free_workers.pop_first() else {
                    break;
                };

                let improvement =
                    Improvement::new(id, self.config.branch_for(id), source.text().to_string());
                debug!(improvement_id = id, worker_id, task = %source.text(), "launching pipeline");
                running.insert(id, source.clone());
                state.attempted += 1;

                let pipeline = Pipeline::new(Arc::clone(ctx), improvement, worker_id);
                in_flight.spawn(async move { (worker_id, source, pipeline.run().await) });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (worker_id, source, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "pipeline task failed");
                    state.stopping = true;
                    drain(&mut in_flight).await;
                    return Err((state, OrchestratorError::WorkerPanicked(e.to_string())));
                }
            };
            free_workers.insert(worker_id);
            running.remove(&outcome.improvement.id);

            if outcome.merged() {
                self.on_merged(&mut state, &source, &outcome, target);
            } else {
                let reason = outcome.reason.map_or("unknown", |r| r.as_str());
                let detail = match &outcome.detail {
                    Some(detail) => format!("#{} {reason}: {detail}", outcome.improvement.id),
                    None => format!("#{} {reason}", outcome.improvement.id),
                };
                state.record_failure(detail);
                warn!(
                    improvement_id = outcome.improvement.id,
                    reason = %reason,
                    consecutive_failures = state.consecutive_failures,
                    "improvement did not merge"
                );
            }

            if self.cancel.is_cancelled() {
                state.stopping = true;
            }
        }

        Ok(state)
    }

    fn on_merged(
        &mut self,
        state: &mut LoopState,
        source: &TaskSource,
        outcome: &PipelineOutcome,
        target: u32,
    ) {
        let improvement = &outcome.improvement;
        state.completed += 1;
        state.consecutive_failures = 0;
        self.merged_ids.insert(improvement.id);

        info!(
            improvement_id = improvement.id,
            branch = %improvement.branch,
            completed = state.completed,
            target,
            cost_usd = improvement.total_cost_usd(),
            "improvement completed"
        );
        self.events.emit(EventKind::ImprovementDone {
            improvement_id: improvement.id,
            branch: improvement.branch.clone(),
            review_cycles: improvement.review_cycles,
            cost_usd: improvement.total_cost_usd(),
            completed: state.completed,
            target,
        });

        match source {
            TaskSource::Override(_) => self.task_override = None,
            TaskSource::Backlog(text) => match self.backlog.remove_task(text) {
                Ok(Some(entry)) => {
                    debug!(improvement_id = improvement.id, task = %entry.text, "backlog entry popped");
                    self.events.emit(EventKind::BacklogPopped {
                        improvement_id: improvement.id,
                        file: self.backlog.label(),
                        task: entry.text,
                    });
                }
                Ok(None) => {
                    debug!(improvement_id = improvement.id, "merged task no longer in backlog");
                }
                Err(e) => {
                    warn!(improvement_id = improvement.id, error = %e, "failed to pop backlog entry");
                }
            },
        }
    }

    /// Next task: the override, then the first backlog entry not already in
    /// flight, then a refill. `None` when a refill produced nothing usable.
    async fn next_task(&self, running: &HashMap<u32, TaskSource>) -> Result<Option<TaskSource>> {
        if let Some(task) = &self.task_override {
            if !running.values().any(|s| s.text() == task) {
                return Ok(Some(TaskSource::Override(task.clone())));
            }
        }

        if let Some(text) = self.first_available(running)? {
            return Ok(Some(TaskSource::Backlog(text)));
        }

        if self.refill().await? == 0 {
            return Ok(None);
        }
        Ok(self.first_available(running)?.map(TaskSource::Backlog))
    }

    fn first_available(&self, running: &HashMap<u32, TaskSource>) -> Result<Option<String>> {
        Ok(self
            .backlog
            .read_all()?
            .into_iter()
            .map(|e| e.text)
            .find(|text| !running.values().any(|s| s.text() == text)))
    }

    /// Ask an agent to append tasks to the backlog; returns how many appeared.
    async fn refill(&self) -> Result<usize> {
        let before = self.backlog.read_all()?.len();
        info!(backlog = %self.backlog.path().display(), "backlog empty, refilling");

        let step = StepKind::Refill;
        let request = AgentRequest {
            improvement_id: 0,
            step,
            attempt: 1,
            prompt: prompt::refill_prompt(self.backlog.path()),
            working_dir: self.repo.clone(),
            model: self.config.model_for(step).to_string(),
            backend: self.config.backend,
            max_turns: self.config.max_turns_for(step),
            artifact_dir: self.config.log_dir.join("refill"),
            cancel: self.cancel.clone(),
        };
        let result = self.runner.run(request).await;
        if !result.success {
            warn!(error = ?result.error, "refill agent failed");
        }

        let added = self.backlog.read_all()?.len().saturating_sub(before);
        info!(added, "backlog refill finished");
        self.events.emit(EventKind::BacklogRefilled { added });
        Ok(added)
    }

    /// Historical merge count plus one, skipping ids in flight and ids whose
    /// branch has already merged. Parallel pipelines can merge out of order,
    /// so the count alone may point at a merged id.
    async fn next_id(&self, running: &HashMap<u32, TaskSource>) -> Result<u32> {
        let history = reconcile::history_ref(&self.config);
        let prefix = format!("Merge {}", self.config.branch_prefix);
        let mut id = git::count_merges(&self.repo, &history, &prefix).await? + 1;
        while running.contains_key(&id)
            || self.merged_ids.contains(&id)
            || git::find_merge_commit(&self.repo, &history, &self.config.branch_for(id))
                .await?
                .is_some()
        {
            id += 1;
        }
        Ok(id)
    }

    /// Sleep between launches; `false` when cancelled meanwhile.
    async fn cooldown(&self) -> bool {
        if self.config.cooldown_sec == 0 {
            return !self.cancel.is_cancelled();
        }
        debug!(seconds = self.config.cooldown_sec, "cooling down");
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(self.config.cooldown_sec)) => true,
            () = self.cancel.cancelled() => false,
        }
    }
}

/// Wait for in-flight pipelines so their workspaces are released.
async fn drain<T: 'static>(set: &mut JoinSet<T>) {
    while let Some(result) = set.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "pipeline task failed while draining");
        }
    }
}
