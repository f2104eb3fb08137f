//! Per-improvement state machine.
//!
//! `Created -> Planning -> Implementing -> Reviewing -> Merging -> {Merged, Failed, Escalated}`
//!
//! Only the implementation step retries (once). Every other failure is
//! terminal for the improvement and reported through `PipelineOutcome`;
//! nothing here returns an error to the orchestrator.

use crate::event_log::EventLog;
use crate::merge_queue::{MergeJob, MergeOutcome, MergeQueue};
use crate::runner::{AgentRequest, AgentRunner};
use crate::validator::{Validator, ValidatorError};
use crate::workspace::{Disposition, Release, WorkspaceLease, WorkspaceManager};
use improve_core::markers::{self, ReviewVerdict, DONE_MARKER, PLAN_MARKER};
use improve_core::{
    prompt, Config, EventKind, FailureReason, Id, Improvement, PipelineState, StepKind, StepResult,
    Workspace,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Implementation is attempted at most this many times.
const IMPLEMENT_ATTEMPTS: u32 = 2;

/// Everything a pipeline needs, shared across concurrent pipelines.
#[derive(Debug)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub runner: Arc<dyn AgentRunner>,
    pub workspaces: Arc<WorkspaceManager>,
    pub validator: Validator,
    pub merges: MergeQueue,
    pub events: Arc<EventLog>,
    pub cancel: CancellationToken,
}

/// Terminal result of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub improvement: Improvement,
    pub reason: Option<FailureReason>,
    pub detail: Option<String>,
    pub commit: Option<String>,
}

impl PipelineOutcome {
    pub fn merged(&self) -> bool {
        self.improvement.state == PipelineState::Merged
    }
}

/// Why the pipeline stopped early, and what to do with the workspace.
#[derive(Debug)]
struct Stop {
    reason: FailureReason,
    detail: Option<String>,
    release: Release,
}

impl Stop {
    fn new(reason: FailureReason, detail: Option<String>, release: Release) -> Self {
        Self {
            reason,
            detail,
            release,
        }
    }
}

fn terminal_state(reason: FailureReason) -> PipelineState {
    match reason {
        FailureReason::ReviewEscalation | FailureReason::MergeFailed => PipelineState::Escalated,
        _ => PipelineState::Failed,
    }
}

#[derive(Debug)]
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    improvement: Improvement,
    worker_id: usize,
    artifact_dir: PathBuf,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineContext>, improvement: Improvement, worker_id: usize) -> Self {
        let artifact_dir = ctx.config.improvement_dir(improvement.id);
        Self {
            ctx,
            improvement,
            worker_id,
            artifact_dir,
        }
    }

    pub fn plan_path(&self) -> PathBuf {
        self.artifact_dir.join("plan.md")
    }

    /// Drive the improvement to a terminal state.
    pub async fn run(mut self) -> PipelineOutcome {
        let lease = match self.ctx.workspaces.create(&self.improvement.branch).await {
            Ok(lease) => lease,
            Err(err) => {
                let stop = Stop::new(
                    FailureReason::WorkspaceUnavailable,
                    Some(err.to_string()),
                    Release::Preserve,
                );
                return self.stop(stop, None).await;
            }
        };
        self.improvement.workspace_path = Some(lease.path().to_path_buf());

        info!(
            improvement_id = self.improvement.id,
            worker_id = self.worker_id,
            branch = %self.improvement.branch,
            resumed = lease.workspace().resumed,
            task = %self.improvement.task,
            "improvement started"
        );
        self.ctx.events.emit(EventKind::WorkerStarted {
            improvement_id: self.improvement.id,
            worker_id: self.worker_id,
            branch: self.improvement.branch.clone(),
            task: self.improvement.task.clone(),
            task_fingerprint: self.improvement.task_fingerprint.clone(),
            resumed: lease.workspace().resumed,
        });

        let workspace = lease.workspace().clone();
        if let Err(stop) = self.build(&workspace).await {
            return self.stop(stop, Some(lease)).await;
        }
        if let Err(stop) = self.check_cancel() {
            return self.stop(stop, Some(lease)).await;
        }

        self.merge(lease).await
    }

    /// Planning, implementation and the review loop.
    async fn build(&mut self, workspace: &Workspace) -> Result<(), Stop> {
        if workspace.resumed {
            info!(
                improvement_id = self.improvement.id,
                branch = %workspace.branch,
                "resuming existing work; skipping planning"
            );
        } else {
            self.plan(workspace).await?;
        }
        self.implement(workspace).await?;
        self.review(workspace).await
    }

    async fn plan(&mut self, workspace: &Workspace) -> Result<(), Stop> {
        self.transition(PipelineState::Planning);
        let plan_path = self.plan_path();
        let prompt = prompt::plan_prompt(&self.improvement.task, &plan_path);

        let result = self.step(StepKind::Plan, 1, prompt, &workspace.path).await;
        self.check_cancel()?;
        if !result.success {
            return Err(Stop::new(
                FailureReason::PlanningFailed,
                result.error,
                Release::Preserve,
            ));
        }
        if !plan_written(&plan_path) {
            return Err(Stop::new(
                FailureReason::PlanMissing,
                Some(format!("no plan at {}", plan_path.display())),
                Release::Preserve,
            ));
        }

        self.ctx.events.emit(EventKind::PlanCreated {
            improvement_id: self.improvement.id,
            plan_path: plan_path.display().to_string(),
            summary: markers::marker_value(&result.output, PLAN_MARKER),
        });
        Ok(())
    }

    async fn implement(&mut self, workspace: &Workspace) -> Result<(), Stop> {
        self.transition(PipelineState::Implementing);
        let prompt = prompt::implement_prompt(&self.improvement.task, &self.plan_path());

        let mut last_error = None;
        let mut summary = None;
        for attempt in 1..=IMPLEMENT_ATTEMPTS {
            let result = self
                .step(StepKind::Implement, attempt, prompt.clone(), &workspace.path)
                .await;
            // A finished step is committed even when cancellation arrives.
            if result.success {
                summary = Some(markers::marker_value(&result.output, DONE_MARKER));
                break;
            }
            self.check_cancel()?;
            warn!(
                improvement_id = self.improvement.id,
                attempt,
                error = result.error.as_deref().unwrap_or("unknown"),
                "implementation attempt failed"
            );
            last_error = result.error;
        }

        let Some(summary) = summary else {
            return Err(Stop::new(
                FailureReason::ImplementationFailed,
                last_error,
                Release::ExitPolicy,
            ));
        };

        let headline = summary.unwrap_or_else(|| first_line(&self.improvement.task));
        let message = format!("improve #{}: {headline}", self.improvement.id);
        let committed = self.commit(workspace, &message).await?;
        if !committed {
            let ahead = self
                .ctx
                .workspaces
                .commits_ahead(&workspace.branch)
                .await
                .map_err(|err| {
                    Stop::new(FailureReason::CommitFailed, Some(err.to_string()), Release::ExitPolicy)
                })?;
            if ahead == 0 {
                return Err(Stop::new(
                    FailureReason::NoChangesProduced,
                    None,
                    Release::Destroy,
                ));
            }
            info!(
                improvement_id = self.improvement.id,
                commits_ahead = ahead,
                "nothing new to commit; continuing with existing commits"
            );
        }
        self.check_cancel()
    }

    async fn review(&mut self, workspace: &Workspace) -> Result<(), Stop> {
        self.transition(PipelineState::Reviewing);
        let max_cycles = self.ctx.config.max_review_cycles;

        for cycle in 1..=max_cycles {
            self.improvement.review_cycles = cycle;
            let prompt = prompt::review_prompt(
                &self.improvement.task,
                &self.ctx.config.base_branch,
                &workspace.branch,
                cycle,
            );
            let result = self.step(StepKind::Review, cycle, prompt, &workspace.path).await;
            self.check_cancel()?;
            if !result.success {
                return Err(Stop::new(
                    FailureReason::ReviewFailed,
                    result.error,
                    Release::ExitPolicy,
                ));
            }

            let verdict = markers::classify_review(&result.output);
            info!(
                improvement_id = self.improvement.id,
                cycle,
                verdict = verdict.as_str(),
                "review classified"
            );
            let findings = match verdict {
                ReviewVerdict::Passed => return Ok(()),
                ReviewVerdict::Failed { findings } => findings,
                ReviewVerdict::Ambiguous => match self.validate(workspace).await? {
                    None => return Ok(()),
                    Some(context) => prompt::validation_findings(&context),
                },
            };

            let prompt = prompt::fix_prompt(&self.improvement.task, &findings);
            let fix = self.step(StepKind::Fix, cycle, prompt, &workspace.path).await;
            if !fix.success {
                self.check_cancel()?;
                return Err(Stop::new(FailureReason::FixFailed, fix.error, Release::ExitPolicy));
            }
            let message = format!(
                "improve #{}: address review findings (cycle {cycle})",
                self.improvement.id
            );
            self.commit(workspace, &message).await?;
            self.check_cancel()?;
        }

        Err(Stop::new(
            FailureReason::ReviewEscalation,
            Some(format!("review did not pass within {max_cycles} cycles")),
            Release::Preserve,
        ))
    }

    /// Run the validation tiebreaker. `None` means it passed; otherwise the
    /// failure context to seed the fix agent with.
    async fn validate(&mut self, workspace: &Workspace) -> Result<Option<String>, Stop> {
        let report = self
            .ctx
            .validator
            .run(&workspace.path, &self.artifact_dir, &self.ctx.cancel)
            .await;

        let (passed, duration_ms, context) = match report {
            Ok(report) => (report.passed, report.duration_ms, report.failure_context),
            Err(ValidatorError::Cancelled) => {
                return Err(Stop::new(FailureReason::Cancelled, None, Release::ExitPolicy));
            }
            Err(err) => {
                warn!(improvement_id = self.improvement.id, error = %err, "validation could not run");
                (false, 0, format!("validation could not run: {err}"))
            }
        };

        self.ctx.events.emit(EventKind::ValidationFinished {
            improvement_id: self.improvement.id,
            passed,
            duration_ms,
        });
        Ok((!passed).then_some(context))
    }

    async fn merge(mut self, lease: WorkspaceLease) -> PipelineOutcome {
        self.transition(PipelineState::Merging);
        let job = MergeJob {
            id: Id::new(),
            improvement_id: self.improvement.id,
            branch: self.improvement.branch.clone(),
            workspace: lease.detach(),
            task: self.improvement.task.clone(),
            task_fingerprint: self.improvement.task_fingerprint.clone(),
        };

        let stop = match self.ctx.merges.enqueue(job).await {
            Ok(MergeOutcome::Merged { commit }) => {
                self.transition(PipelineState::Merged);
                info!(
                    improvement_id = self.improvement.id,
                    branch = %self.improvement.branch,
                    review_cycles = self.improvement.review_cycles,
                    cost_usd = self.improvement.total_cost_usd(),
                    "improvement merged"
                );
                return PipelineOutcome {
                    improvement: self.improvement,
                    reason: None,
                    detail: None,
                    commit,
                };
            }
            Ok(MergeOutcome::NotMergeable { reason }) => {
                Stop::new(FailureReason::MergeConflict, Some(reason), Release::Preserve)
            }
            Ok(MergeOutcome::Failed { reason }) => {
                Stop::new(FailureReason::MergeFailed, Some(reason), Release::Preserve)
            }
            Err(err) => Stop::new(FailureReason::MergeFailed, Some(err.to_string()), Release::Preserve),
        };
        // The merge processor already settled the workspace.
        self.stop(stop, None).await
    }

    async fn stop(mut self, stop: Stop, lease: Option<WorkspaceLease>) -> PipelineOutcome {
        if let Some(lease) = lease {
            match lease.release(stop.release).await {
                Ok(Disposition::Destroyed) => self.improvement.workspace_path = None,
                Ok(Disposition::Preserved { .. }) => {}
                Err(err) => {
                    warn!(
                        improvement_id = self.improvement.id,
                        error = %err,
                        "failed to release workspace"
                    );
                }
            }
        }

        let state = terminal_state(stop.reason);
        self.transition(state);

        let workspace_path = self
            .improvement
            .workspace_path
            .as_ref()
            .map(|p| p.display().to_string());
        warn!(
            improvement_id = self.improvement.id,
            branch = %self.improvement.branch,
            state = %state,
            reason = %stop.reason,
            detail = stop.detail.as_deref().unwrap_or(""),
            workspace = workspace_path.as_deref().unwrap_or("-"),
            "improvement did not merge"
        );

        let event = if state == PipelineState::Escalated {
            EventKind::ImprovementEscalated {
                improvement_id: self.improvement.id,
                branch: self.improvement.branch.clone(),
                reason: stop.reason,
                review_cycles: self.improvement.review_cycles,
                workspace_path,
            }
        } else {
            EventKind::ImprovementFailed {
                improvement_id: self.improvement.id,
                branch: self.improvement.branch.clone(),
                reason: stop.reason,
                detail: stop.detail.clone(),
                workspace_path,
            }
        };
        self.ctx.events.emit(event);

        PipelineOutcome {
            improvement: self.improvement,
            reason: Some(stop.reason),
            detail: stop.detail,
            commit: None,
        }
    }

    /// Run one agent step with start/end events and usage bookkeeping.
    async fn step(
        &mut self,
        step: StepKind,
        attempt: u32,
        prompt: String,
        working_dir: &Path,
    ) -> StepResult {
        let config = &self.ctx.config;
        let model = config.model_for(step).to_string();
        self.ctx.events.emit(EventKind::StepStart {
            improvement_id: self.improvement.id,
            step,
            attempt,
            model: model.clone(),
        });

        let request = AgentRequest {
            improvement_id: self.improvement.id,
            step,
            attempt,
            prompt,
            working_dir: working_dir.to_path_buf(),
            model,
            backend: config.backend,
            max_turns: config.max_turns_for(step),
            artifact_dir: self.artifact_dir.clone(),
            cancel: self.ctx.cancel.clone(),
        };
        let result = self.ctx.runner.run(request).await;
        self.improvement.record(step, attempt, &result);

        self.ctx.events.emit(EventKind::StepEnd {
            improvement_id: self.improvement.id,
            step,
            attempt,
            success: result.success,
            turns: result.turns,
            cost_usd: result.cost_usd,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        });
        result
    }

    async fn commit(&self, workspace: &Workspace, message: &str) -> Result<bool, Stop> {
        self.ctx
            .workspaces
            .commit_all(workspace, message)
            .await
            .map_err(|err| Stop::new(FailureReason::CommitFailed, Some(err.to_string()), Release::ExitPolicy))
    }

    fn check_cancel(&self) -> Result<(), Stop> {
        if self.ctx.cancel.is_cancelled() {
            return Err(Stop::new(FailureReason::Cancelled, None, Release::ExitPolicy));
        }
        Ok(())
    }

    fn transition(&mut self, to: PipelineState) {
        let from = self.improvement.state;
        if from == to {
            return;
        }
        self.improvement.state = to;
        info!(
            improvement_id = self.improvement.id,
            from = %from,
            to = %to,
            "state changed"
        );
        self.ctx.events.emit(EventKind::StateChanged {
            improvement_id: self.improvement.id,
            from,
            to,
        });
    }
}

fn plan_written(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    let mut headline: String = line.chars().take(72).collect();
    if line.chars().count() > 72 {
        headline.push_str("...");
    }
    headline
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::merge_queue::GitMergeProcessor;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Behaviour = dyn Fn(&AgentRequest) -> StepResult + Send + Sync;

    /// Agent fake driven by a closure; records every request.
    pub struct ScriptedRunner {
        behaviour: Box<Behaviour>,
        pub calls: Mutex<Vec<AgentRequest>>,
    }

    impl ScriptedRunner {
        pub fn new(behaviour: impl Fn(&AgentRequest) -> StepResult + Send + Sync + 'static) -> Self {
            Self {
                behaviour: Box::new(behaviour),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn steps(&self) -> Vec<(StepKind, u32)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|r| (r.step, r.attempt))
                .collect()
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(&self, request: AgentRequest) -> StepResult {
            let result = (self.behaviour)(&request);
            self.calls.lock().unwrap().push(request);
            result
        }
    }

    pub fn ok(output: &str) -> StepResult {
        StepResult {
            success: true,
            turns: 1,
            cost_usd: 0.01,
            output: output.to_string(),
            ..StepResult::default()
        }
    }

    pub fn err(message: &str) -> StepResult {
        StepResult::failed(improve_core::BackendKind::Claude, message, 1)
    }

    /// Plan writes the plan file; implement writes a file named after the attempt.
    pub fn write_plan(request: &AgentRequest) -> StepResult {
        std::fs::create_dir_all(&request.artifact_dir).unwrap();
        std::fs::write(request.artifact_dir.join("plan.md"), "1. do it\n").unwrap();
        ok("PLAN: do it")
    }

    pub fn write_change(request: &AgentRequest, name: &str) -> StepResult {
        std::fs::write(request.working_dir.join(name), format!("{:?}", request.step)).unwrap();
        ok("DONE: changed")
    }

    pub fn test_config(dir: &TempDir) -> Config {
        Config {
            log_dir: dir.path().join("logs"),
            worktree_path_template: "../wt/{{ branch | sanitize }}".to_string(),
            max_review_cycles: 2,
            ..Config::default()
        }
    }

    /// A context over a real temporary repository with a local merge queue.
    pub fn context(
        dir: &TempDir,
        config: Config,
        runner: Arc<dyn AgentRunner>,
    ) -> (Arc<PipelineContext>, PathBuf) {
        let log_path = config.event_log_path();
        let events = Arc::new(EventLog::open(&log_path).unwrap());
        let workspaces = Arc::new(WorkspaceManager::new(
            crate::git::test_support::repo_path(dir),
            &config,
            Arc::clone(&events),
        ));
        let processor = Arc::new(GitMergeProcessor::new(
            Arc::clone(&workspaces),
            config.merge_mode,
            config.remote.clone(),
            config.gh_bin.clone(),
        ));
        let (merges, _consumer) = MergeQueue::spawn(processor, Arc::clone(&events));
        let ctx = PipelineContext {
            validator: Validator::from_config(&config),
            config: Arc::new(config),
            runner,
            workspaces,
            merges,
            events,
            cancel: CancellationToken::new(),
        };
        (Arc::new(ctx), log_path)
    }
}
