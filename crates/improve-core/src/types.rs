//! Core types shared by the pipeline, merge queue, and reconciliation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for loop sessions and merge jobs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Branch name for an improvement: prefix plus zero-padded sequence number.
///
/// ```
/// assert_eq!(improve_core::branch_name("improve/", 7, 3), "improve/007");
/// ```
pub fn branch_name(prefix: &str, id: u32, width: usize) -> String {
    format!("{prefix}{id:0width$}")
}

/// Parse the sequence number back out of an improvement branch name.
pub fn parse_branch_id(prefix: &str, branch: &str) -> Option<u32> {
    branch.strip_prefix(prefix)?.parse().ok()
}

// --- Enumerations ---

/// Which agent CLI executes a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Claude,
    Codex,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Executable looked up on `PATH` when `agent_bin` is not configured.
    pub fn default_bin(&self) -> &'static str {
        self.as_str()
    }
}

/// Agent step within the improvement pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plan,
    Implement,
    Review,
    Fix,
    Refill,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Fix => "fix",
            Self::Refill => "refill",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline state machine positions.
///
/// `Created -> Planning -> Implementing -> Reviewing -> Merging -> {Merged, Failed, Escalated}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Planning,
    Implementing,
    Reviewing,
    Merging,
    Merged,
    Failed,
    Escalated,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Escalated)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an improvement did not merge. Recorded as the `reason` of failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    WorkspaceUnavailable,
    PlanningFailed,
    PlanMissing,
    ImplementationFailed,
    NoChangesProduced,
    CommitFailed,
    ReviewFailed,
    FixFailed,
    ReviewEscalation,
    MergeConflict,
    MergeFailed,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkspaceUnavailable => "workspace_unavailable",
            Self::PlanningFailed => "planning_failed",
            Self::PlanMissing => "plan_missing",
            Self::ImplementationFailed => "implementation_failed",
            Self::NoChangesProduced => "no_changes_produced",
            Self::CommitFailed => "commit_failed",
            Self::ReviewFailed => "review_failed",
            Self::FixFailed => "fix_failed",
            Self::ReviewEscalation => "review_escalation",
            Self::MergeConflict => "merge_conflict",
            Self::MergeFailed => "merge_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a finished branch reaches the base branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Merge commit in the primary checkout.
    #[default]
    Local,
    /// Push, open or reuse a pull request, merge it through `gh`.
    ReviewRequest,
}

impl MergeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::ReviewRequest => "review_request",
        }
    }
}

// --- Records ---

/// Outcome of one agent invocation.
///
/// Transport problems (spawn failure, timeout, non-zero exit, cancellation)
/// are folded into `success = false` with `error` set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub backend: BackendKind,
    pub success: bool,
    pub turns: u32,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// A non-success result carrying only an error description.
    pub fn failed(backend: BackendKind, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            backend,
            success: false,
            duration_ms,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Usage retained per step after its output has been consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step: StepKind,
    pub attempt: u32,
    pub success: bool,
    pub turns: u32,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

impl StepSummary {
    pub fn from_result(step: StepKind, attempt: u32, result: &StepResult) -> Self {
        Self {
            step,
            attempt,
            success: result.success,
            turns: result.turns,
            cost_usd: result.cost_usd,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            duration_ms: result.duration_ms,
        }
    }
}

/// One unit of work advancing the completion counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub id: u32,
    pub branch: String,
    pub task: String,
    pub task_fingerprint: String,
    pub workspace_path: Option<PathBuf>,
    pub state: PipelineState,
    pub review_cycles: u32,
    pub steps: Vec<StepSummary>,
}

impl Improvement {
    pub fn new(id: u32, branch: impl Into<String>, task: impl Into<String>) -> Self {
        let task = task.into();
        Self {
            id,
            branch: branch.into(),
            task_fingerprint: crate::matching::fingerprint(&task),
            task,
            workspace_path: None,
            state: PipelineState::Created,
            review_cycles: 0,
            steps: Vec::new(),
        }
    }

    pub fn record(&mut self, step: StepKind, attempt: u32, result: &StepResult) {
        self.steps.push(StepSummary::from_result(step, attempt, result));
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.steps.iter().map(|s| s.cost_usd).sum()
    }

    pub fn total_turns(&self) -> u32 {
        self.steps.iter().map(|s| s.turns).sum()
    }
}

/// Isolated worktree bound to an improvement branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
    /// Existing branch with prior work was reattached instead of recreated.
    pub resumed: bool,
    pub has_commits: bool,
}
