//! Event records for the append-only JSONL log.
//!
//! Each line is one `LogEvent`: a timestamp plus an internally tagged
//! `EventKind`. Reconciliation and the offline summary read these back.

use crate::types::{FailureReason, Id, PipelineState, StepKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EventKind,
}

impl LogEvent {
    pub fn now(event: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            event,
        }
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Every kind of record the loop writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    LoopStarted {
        session_id: Id,
        target: u32,
        parallelism: usize,
    },
    LoopStopped {
        session_id: Id,
        completed: u32,
        reason: String,
    },
    WorkerStarted {
        improvement_id: u32,
        worker_id: usize,
        branch: String,
        task: String,
        task_fingerprint: String,
        resumed: bool,
    },
    StateChanged {
        improvement_id: u32,
        from: PipelineState,
        to: PipelineState,
    },
    PlanCreated {
        improvement_id: u32,
        plan_path: String,
        summary: Option<String>,
    },
    StepStart {
        improvement_id: u32,
        step: StepKind,
        attempt: u32,
        model: String,
    },
    ToolCall {
        improvement_id: u32,
        step: StepKind,
        tool: String,
    },
    StepEnd {
        improvement_id: u32,
        step: StepKind,
        attempt: u32,
        success: bool,
        turns: u32,
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ValidationFinished {
        improvement_id: u32,
        passed: bool,
        duration_ms: u64,
    },
    ImprovementDone {
        improvement_id: u32,
        branch: String,
        review_cycles: u32,
        cost_usd: f64,
        completed: u32,
        target: u32,
    },
    ImprovementFailed {
        improvement_id: u32,
        branch: String,
        reason: FailureReason,
        detail: Option<String>,
        workspace_path: Option<String>,
    },
    ImprovementEscalated {
        improvement_id: u32,
        branch: String,
        reason: FailureReason,
        review_cycles: u32,
        workspace_path: Option<String>,
    },
    MergeQueued {
        job_id: Id,
        improvement_id: u32,
        branch: String,
        position: usize,
    },
    MergeCompleted {
        job_id: Id,
        improvement_id: u32,
        branch: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
    WorkspaceCreated {
        branch: String,
        path: String,
        resumed: bool,
    },
    WorkspaceRemoved {
        branch: String,
    },
    WorkspacePreserved {
        branch: String,
        path: String,
        commits_ahead: u32,
    },
    BacklogPopped {
        improvement_id: u32,
        file: String,
        task: String,
    },
    BacklogRefilled {
        added: usize,
    },
    BacklogReconciled {
        improvement_id: u32,
        file: String,
        line: String,
        exact: bool,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        improvement_id: Option<u32>,
        message: String,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoopStarted { .. } => "loop_started",
            Self::LoopStopped { .. } => "loop_stopped",
            Self::WorkerStarted { .. } => "worker_started",
            Self::StateChanged { .. } => "state_changed",
            Self::PlanCreated { .. } => "plan_created",
            Self::StepStart { .. } => "step_start",
            Self::ToolCall { .. } => "tool_call",
            Self::StepEnd { .. } => "step_end",
            Self::ValidationFinished { .. } => "validation_finished",
            Self::ImprovementDone { .. } => "improvement_done",
            Self::ImprovementFailed { .. } => "improvement_failed",
            Self::ImprovementEscalated { .. } => "improvement_escalated",
            Self::MergeQueued { .. } => "merge_queued",
            Self::MergeCompleted { .. } => "merge_completed",
            Self::WorkspaceCreated { .. } => "workspace_created",
            Self::WorkspaceRemoved { .. } => "workspace_removed",
            Self::WorkspacePreserved { .. } => "workspace_preserved",
            Self::BacklogPopped { .. } => "backlog_popped",
            Self::BacklogRefilled { .. } => "backlog_refilled",
            Self::BacklogReconciled { .. } => "backlog_reconciled",
            Self::Error { .. } => "error",
        }
    }

    /// Improvement this event belongs to, when it belongs to one.
    pub fn improvement_id(&self) -> Option<u32> {
        match self {
            Self::WorkerStarted { improvement_id, .. }
            | Self::StateChanged { improvement_id, .. }
            | Self::PlanCreated { improvement_id, .. }
            | Self::StepStart { improvement_id, .. }
            | Self::ToolCall { improvement_id, .. }
            | Self::StepEnd { improvement_id, .. }
            | Self::ValidationFinished { improvement_id, .. }
            | Self::ImprovementDone { improvement_id, .. }
            | Self::ImprovementFailed { improvement_id, .. }
            | Self::ImprovementEscalated { improvement_id, .. }
            | Self::MergeQueued { improvement_id, .. }
            | Self::MergeCompleted { improvement_id, .. }
            | Self::BacklogPopped { improvement_id, .. }
            | Self::BacklogReconciled { improvement_id, .. } => Some(*improvement_id),
            Self::Error { improvement_id, .. } => *improvement_id,
            Self::LoopStarted { .. }
            | Self::LoopStopped { .. }
            | Self::WorkspaceCreated { .. }
            | Self::WorkspaceRemoved { .. }
            | Self::WorkspacePreserved { .. }
            | Self::BacklogRefilled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_carries_kind_and_timestamp() {
        let event = LogEvent::now(EventKind::MergeCompleted {
            job_id: Id::from_string("job-1"),
            improvement_id: 7,
            branch: "improve/007".to_string(),
            success: true,
            reason: None,
            commit: Some("abc123".to_string()),
        });
        let line = event.to_line().unwrap();
        assert!(!line.contains('\n'));

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "merge_completed");
        assert_eq!(value["improvement_id"], 7);
        assert_eq!(value["success"], true);
        assert!(value["ts"].is_string());
        assert!(value.get("reason").is_none());
    }

    #[test]
    fn kind_string_matches_serde_tag() {
        let events = [
            EventKind::BacklogRefilled { added: 2 },
            EventKind::WorkspaceRemoved {
                branch: "improve/001".to_string(),
            },
            EventKind::Error {
                improvement_id: None,
                message: "boom".to_string(),
            },
            EventKind::StateChanged {
                improvement_id: 1,
                from: PipelineState::Created,
                to: PipelineState::Planning,
            },
        ];
        for event in events {
            let value = serde_json::to_value(LogEvent::now(event.clone())).unwrap();
            assert_eq!(value["kind"], event.as_str());
        }
    }

    #[test]
    fn parses_line_written_by_hand() {
        let line = r#"{"ts":"2025-01-01T00:00:00Z","kind":"worker_started","improvement_id":4,"worker_id":0,"branch":"improve/004","task":"Add caching","task_fingerprint":"0123456789ab","resumed":false}"#;
        let event = LogEvent::from_line(line).unwrap();
        assert_eq!(event.event.improvement_id(), Some(4));
        match event.event {
            EventKind::WorkerStarted { task, .. } => assert_eq!(task, "Add caching"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let line = r#"{"ts":"2025-01-01T00:00:00Z","kind":"not_a_kind"}"#;
        assert!(LogEvent::from_line(line).is_err());
    }

    #[test]
    fn failure_event_records_reason() {
        let event = LogEvent::now(EventKind::ImprovementFailed {
            improvement_id: 2,
            branch: "improve/002".to_string(),
            reason: FailureReason::MergeConflict,
            detail: None,
            workspace_path: Some("/tmp/wt".to_string()),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["reason"], "merge_conflict");
        assert_eq!(value["workspace_path"], "/tmp/wt");
    }
}
