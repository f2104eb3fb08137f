//! Backlog reconciliation against confirmed merges.
//!
//! Reads the event log, fills in task descriptions for merges the log does
//! not describe from merge commit history, and removes matching lines from
//! the backlog and triage files.

use crate::event_log::{EventLog, EventLogError};
use crate::git::{self, GitError};
use improve_core::backlog::BacklogError;
use improve_core::reconcile::{self, LogScan, Removal};
use improve_core::{BacklogStore, Config, EventKind, MergeMode};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("event log error: {0}")]
    EventLog(#[from] EventLogError),
    #[error("backlog error: {0}")]
    Backlog(#[from] BacklogError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Lines removed (or, on a dry run, selected) from one list.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub file: String,
    pub path: PathBuf,
    pub removals: Vec<Removal>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub dry_run: bool,
    /// Confirmed merges found in the log.
    pub merged: usize,
    /// Merged ids whose task could not be determined.
    pub unresolved: Vec<u32>,
    pub files: Vec<FileReport>,
}

impl ReconcileReport {
    pub fn total_removed(&self) -> usize {
        self.files.iter().map(|f| f.removals.len()).sum()
    }
}

/// Ref whose history records completed merges.
pub fn history_ref(config: &Config) -> String {
    match config.merge_mode {
        MergeMode::Local => config.base_branch.clone(),
        MergeMode::ReviewRequest => format!("{}/{}", config.remote, config.base_branch),
    }
}

#[derive(Debug)]
pub struct ReconciliationEngine<'a> {
    config: &'a Config,
    repo: PathBuf,
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(config: &'a Config, repo: impl Into<PathBuf>) -> Self {
        Self {
            config,
            repo: repo.into(),
        }
    }

    /// Run one pass. With `dry_run` nothing is rewritten and no events are
    /// written; the report lists what would be removed.
    pub async fn run(&self, dry_run: bool) -> Result<ReconcileReport> {
        let log_path = self.config.event_log_path();
        let events = EventLog::read_all(&log_path)?;
        let mut scan = reconcile::scan_events(&events);
        debug!(
            events = events.len(),
            merged = scan.merged.len(),
            settled = scan.settled.len(),
            "scanned event log"
        );

        self.resolve_from_history(&mut scan).await;

        let mut report = ReconcileReport {
            dry_run,
            merged: scan.merged.len(),
            unresolved: scan
                .merged
                .values()
                .filter(|t| !t.is_resolved())
                .map(|t| t.improvement_id)
                .collect(),
            files: Vec::new(),
        };
        for id in &report.unresolved {
            warn!(improvement_id = id, "merged improvement has no recoverable task text");
        }

        // Opened lazily so a dry run never creates the log.
        let log = if dry_run {
            None
        } else {
            Some(EventLog::open(&log_path)?)
        };

        for path in [&self.config.backlog_file, &self.config.triage_file] {
            if let Some(file) = self.reconcile_file(path, &scan, log.as_ref(), dry_run)? {
                report.files.push(file);
            }
        }

        info!(
            dry_run,
            merged = report.merged,
            removed = report.total_removed(),
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Look up merge commits for merged ids the log does not describe.
    async fn resolve_from_history(&self, scan: &mut LogScan) {
        let base = history_ref(self.config);
        for task in scan.merged.values_mut().filter(|t| !t.is_resolved()) {
            let branch = self.config.branch_for(task.improvement_id);
            match git::find_merge_commit(&self.repo, &base, &branch).await {
                Ok(Some(commit)) => {
                    let (text, fingerprint) =
                        reconcile::parse_merge_commit(&commit.subject, &commit.body);
                    debug!(
                        improvement_id = task.improvement_id,
                        branch = %branch,
                        has_text = text.is_some(),
                        has_fingerprint = fingerprint.is_some(),
                        "resolved task from merge commit"
                    );
                    task.text = text;
                    task.fingerprint = fingerprint;
                }
                Ok(None) => {
                    debug!(improvement_id = task.improvement_id, branch = %branch, "no merge commit found");
                }
                Err(e) => {
                    warn!(
                        improvement_id = task.improvement_id,
                        branch = %branch,
                        error = %e,
                        "merge history lookup failed"
                    );
                }
            }
        }
    }

    fn reconcile_file(
        &self,
        path: &Path,
        scan: &LogScan,
        log: Option<&EventLog>,
        dry_run: bool,
    ) -> Result<Option<FileReport>> {
        if !path.exists() {
            return Ok(None);
        }
        let store = BacklogStore::new(path);
        let label = store.label();
        let entries = store.read_all()?;
        let removals = reconcile::plan_removals(
            &scan.merged,
            &label,
            &entries,
            &scan.settled,
            &self.config.match_policy(),
        );

        // Settlement records go in before the rewrite: if the log cannot be
        // written, the file is left untouched.
        for removal in &removals {
            info!(
                file = %label,
                improvement_id = removal.improvement_id,
                exact = removal.exact,
                score = removal.score,
                line = %removal.text,
                dry_run,
                "reconciled backlog entry"
            );
            if let Some(log) = log {
                log.append(EventKind::BacklogReconciled {
                    improvement_id: removal.improvement_id,
                    file: label.clone(),
                    line: removal.text.clone(),
                    exact: removal.exact,
                })?;
            }
        }

        if !dry_run && !removals.is_empty() {
            let lines: Vec<usize> = removals.iter().map(|r| r.line).collect();
            store.remove_lines(&lines)?;
        }

        Ok(Some(FileReport {
            file: label,
            path: path.to_path_buf(),
            removals,
        }))
    }
}
