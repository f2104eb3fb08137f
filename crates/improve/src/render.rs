//! Terminal output for the offline subcommands.
//!
//! Builds per-improvement rows from the event log and formats them, plus the
//! worktree listing and the reconciliation report.

use crate::git::WorktreeInfo;
use crate::orchestrator::LoopSummary;
use crate::reconcile::ReconcileReport;
use improve_core::{EventKind, LogEvent};
use std::collections::BTreeMap;

/// Last known outcome of one improvement id.
#[derive(Debug, Clone, PartialEq)]
pub struct ImprovementRow {
    pub id: u32,
    pub branch: String,
    pub task: String,
    pub outcome: String,
    pub review_cycles: u32,
    pub cost_usd: f64,
}

/// Fold the log into one row per improvement id.
///
/// A fresh `worker_started` replaces the row, so a retried id shows its
/// latest attempt.
pub fn summarize(events: &[LogEvent]) -> Vec<ImprovementRow> {
    let mut rows: BTreeMap<u32, ImprovementRow> = BTreeMap::new();

    for event in events {
        match &event.event {
            EventKind::WorkerStarted {
                improvement_id,
                branch,
                task,
                ..
            } => {
                rows.insert(
                    *improvement_id,
                    ImprovementRow {
                        id: *improvement_id,
                        branch: branch.clone(),
                        task: task.clone(),
                        outcome: "running".to_string(),
                        review_cycles: 0,
                        cost_usd: 0.0,
                    },
                );
            }
            EventKind::StepEnd {
                improvement_id,
                cost_usd,
                ..
            } => {
                if let Some(row) = rows.get_mut(improvement_id) {
                    row.cost_usd += cost_usd;
                }
            }
            EventKind::ImprovementDone {
                improvement_id,
                review_cycles,
                ..
            } => {
                if let Some(row) = rows.get_mut(improvement_id) {
                    row.outcome = "merged".to_string();
                    row.review_cycles = *review_cycles;
                }
            }
            EventKind::ImprovementFailed {
                improvement_id,
                reason,
                ..
            } => {
                if let Some(row) = rows.get_mut(improvement_id) {
                    row.outcome = format!("failed: {}", reason.as_str());
                }
            }
            EventKind::ImprovementEscalated {
                improvement_id,
                reason,
                review_cycles,
                ..
            } => {
                if let Some(row) = rows.get_mut(improvement_id) {
                    row.outcome = format!("escalated: {}", reason.as_str());
                    row.review_cycles = *review_cycles;
                }
            }
            _ => {}
        }
    }

    rows.into_values().collect()
}

pub fn print_summary(rows: &[ImprovementRow]) {
    if rows.is_empty() {
        println!("No improvements recorded.");
        return;
    }

    println!(
        "{:<5}  {:<16}  {:<32}  {:<28}  {:<6}  {:>8}",
        "ID", "BRANCH", "TASK", "OUTCOME", "CYCLES", "COST"
    );
    println!("{}", "-".repeat(104));

    for row in rows {
        println!(
            "{:<5}  {:<16}  {:<32}  {:<28}  {:<6}  {:>8}",
            row.id,
            truncate(&row.branch, 16),
            truncate(&row.task, 32),
            truncate(&row.outcome, 28),
            row.review_cycles,
            format!("${:.2}", row.cost_usd),
        );
    }

    let merged = rows.iter().filter(|r| r.outcome == "merged").count();
    let cost: f64 = rows.iter().map(|r| r.cost_usd).sum();
    println!();
    println!(
        "{} improvement(s), {} merged, ${:.2} total",
        rows.len(),
        merged,
        cost
    );
}

/// Print improvement worktrees with their commits-ahead count.
pub fn print_workspaces(worktrees: &[(WorktreeInfo, Option<u32>)]) {
    if worktrees.is_empty() {
        println!("No improvement workspaces.");
        return;
    }

    println!("{:<20}  {:<6}  {:<10}  PATH", "BRANCH", "AHEAD", "COMMIT");
    println!("{}", "-".repeat(80));

    for (info, ahead) in worktrees {
        let ahead = ahead.map_or_else(|| "-".to_string(), |n| n.to_string());
        let commit: String = info.commit.chars().take(10).collect();
        println!(
            "{:<20}  {:<6}  {:<10}  {}",
            truncate(info.branch.as_deref().unwrap_or("-"), 20),
            ahead,
            commit,
            info.path.display(),
        );
    }
}

pub fn print_reconcile_report(report: &ReconcileReport) {
    let verb = if report.dry_run { "would remove" } else { "removed" };
    for file in &report.files {
        for removal in &file.removals {
            let how = if removal.exact {
                "exact".to_string()
            } else {
                format!("fuzzy {:.2}", removal.score)
            };
            println!(
                "{}: {verb} line {} (#{}, {how}): {}",
                file.file,
                removal.line + 1,
                removal.improvement_id,
                removal.text
            );
        }
    }
    if !report.unresolved.is_empty() {
        let ids: Vec<String> = report.unresolved.iter().map(u32::to_string).collect();
        println!("No task found for merged improvement(s): {}", ids.join(", "));
    }
    println!(
        "{} merged improvement(s), {verb} {} line(s)",
        report.merged,
        report.total_removed()
    );
}

pub fn print_loop_summary(summary: &LoopSummary) {
    println!(
        "Merged {}/{} improvement(s) ({} attempted, {} failed)",
        summary.completed, summary.target, summary.attempted, summary.failed
    );
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}
