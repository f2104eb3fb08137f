//! Event-log scanning and removal planning for backlog reconciliation.
//!
//! Pure functions only: the daemon crate feeds in parsed events, version
//! control lookups, and backlog entries, then applies the planned removals.

use crate::backlog::BacklogEntry;
use crate::events::{EventKind, LogEvent};
use crate::matching::{self, MatchPolicy};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Prefix of the fingerprint tag in merge commit subjects.
const TASK_TAG: &str = "[task:";
/// Prefix of the task line in merge commit bodies.
const TASK_LINE: &str = "Task: ";

/// What is known about the task behind a confirmed merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedTask {
    pub improvement_id: u32,
    pub text: Option<String>,
    pub fingerprint: Option<String>,
}

impl MergedTask {
    pub fn is_resolved(&self) -> bool {
        self.text.is_some() || self.fingerprint.is_some()
    }
}

/// Result of scanning the event log.
#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Confirmed merges keyed by improvement id.
    pub merged: BTreeMap<u32, MergedTask>,
    /// `(improvement id, file label)` pairs already removed from a list.
    pub settled: HashSet<(u32, String)>,
}

/// A line chosen for removal.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub improvement_id: u32,
    pub line: usize,
    pub text: String,
    pub exact: bool,
    pub score: f64,
}

/// Build the merged-task map from the log.
///
/// A task description is taken from the most recent `worker_started` for an
/// id before its successful `merge_completed`; ids are reused when an
/// improvement fails without merging, so earlier descriptions may be stale.
pub fn scan_events(events: &[LogEvent]) -> LogScan {
    let mut current: HashMap<u32, MergedTask> = HashMap::new();
    let mut scan = LogScan::default();

    for event in events {
        match &event.event {
            EventKind::WorkerStarted {
                improvement_id,
                task,
                task_fingerprint,
                ..
            } => {
                current.insert(
                    *improvement_id,
                    MergedTask {
                        improvement_id: *improvement_id,
                        text: Some(task.clone()),
                        fingerprint: Some(task_fingerprint.clone()),
                    },
                );
            }
            EventKind::MergeCompleted {
                improvement_id,
                success: true,
                ..
            } => {
                let task = current.get(improvement_id).cloned().unwrap_or(MergedTask {
                    improvement_id: *improvement_id,
                    ..MergedTask::default()
                });
                scan.merged.insert(*improvement_id, task);
            }
            EventKind::BacklogPopped {
                improvement_id,
                file,
                ..
            }
            | EventKind::BacklogReconciled {
                improvement_id,
                file,
                ..
            } => {
                scan.settled.insert((*improvement_id, file.clone()));
            }
            _ => {}
        }
    }

    scan
}

/// Subject line for the merge commit of an improvement branch.
pub fn merge_commit_subject(branch: &str, fingerprint: &str) -> String {
    format!("Merge {branch} {TASK_TAG}{fingerprint}]")
}

/// Body for the merge commit; carries the full task text.
pub fn merge_commit_body(task: &str) -> String {
    let single_line = task.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{TASK_LINE}{single_line}")
}

/// Extract `(task text, fingerprint)` from a merge commit message.
pub fn parse_merge_commit(subject: &str, body: &str) -> (Option<String>, Option<String>) {
    let fingerprint = subject.find(TASK_TAG).and_then(|start| {
        let rest = &subject[start + TASK_TAG.len()..];
        rest.find(']').map(|end| rest[..end].trim().to_string())
    });
    let text = body
        .lines()
        .find_map(|l| l.trim().strip_prefix(TASK_LINE))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());
    (text, fingerprint.filter(|f| !f.is_empty()))
}

/// Choose which entries of one list to remove.
///
/// Per merged improvement (ascending id): exact text match first, then a
/// fingerprint match, then the single best fuzzy match. Each entry is claimed
/// at most once and each improvement removes at most one line per list.
pub fn plan_removals(
    merged: &BTreeMap<u32, MergedTask>,
    file_label: &str,
    entries: &[BacklogEntry],
    settled: &HashSet<(u32, String)>,
    policy: &MatchPolicy,
) -> Vec<Removal> {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut removals = Vec::new();

    for task in merged.values() {
        if settled.contains(&(task.improvement_id, file_label.to_string())) {
            continue;
        }

        let open = || {
            entries
                .iter()
                .enumerate()
                .filter(|(i, _)| !claimed.contains(i))
                .map(|(i, e)| (i, e.text.as_str()))
        };

        let found = if let Some(text) = &task.text {
            matching::exact_match(text, open())
                .map(|i| (i, true, 1.0))
                .or_else(|| {
                    matching::best_match(text, open(), policy).map(|m| (m.index, false, m.score))
                })
        } else if let Some(fp) = &task.fingerprint {
            open()
                .find(|(_, text)| matching::fingerprint(text) == *fp)
                .map(|(i, _)| (i, true, 1.0))
        } else {
            None
        };

        if let Some((index, exact, score)) = found {
            claimed.insert(index);
            let entry = &entries[index];
            removals.push(Removal {
                improvement_id: task.improvement_id,
                line: entry.line,
                text: entry.text.clone(),
                exact,
                score,
            });
        }
    }

    removals.sort_by_key(|r| r.line);
    removals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;

    fn entries(texts: &[&str]) -> Vec<BacklogEntry> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| BacklogEntry {
                text: (*t).to_string(),
                position: i,
                line: i,
                raw: format!("- {t}"),
            })
            .collect()
    }

    fn started(id: u32, task: &str) -> LogEvent {
        LogEvent::now(EventKind::WorkerStarted {
            improvement_id: id,
            worker_id: 0,
            branch: format!("improve/{id:03}"),
            task: task.to_string(),
            task_fingerprint: matching::fingerprint(task),
            resumed: false,
        })
    }

    fn merged(id: u32, success: bool) -> LogEvent {
        LogEvent::now(EventKind::MergeCompleted {
            job_id: Id::new(),
            improvement_id: id,
            branch: format!("improve/{id:03}"),
            success,
            reason: None,
            commit: None,
        })
    }

    fn merged_map(tasks: &[(u32, &str)]) -> BTreeMap<u32, MergedTask> {
        tasks
            .iter()
            .map(|(id, text)| {
                (
                    *id,
                    MergedTask {
                        improvement_id: *id,
                        text: Some((*text).to_string()),
                        fingerprint: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn scan_keeps_only_successful_merges() {
        let events = vec![
            started(1, "Task A"),
            merged(1, true),
            started(2, "Task B"),
            merged(2, false),
        ];
        let scan = scan_events(&events);
        assert_eq!(scan.merged.len(), 1);
        assert_eq!(scan.merged[&1].text.as_deref(), Some("Task A"));
    }

    #[test]
    fn scan_uses_latest_task_for_reused_id() {
        let events = vec![
            started(3, "Old task"),
            merged(3, false),
            started(3, "New task"),
            merged(3, true),
        ];
        let scan = scan_events(&events);
        assert_eq!(scan.merged[&3].text.as_deref(), Some("New task"));
    }

    #[test]
    fn scan_marks_unresolved_merge() {
        let scan = scan_events(&[merged(9, true)]);
        assert!(!scan.merged[&9].is_resolved());
    }

    #[test]
    fn scan_collects_settled_pairs() {
        let events = vec![LogEvent::now(EventKind::BacklogPopped {
            improvement_id: 4,
            file: "BACKLOG.md".to_string(),
            task: "Task".to_string(),
        })];
        let scan = scan_events(&events);
        assert!(scan.settled.contains(&(4, "BACKLOG.md".to_string())));
    }

    #[test]
    fn merge_commit_message_round_trips() {
        let subject = merge_commit_subject("improve/007", "0123456789ab");
        let body = merge_commit_body("Add retry\nlogic");
        assert_eq!(subject, "Merge improve/007 [task:0123456789ab]");
        let (text, fp) = parse_merge_commit(&subject, &body);
        assert_eq!(text.as_deref(), Some("Add retry logic"));
        assert_eq!(fp.as_deref(), Some("0123456789ab"));
    }

    #[test]
    fn parse_merge_commit_without_markers() {
        let (text, fp) = parse_merge_commit("Merge branch 'improve/007'", "");
        assert!(text.is_none());
        assert!(fp.is_none());
    }

    #[test]
    fn exact_match_removes_only_that_line() {
        let list = entries(&["Task A", "Task B"]);
        let removals = plan_removals(
            &merged_map(&[(1, "Task A")]),
            "BACKLOG.md",
            &list,
            &HashSet::new(),
            &MatchPolicy::default(),
        );
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].line, 0);
        assert!(removals[0].exact);
    }

    #[test]
    fn fuzzy_match_removes_single_best_line() {
        let list = entries(&[
            "Add retry to parser",
            "**Add retry logic** to `src/net.rs` (see #12)",
            "Document the CLI flags",
        ]);
        let removals = plan_removals(
            &merged_map(&[(1, "Add retry logic to src/net.rs")]),
            "BACKLOG.md",
            &list,
            &HashSet::new(),
            &MatchPolicy::default(),
        );
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].line, 1);
        assert!(!removals[0].exact);
    }

    #[test]
    fn settled_improvements_are_skipped() {
        let list = entries(&["Task A"]);
        let mut settled = HashSet::new();
        settled.insert((1, "BACKLOG.md".to_string()));
        let removals = plan_removals(
            &merged_map(&[(1, "Task A")]),
            "BACKLOG.md",
            &list,
            &settled,
            &MatchPolicy::default(),
        );
        assert!(removals.is_empty());

        // A different list is not settled.
        let removals = plan_removals(
            &merged_map(&[(1, "Task A")]),
            "TRIAGE.md",
            &list,
            &settled,
            &MatchPolicy::default(),
        );
        assert_eq!(removals.len(), 1);
    }

    #[test]
    fn entries_are_claimed_once() {
        let list = entries(&["Cache config lookups", "Unrelated"]);
        let removals = plan_removals(
            &merged_map(&[(1, "Cache config lookups"), (2, "cache config lookups!")]),
            "BACKLOG.md",
            &list,
            &HashSet::new(),
            &MatchPolicy::default(),
        );
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].improvement_id, 1);
    }

    #[test]
    fn fingerprint_only_match() {
        let list = entries(&["Task A", "**Task B**"]);
        let mut map = BTreeMap::new();
        map.insert(
            5,
            MergedTask {
                improvement_id: 5,
                text: None,
                fingerprint: Some(matching::fingerprint("task b")),
            },
        );
        let removals = plan_removals(
            &map,
            "BACKLOG.md",
            &list,
            &HashSet::new(),
            &MatchPolicy::default(),
        );
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].line, 1);
    }
}
