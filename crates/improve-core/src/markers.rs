//! Marker detection in agent output.
//!
//! The loop only inspects a handful of line-leading markers in free text:
//! - `PLAN:` summary line after planning
//! - `DONE:` summary line after implementation
//! - `FIXED:` summary line after a fix
//! - `REVIEW_PASSED` / `REVIEW_FAILED` verdict from the reviewer
//!
//! Markers count only at the start of a line (after trimming and dropping
//! markdown emphasis), so prose that merely mentions a marker is ignored.

use serde::{Deserialize, Serialize};

pub const PLAN_MARKER: &str = "PLAN:";
pub const DONE_MARKER: &str = "DONE:";
pub const FIXED_MARKER: &str = "FIXED:";
pub const REVIEW_PASSED: &str = "REVIEW_PASSED";
pub const REVIEW_FAILED: &str = "REVIEW_FAILED";

/// Number of trailing output lines used as findings when the reviewer
/// gives none after its `REVIEW_FAILED` marker.
const FALLBACK_FINDINGS_LINES: usize = 60;

/// Reviewer verdict classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ReviewVerdict {
    Passed,
    Failed { findings: String },
    /// No verdict, or contradictory verdicts.
    Ambiguous,
}

impl ReviewVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed { .. } => "failed",
            Self::Ambiguous => "ambiguous",
        }
    }
}

/// Strip surrounding whitespace and leading markdown decoration from a line.
fn marker_line(line: &str) -> &str {
    line.trim().trim_start_matches(['*', '`', '#', '>', ' '])
}

/// Text following the last occurrence of `marker` at the start of a line.
///
/// # Example
/// ```
/// use improve_core::markers::{marker_value, DONE_MARKER};
///
/// let output = "Edited files.\nDONE: added retry loop to fetcher\n";
/// assert_eq!(
///     marker_value(output, DONE_MARKER).as_deref(),
///     Some("added retry loop to fetcher")
/// );
/// assert_eq!(marker_value("nothing here", DONE_MARKER), None);
/// ```
pub fn marker_value(output: &str, marker: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(marker_line)
        .find_map(|line| line.strip_prefix(marker))
        .map(|rest| {
            rest.trim_matches(|c: char| c.is_whitespace() || c == '*' || c == '`')
                .to_string()
        })
}

/// Classify reviewer output into a verdict.
pub fn classify_review(output: &str) -> ReviewVerdict {
    let lines: Vec<&str> = output.lines().collect();
    let mut passed = false;
    let mut failed_at: Option<usize> = None;

    for (idx, line) in lines.iter().enumerate() {
        let line = marker_line(line);
        if line.starts_with(REVIEW_PASSED) {
            passed = true;
        } else if line.starts_with(REVIEW_FAILED) {
            failed_at = Some(idx);
        }
    }

    match (passed, failed_at) {
        (true, None) => ReviewVerdict::Passed,
        (false, Some(idx)) => ReviewVerdict::Failed {
            findings: collect_findings(&lines, idx),
        },
        _ => ReviewVerdict::Ambiguous,
    }
}

/// Findings are the marker line remainder plus everything after it.
fn collect_findings(lines: &[&str], idx: usize) -> String {
    let head = marker_line(lines[idx])
        .trim_start_matches(REVIEW_FAILED)
        .trim_start_matches([':', '*', '`'])
        .trim();

    let mut findings: Vec<&str> = Vec::new();
    if !head.is_empty() {
        findings.push(head);
    }
    findings.extend(lines[idx + 1..].iter().copied());

    let text = findings.join("\n").trim().to_string();
    if !text.is_empty() {
        return text;
    }

    let start = idx.saturating_sub(FALLBACK_FINDINGS_LINES);
    lines[start..idx].join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_value_uses_last_occurrence() {
        let output = "PLAN: first idea\nthinking...\nPLAN: refined idea\n";
        assert_eq!(marker_value(output, PLAN_MARKER).as_deref(), Some("refined idea"));
    }

    #[test]
    fn marker_value_ignores_mid_line_mentions() {
        let output = "I will print DONE: when finished";
        assert_eq!(marker_value(output, DONE_MARKER), None);
    }

    #[test]
    fn marker_value_accepts_markdown_decoration() {
        let output = "**FIXED:** handled empty input**";
        assert_eq!(marker_value(output, FIXED_MARKER).as_deref(), Some("handled empty input"));
    }

    #[test]
    fn marker_value_allows_empty_remainder() {
        assert_eq!(marker_value("DONE:", DONE_MARKER).as_deref(), Some(""));
    }

    #[test]
    fn review_passed() {
        let output = "Looked at the diff.\nREVIEW_PASSED\n";
        assert_eq!(classify_review(output), ReviewVerdict::Passed);
    }

    #[test]
    fn review_failed_collects_findings() {
        let output = "Checked.\nREVIEW_FAILED: missing tests\n- no test for empty input\n- typo in docs\n";
        match classify_review(output) {
            ReviewVerdict::Failed { findings } => {
                assert!(findings.starts_with("missing tests"));
                assert!(findings.contains("no test for empty input"));
                assert!(findings.contains("typo in docs"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn review_failed_without_detail_falls_back_to_preceding_text() {
        let output = "The handler leaks a file descriptor.\nREVIEW_FAILED";
        match classify_review(output) {
            ReviewVerdict::Failed { findings } => {
                assert_eq!(findings, "The handler leaks a file descriptor.");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn review_without_marker_is_ambiguous() {
        assert_eq!(classify_review("Looks fine to me."), ReviewVerdict::Ambiguous);
        assert_eq!(classify_review(""), ReviewVerdict::Ambiguous);
    }

    #[test]
    fn contradictory_verdicts_are_ambiguous() {
        let output = "REVIEW_FAILED: flaky\nREVIEW_PASSED";
        assert_eq!(classify_review(output), ReviewVerdict::Ambiguous);
    }

    #[test]
    fn mentioned_marker_is_not_a_verdict() {
        let output = "Reply with REVIEW_PASSED or REVIEW_FAILED.";
        assert_eq!(classify_review(output), ReviewVerdict::Ambiguous);
    }
}
