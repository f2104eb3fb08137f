//! Prompt assembly for pipeline steps.
//!
//! Prompts are deliberately short: the agent gets the task, where to put its
//! artifacts, and which marker line to print at the end.

use crate::markers::{DONE_MARKER, FIXED_MARKER, PLAN_MARKER, REVIEW_FAILED, REVIEW_PASSED};
use std::path::Path;

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

pub fn plan_prompt(task: &str, plan_path: &Path) -> String {
    format!(
        "You are planning one small, self-contained improvement to this repository.\n\n\
         Task:\n{task}\n\n\
         Read the relevant code, then write a concise implementation plan to `{plan}`.\n\
         Do not modify any other file.\n\
         Finish with a single line `{PLAN_MARKER} <one-sentence summary>`.\n",
        plan = plan_path.display(),
    )
}

pub fn implement_prompt(task: &str, plan_path: &Path) -> String {
    format!(
        "Implement the following improvement in this working tree.\n\n\
         Task:\n{task}\n\n\
         The plan is in `{plan}`. Follow it, keep the change focused, and make sure \
         the project still builds and its tests pass. Do not commit; the runner commits for you.\n\
         Finish with a single line `{DONE_MARKER} <one-sentence summary of the change>`.\n",
        plan = plan_path.display(),
    )
}

pub fn review_prompt(task: &str, base_branch: &str, branch: &str, cycle: u32) -> String {
    format!(
        "Review the changes on branch `{branch}` against `{base_branch}` \
         (run `git diff {base_branch}...HEAD`). This is review cycle {cycle}.\n\n\
         The change was meant to accomplish:\n{task}\n\n\
         Check correctness, tests, and scope. Do not edit files.\n\
         End with exactly one verdict line: `{REVIEW_PASSED}` if the change is ready to merge, \
         or `{REVIEW_FAILED}: <summary>` followed by a list of concrete findings.\n",
    )
}

pub fn fix_prompt(task: &str, findings: &str) -> String {
    format!(
        "A review of the current change found problems that must be fixed.\n\n\
         Original task:\n{task}\n\n\
         Findings:\n{findings}\n\n\
         Address every finding without widening the scope. Do not commit.\n\
         Finish with a single line `{FIXED_MARKER} <what you changed>`.\n",
    )
}

/// Seed for the fix agent when the validation tiebreaker failed.
pub fn validation_findings(context: &str) -> String {
    format!("Validation commands failed after an inconclusive review.\n\n{context}")
}

pub fn refill_prompt(backlog_path: &Path) -> String {
    format!(
        "The improvement backlog at `{path}` is empty.\n\n\
         Study this repository and append 3 to 5 small, independent, concrete improvement \
         tasks to that file, one per line, each starting with `- `. \
         Each task must be completable in a single focused change. \
         Do not modify any other file.\n",
        path = backlog_path.display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(sanitize_branch_name("improve/007"), "improve-007");
        assert_eq!(sanitize_branch_name("plain"), "plain");
    }

    #[test]
    fn prompts_name_their_markers() {
        let plan = Path::new("/logs/improvement-001/plan.md");
        assert!(plan_prompt("Add caching", plan).contains("PLAN:"));
        assert!(plan_prompt("Add caching", plan).contains("/logs/improvement-001/plan.md"));
        assert!(implement_prompt("Add caching", plan).contains("DONE:"));
        assert!(fix_prompt("Add caching", "- missing test").contains("FIXED:"));

        let review = review_prompt("Add caching", "main", "improve/001", 2);
        assert!(review.contains("REVIEW_PASSED"));
        assert!(review.contains("REVIEW_FAILED"));
        assert!(review.contains("git diff main...HEAD"));
        assert!(review.contains("cycle 2"));
    }

    #[test]
    fn refill_prompt_mentions_backlog_path() {
        let prompt = refill_prompt(Path::new("/repo/BACKLOG.md"));
        assert!(prompt.contains("/repo/BACKLOG.md"));
        assert!(prompt.contains("`- `"));
    }
}
