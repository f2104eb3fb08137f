//! Task text matching for backlog reconciliation.
//!
//! Agents paraphrase task text, so matching works on a normalized form:
//! case-folded, markdown emphasis and code markers removed, whitespace
//! collapsed. Fuzzy scoring is the Dice coefficient over the token sets.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Length of the hex task fingerprint embedded in merge commits.
pub const FINGERPRINT_LEN: usize = 12;

/// Explicit, configurable fuzzy-match policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Minimum token-set overlap (0.0..=1.0) for a fuzzy match.
    pub threshold: f64,
    /// Tokens shorter than this are ignored.
    pub min_token_len: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            min_token_len: 2,
        }
    }
}

/// A candidate line selected by `best_match`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyMatch {
    pub index: usize,
    pub score: f64,
}

/// Normalize task text for comparison.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '*' | '_' | '`'))
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Extract the token set used for overlap scoring.
pub fn tokens(text: &str, min_len: usize) -> BTreeSet<String> {
    normalize(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= min_len)
        .map(ToString::to_string)
        .collect()
}

/// Dice coefficient of two token sets. Empty sets never match.
pub fn overlap_score(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    (2 * shared) as f64 / (a.len() + b.len()) as f64
}

/// Stable short identifier for a task, independent of formatting.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..FINGERPRINT_LEN].to_string()
}

/// Index of the first candidate whose trimmed text equals `task` exactly.
pub fn exact_match<'a, I>(task: &str, candidates: I) -> Option<usize>
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let task = task.trim();
    candidates
        .into_iter()
        .find(|(_, text)| text.trim() == task)
        .map(|(index, _)| index)
}

/// Single highest-scoring candidate at or above the policy threshold.
///
/// Ties resolve to the earliest candidate so repeated runs pick the same line.
pub fn best_match<'a, I>(task: &str, candidates: I, policy: &MatchPolicy) -> Option<FuzzyMatch>
where
    I: IntoIterator<Item = (usize, &'a str)>,
{
    let wanted = tokens(task, policy.min_token_len);
    let mut best: Option<FuzzyMatch> = None;

    for (index, text) in candidates {
        let score = overlap_score(&wanted, &tokens(text, policy.min_token_len));
        if score < policy.threshold {
            continue;
        }
        match best {
            Some(current) if current.score >= score => {}
            _ => best = Some(FuzzyMatch { index, score }),
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_markers_and_whitespace() {
        assert_eq!(
            normalize("  **Add**   `retry`\tlogic _now_ "),
            "add retry logic now"
        );
    }

    #[test]
    fn tokens_split_paths_and_drop_short() {
        let t = tokens("Fix a bug in src/net.rs", 2);
        let expected: BTreeSet<String> = ["fix", "bug", "in", "src", "net", "rs"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(t, expected);
    }

    #[test]
    fn overlap_of_identical_sets_is_one() {
        let a = tokens("add retry logic", 2);
        assert!((overlap_score(&a, &a) - 1.0).abs() < f64::EPSILON);
        assert!(overlap_score(&a, &BTreeSet::new()).abs() < f64::EPSILON);
    }

    #[test]
    fn fingerprint_ignores_formatting() {
        assert_eq!(
            fingerprint("Add retry logic"),
            fingerprint("**add**  retry `logic`")
        );
        assert_ne!(fingerprint("Add retry logic"), fingerprint("Remove retry logic"));
        assert_eq!(fingerprint("x").len(), FINGERPRINT_LEN);
    }

    #[test]
    fn exact_match_picks_first_equal_line() {
        let lines = ["Task A", "Task B", "Task A"];
        let found = exact_match("Task A", lines.iter().copied().enumerate());
        assert_eq!(found, Some(0));
        assert_eq!(exact_match("Task C", lines.iter().copied().enumerate()), None);
    }

    #[test]
    fn best_match_accepts_formatting_paraphrase() {
        let lines = [
            "Add retry to parser",
            "**Add retry logic** to `src/net.rs` (see #12)",
            "Improve logging in src/log.rs",
        ];
        let found = best_match(
            "Add retry logic to src/net.rs",
            lines.iter().copied().enumerate(),
            &MatchPolicy::default(),
        )
        .unwrap();
        assert_eq!(found.index, 1);
        assert!(found.score > 0.8);
    }

    #[test]
    fn best_match_rejects_shared_vocabulary() {
        let lines = ["Add retry to parser", "Improve logging in src/log.rs"];
        let found = best_match(
            "Add retry logic to src/net.rs",
            lines.iter().copied().enumerate(),
            &MatchPolicy::default(),
        );
        assert!(found.is_none());
    }

    #[test]
    fn best_match_ties_resolve_to_earliest() {
        let lines = ["cache the config", "Cache the config!"];
        let found = best_match(
            "cache the config",
            lines.iter().copied().enumerate(),
            &MatchPolicy::default(),
        )
        .unwrap();
        assert_eq!(found.index, 0);
    }

    #[test]
    fn threshold_is_configurable() {
        let lines = ["Add retry to parser"];
        let strict = MatchPolicy {
            threshold: 0.5,
            ..MatchPolicy::default()
        };
        let found = best_match(
            "Add retry logic to src/net.rs",
            lines.iter().copied().enumerate(),
            &strict,
        );
        assert_eq!(found.map(|m| m.index), Some(0));
    }
}
