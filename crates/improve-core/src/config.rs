//! Configuration for the improvement loop.
//!
//! Key=value format read from `.improve/config` (or `--config`).
//! CLI flags are applied on top by the binary.

use crate::matching::MatchPolicy;
use crate::types::{BackendKind, MergeMode, StepKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Default config location relative to the repository root.
pub const DEFAULT_CONFIG_PATH: &str = ".improve/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid number for {key}: {value}")]
    InvalidNumber { key: String, value: String },
}

/// Loop configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Loop shape
    pub target: u32,
    pub parallelism: usize,
    pub max_review_cycles: u32,
    pub cooldown_sec: u64,

    // Agent
    pub backend: BackendKind,
    pub agent_bin: Option<PathBuf>,
    pub model: String,
    pub review_model: Option<String>,
    pub plan_max_turns: u32,
    pub implement_max_turns: u32,
    pub review_max_turns: u32,
    pub fix_max_turns: u32,
    pub refill_max_turns: u32,
    pub agent_timeout_sec: u32,

    // Validation tiebreaker
    pub validate_cmds: Vec<String>,
    pub validate_timeout_sec: u32,

    // Branches and worktrees
    pub base_branch: String,
    pub branch_prefix: String,
    pub id_width: usize,
    pub worktree_path_template: String,

    // Files
    pub log_dir: PathBuf,
    pub backlog_file: PathBuf,
    pub triage_file: PathBuf,

    // Merging
    pub merge_mode: MergeMode,
    pub remote: String,
    pub gh_bin: PathBuf,

    // Reconciliation
    pub fuzzy_threshold: f64,
    pub fuzzy_min_token_len: usize,
    /// Run a reconciliation pass after the loop stops.
    pub reconcile_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: 1,
            parallelism: 1,
            max_review_cycles: 3,
            cooldown_sec: 5,
            backend: BackendKind::Claude,
            agent_bin: None,
            model: "opus".to_string(),
            review_model: None,
            plan_max_turns: 30,
            implement_max_turns: 80,
            review_max_turns: 30,
            fix_max_turns: 50,
            refill_max_turns: 30,
            agent_timeout_sec: 1800,
            validate_cmds: Vec::new(),
            validate_timeout_sec: 600,
            base_branch: "main".to_string(),
            branch_prefix: "improve/".to_string(),
            id_width: 3,
            worktree_path_template: "../{{ repo }}.{{ branch | sanitize }}".to_string(),
            log_dir: PathBuf::from("logs/improve"),
            backlog_file: PathBuf::from("BACKLOG.md"),
            triage_file: PathBuf::from("TRIAGE.md"),
            merge_mode: MergeMode::Local,
            remote: "origin".to_string(),
            gh_bin: PathBuf::from("gh"),
            fuzzy_threshold: 0.6,
            fuzzy_min_token_len: 2,
            reconcile_on_exit: false,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `.improve/config` under `repo_root` when present, defaults otherwise.
    pub fn discover(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(DEFAULT_CONFIG_PATH);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "target" => self.target = Self::parse_number(key, value)?,
            "parallelism" => self.parallelism = Self::parse_number(key, value)?,
            "max_review_cycles" => self.max_review_cycles = Self::parse_number(key, value)?,
            "cooldown_sec" => self.cooldown_sec = Self::parse_number(key, value)?,
            "backend" => {
                self.backend = match value {
                    "claude" => BackendKind::Claude,
                    "codex" => BackendKind::Codex,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "backend must be 'claude' or 'codex', got '{value}'"
                        )))
                    }
                }
            }
            "agent_bin" => {
                self.agent_bin = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "model" => self.model = value.to_string(),
            "review_model" => {
                self.review_model = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "plan_max_turns" => self.plan_max_turns = Self::parse_number(key, value)?,
            "implement_max_turns" => self.implement_max_turns = Self::parse_number(key, value)?,
            "review_max_turns" => self.review_max_turns = Self::parse_number(key, value)?,
            "fix_max_turns" => self.fix_max_turns = Self::parse_number(key, value)?,
            "refill_max_turns" => self.refill_max_turns = Self::parse_number(key, value)?,
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_number(key, value)?,
            "validate_cmds" => {
                // Pipe-separated list of commands
                self.validate_cmds = value
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "validate_timeout_sec" => self.validate_timeout_sec = Self::parse_number(key, value)?,
            "base_branch" => self.base_branch = value.to_string(),
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "id_width" => self.id_width = Self::parse_number(key, value)?,
            "worktree_path_template" => self.worktree_path_template = value.to_string(),
            "log_dir" => self.log_dir = PathBuf::from(value),
            "backlog_file" => self.backlog_file = PathBuf::from(value),
            "triage_file" => self.triage_file = PathBuf::from(value),
            "merge_mode" => {
                self.merge_mode = match value {
                    "local" => MergeMode::Local,
                    "review_request" | "pr" => MergeMode::ReviewRequest,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "merge_mode must be 'local' or 'review_request', got '{value}'"
                        )))
                    }
                }
            }
            "remote" => self.remote = value.to_string(),
            "gh_bin" => self.gh_bin = PathBuf::from(value),
            "fuzzy_threshold" => {
                let threshold: f64 = Self::parse_number(key, value)?;
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(ConfigError::InvalidNumber {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.fuzzy_threshold = threshold;
            }
            "fuzzy_min_token_len" => self.fuzzy_min_token_len = Self::parse_number(key, value)?,
            "reconcile_on_exit" => self.reconcile_on_exit = Self::parse_bool(key, value)?,
            _ => {
                warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against the repository root.
    pub fn resolve_paths(&mut self, repo_root: &Path) {
        for path in [
            &mut self.log_dir,
            &mut self.backlog_file,
            &mut self.triage_file,
        ] {
            if path.is_relative() {
                *path = repo_root.join(&*path);
            }
        }
    }

    /// Agent executable for the configured backend.
    pub fn agent_bin(&self) -> PathBuf {
        self.agent_bin
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.backend.default_bin()))
    }

    /// Model for a step; review uses `review_model` when set.
    pub fn model_for(&self, step: StepKind) -> &str {
        match (step, &self.review_model) {
            (StepKind::Review, Some(model)) => model,
            _ => &self.model,
        }
    }

    /// Turn budget for a step.
    pub fn max_turns_for(&self, step: StepKind) -> u32 {
        match step {
            StepKind::Plan => self.plan_max_turns,
            StepKind::Implement => self.implement_max_turns,
            StepKind::Review => self.review_max_turns,
            StepKind::Fix => self.fix_max_turns,
            StepKind::Refill => self.refill_max_turns,
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.fuzzy_threshold,
            min_token_len: self.fuzzy_min_token_len,
        }
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.log_dir.join("events.jsonl")
    }

    /// Artifact directory for one improvement.
    pub fn improvement_dir(&self, id: u32) -> PathBuf {
        self.log_dir
            .join(format!("improvement-{id:0width$}", width = self.id_width))
    }

    pub fn branch_for(&self, id: u32) -> String {
        crate::types::branch_name(&self.branch_prefix, id, self.id_width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.target, 1);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.max_review_cycles, 3);
        assert_eq!(config.backend, BackendKind::Claude);
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.branch_prefix, "improve/");
        assert_eq!(config.merge_mode, MergeMode::Local);
        assert!(config.validate_cmds.is_empty());
        assert!((config.fuzzy_threshold - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# loop shape
target=5
parallelism=2
model="sonnet"
review_model='opus'
backend=codex
cooldown_sec=0
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.target, 5);
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.model, "sonnet");
        assert_eq!(config.review_model.as_deref(), Some("opus"));
        assert_eq!(config.backend, BackendKind::Codex);
        assert_eq!(config.cooldown_sec, 0);
    }

    #[test]
    fn parse_validate_cmds() {
        let mut config = Config::default();
        config
            .parse_content(r#"validate_cmds="cargo test | cargo clippy""#)
            .unwrap();
        assert_eq!(config.validate_cmds, vec!["cargo test", "cargo clippy"]);
    }

    #[test]
    fn parse_merge_mode() {
        let mut config = Config::default();
        config.parse_content("merge_mode=review_request").unwrap();
        assert_eq!(config.merge_mode, MergeMode::ReviewRequest);
        assert!(config.parse_content("merge_mode=rebase").is_err());
    }

    #[test]
    fn invalid_number_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("target=many").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn fuzzy_threshold_must_be_a_ratio() {
        let mut config = Config::default();
        config.parse_content("fuzzy_threshold=0.75").unwrap();
        assert!((config.match_policy().threshold - 0.75).abs() < f64::EPSILON);
        assert!(config.parse_content("fuzzy_threshold=1.5").is_err());
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "YES").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());

        let mut config = Config::default();
        config.parse_content("reconcile_on_exit=yes").unwrap();
        assert!(config.reconcile_on_exit);
    }

    #[test]
    fn line_without_equals_is_invalid() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("target"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("not_a_key=1").unwrap();
        assert_eq!(config.target, 1);
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn model_for_review_prefers_review_model() {
        let mut config = Config::default();
        assert_eq!(config.model_for(StepKind::Review), "opus");
        config.review_model = Some("sonnet".to_string());
        assert_eq!(config.model_for(StepKind::Review), "sonnet");
        assert_eq!(config.model_for(StepKind::Fix), "opus");
    }

    #[test]
    fn agent_bin_defaults_to_backend_name() {
        let mut config = Config::default();
        assert_eq!(config.agent_bin(), PathBuf::from("claude"));
        config.backend = BackendKind::Codex;
        assert_eq!(config.agent_bin(), PathBuf::from("codex"));
        config.agent_bin = Some(PathBuf::from("/opt/agent"));
        assert_eq!(config.agent_bin(), PathBuf::from("/opt/agent"));
    }

    #[test]
    fn resolve_paths_joins_relative_paths() {
        let mut config = Config::default();
        config.triage_file = PathBuf::from("/abs/TRIAGE.md");
        config.resolve_paths(Path::new("/repo"));
        assert_eq!(config.log_dir, PathBuf::from("/repo/logs/improve"));
        assert_eq!(config.backlog_file, PathBuf::from("/repo/BACKLOG.md"));
        assert_eq!(config.triage_file, PathBuf::from("/abs/TRIAGE.md"));
        assert_eq!(
            config.event_log_path(),
            PathBuf::from("/repo/logs/improve/events.jsonl")
        );
    }

    #[test]
    fn improvement_paths_use_id_width() {
        let config = Config::default();
        assert_eq!(config.branch_for(7), "improve/007");
        assert_eq!(
            config.improvement_dir(7),
            PathBuf::from("logs/improve/improvement-007")
        );
    }
}
