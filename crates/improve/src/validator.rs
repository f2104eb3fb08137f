//! Validation commands used as the tiebreaker for inconclusive reviews.
//!
//! Each configured command runs through `sh -c` inside the workspace. A
//! timeout counts as a failure; cancellation aborts the whole pass.

use chrono::Utc;
use improve_core::Config;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of output kept per failing command in the failure context.
const CONTEXT_TAIL_LINES: usize = 120;

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("validation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ValidatorError>;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub cmd: String,
    /// `-1` when killed or terminated by a signal.
    pub exit_code: i32,
    pub passed: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub duration_ms: u64,
    pub commands: Vec<CommandResult>,
    /// Tail of every failing command's output; empty when passed.
    pub failure_context: String,
    pub context_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Validator {
    cmds: Vec<String>,
    timeout_sec: u32,
}

impl Validator {
    pub fn new(cmds: Vec<String>, timeout_sec: u32) -> Self {
        Self { cmds, timeout_sec }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.validate_cmds.clone(), config.validate_timeout_sec)
    }

    pub fn has_commands(&self) -> bool {
        !self.cmds.is_empty()
    }

    pub fn context_path(artifact_dir: &Path) -> PathBuf {
        artifact_dir.join("validation.txt")
    }

    /// Run every command (continuing past failures) and report the outcome.
    ///
    /// With no commands configured validation passes. On failure the context
    /// is also written to `validation.txt` in `artifact_dir`.
    pub async fn run(
        &self,
        working_dir: &Path,
        artifact_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport> {
        if !self.has_commands() {
            return Ok(ValidationReport {
                passed: true,
                duration_ms: 0,
                commands: Vec::new(),
                failure_context: String::new(),
                context_path: None,
            });
        }

        info!(
            cmd_count = self.cmds.len(),
            working_dir = %working_dir.display(),
            "starting validation"
        );

        let start = Utc::now();
        let mut commands = Vec::with_capacity(self.cmds.len());
        for cmd in &self.cmds {
            commands.push(self.run_command(cmd, working_dir, cancel).await?);
        }
        let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
        let passed = commands.iter().all(|c| c.passed);

        let (failure_context, context_path) = if passed {
            (String::new(), None)
        } else {
            let context = format_failure_context(&commands);
            std::fs::create_dir_all(artifact_dir)?;
            let path = Self::context_path(artifact_dir);
            std::fs::write(&path, &context)?;
            (context, Some(path))
        };

        info!(passed, duration_ms, "validation complete");

        Ok(ValidationReport {
            passed,
            duration_ms,
            commands,
            failure_context,
            context_path,
        })
    }

    async fn run_command(
        &self,
        cmd: &str,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        debug!(cmd = %cmd, "executing validation command");
        let start = Utc::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_task = child.stdout.take().map(|mut handle| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = handle.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut handle| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = handle.read_to_end(&mut buf).await;
                buf
            })
        });

        let limit = if self.timeout_sec > 0 {
            Duration::from_secs(u64::from(self.timeout_sec))
        } else {
            Duration::MAX
        };

        let mut timed_out = false;
        let exit_code = tokio::select! {
            result = child.wait() => result?.code().unwrap_or(-1),
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(cmd = %cmd, error = %e, "failed to kill cancelled validation command");
                }
                return Err(ValidatorError::Cancelled);
            }
            () = tokio::time::sleep(limit) => {
                if let Err(e) = child.kill().await {
                    warn!(cmd = %cmd, error = %e, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                warn!(cmd = %cmd, timeout_sec = self.timeout_sec, "validation command timed out");
                timed_out = true;
                -1
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        let duration_ms = (Utc::now() - start).num_milliseconds() as u64;
        let passed = exit_code == 0 && !timed_out;
        if passed {
            debug!(cmd = %cmd, duration_ms, "validation command passed");
        } else {
            warn!(cmd = %cmd, exit_code, duration_ms, "validation command failed");
        }

        Ok(CommandResult {
            cmd: cmd.to_string(),
            exit_code,
            passed,
            timed_out,
            duration_ms,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }
}

fn format_failure_context(results: &[CommandResult]) -> String {
    let mut context = String::new();

    for result in results.iter().filter(|r| !r.passed) {
        if result.timed_out {
            context.push_str(&format!("--- FAILED: {} (timed out) ---\n", result.cmd));
        } else {
            context.push_str(&format!(
                "--- FAILED: {} (exit {}) ---\n",
                result.cmd, result.exit_code
            ));
        }

        let combined = if result.stderr.is_empty() {
            result.stdout.clone()
        } else if result.stdout.is_empty() {
            result.stderr.clone()
        } else {
            format!("{}\n\n--- STDERR ---\n{}", result.stdout, result.stderr)
        };

        let lines: Vec<&str> = combined.lines().collect();
        let tail_start = lines.len().saturating_sub(CONTEXT_TAIL_LINES);
        for line in &lines[tail_start..] {
            context.push_str(line);
            context.push('\n');
        }
        context.push('\n');
    }

    context
}
