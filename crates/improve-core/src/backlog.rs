//! Plain-text task lists (backlog and triage).
//!
//! One task per line. Markdown bullets (`- `, `* `, `+ `, `1. `, `- [ ] `) are
//! accepted and stripped from the entry text; blank lines, headings, and HTML
//! comments are kept in the file but are not tasks. Rewrites go through a
//! temporary file and a rename so a crash never leaves a half-written list.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("backlog io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("task text must be a single non-empty line")]
    InvalidTask,
}

pub type Result<T> = std::result::Result<T, BacklogError>;

/// A task line in a backlog file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogEntry {
    /// Task text with any bullet prefix removed.
    pub text: String,
    /// Position among tasks (0 = first task).
    pub position: usize,
    /// Line index within the file.
    pub line: usize,
    /// Original line without its line terminator.
    pub raw: String,
}

/// Ordered task list backed by a plain-text file.
#[derive(Debug, Clone)]
pub struct BacklogStore {
    path: PathBuf,
}

impl BacklogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short name used in events (the file name).
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().to_string())
    }

    /// All task entries in file order. A missing file is an empty list.
    pub fn read_all(&self) -> Result<Vec<BacklogEntry>> {
        let lines = self.read_lines()?;
        Ok(parse_entries(&lines))
    }

    /// First task without removing it.
    pub fn peek(&self) -> Result<Option<BacklogEntry>> {
        Ok(self.read_all()?.into_iter().next())
    }

    /// Remove and return the first task.
    pub fn pop(&self) -> Result<Option<BacklogEntry>> {
        let lines = self.read_lines()?;
        let Some(first) = parse_entries(&lines).into_iter().next() else {
            return Ok(None);
        };
        self.rewrite(&lines, &[first.line])?;
        Ok(Some(first))
    }

    /// Remove the first task whose text equals `text`.
    ///
    /// Pops when it is the head of the list; returns the removed entry.
    pub fn remove_task(&self, text: &str) -> Result<Option<BacklogEntry>> {
        let lines = self.read_lines()?;
        let wanted = text.trim();
        let Some(entry) = parse_entries(&lines)
            .into_iter()
            .find(|e| e.text == wanted)
        else {
            return Ok(None);
        };
        self.rewrite(&lines, &[entry.line])?;
        Ok(Some(entry))
    }

    /// Append a task as a `- ` bullet line.
    pub fn append(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() || text.contains('\n') {
            return Err(BacklogError::InvalidTask);
        }

        let existing = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        let separator = if existing.is_empty() || existing.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        writeln!(file, "{separator}- {text}").map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Rewrite the file without the given line indices, preserving the order
    /// and exact formatting of every other line. Returns the removed lines.
    pub fn remove_lines(&self, line_indices: &[usize]) -> Result<Vec<String>> {
        if line_indices.is_empty() {
            return Ok(Vec::new());
        }
        let lines = self.read_lines()?;
        let removed = line_indices
            .iter()
            .filter_map(|&i| lines.get(i))
            .map(|l| l.trim_end_matches(['\n', '\r']).to_string())
            .collect();
        self.rewrite(&lines, line_indices)?;
        Ok(removed)
    }

    /// Lines including their terminators, so untouched lines round-trip exactly.
    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.split_inclusive('\n').map(ToString::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn rewrite(&self, lines: &[String], skip: &[usize]) -> Result<()> {
        let content: String = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .map(|(_, l)| l.as_str())
            .collect();

        let tmp = tmp_path(&self.path);
        fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> BacklogError {
        BacklogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn parse_entries(lines: &[String]) -> Vec<BacklogEntry> {
    lines
        .iter()
        .enumerate()
        .filter_map(|(line, raw)| {
            let raw = raw.trim_end_matches(['\n', '\r']);
            task_text(raw).map(|text| (line, raw.to_string(), text))
        })
        .enumerate()
        .map(|(position, (line, raw, text))| BacklogEntry {
            text,
            position,
            line,
            raw,
        })
        .collect()
}

/// Task text of a line, or `None` for blank lines, headings, and comments.
pub fn task_text(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("<!--") {
        return None;
    }

    let mut text = trimmed;
    for bullet in ["- [ ] ", "- [x] ", "* [ ] ", "- ", "* ", "+ "] {
        if let Some(rest) = text.strip_prefix(bullet) {
            text = rest;
            break;
        }
    }
    if let Some((num, rest)) = text.split_once(". ") {
        if !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()) {
            text = rest;
        }
    }

    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(content: &str) -> (TempDir, BacklogStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("BACKLOG.md");
        std::fs::write(&path, content).unwrap();
        (dir, BacklogStore::new(path))
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BacklogStore::new(dir.path().join("none.md"));
        assert!(store.read_all().unwrap().is_empty());
        assert!(store.peek().unwrap().is_none());
        assert!(store.pop().unwrap().is_none());
    }

    #[test]
    fn read_all_skips_headings_and_strips_bullets() {
        let (_dir, store) = store_with("# Backlog\n\n- First\n* Second\n3. Third\nplain fourth\n- [ ] Fifth\n");
        let texts: Vec<String> = store.read_all().unwrap().into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["First", "Second", "Third", "plain fourth", "Fifth"]);

        let entries = store.read_all().unwrap();
        assert_eq!(entries[0].position, 0);
        assert_eq!(entries[0].line, 2);
        assert_eq!(entries[0].raw, "- First");
    }

    #[test]
    fn peek_does_not_remove() {
        let (_dir, store) = store_with("- Task A\n- Task B\n");
        assert_eq!(store.peek().unwrap().unwrap().text, "Task A");
        assert_eq!(store.read_all().unwrap().len(), 2);
    }

    #[test]
    fn pop_removes_first_task_only() {
        let (_dir, store) = store_with("# Backlog\n- Task A\n- Task B\n");
        let popped = store.pop().unwrap().unwrap();
        assert_eq!(popped.text, "Task A");
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "# Backlog\n- Task B\n");
    }

    #[test]
    fn append_adds_bullet_line() {
        let (_dir, store) = store_with("- Task A");
        store.append("Task B").unwrap();
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "- Task A\n- Task B\n");
    }

    #[test]
    fn append_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = BacklogStore::new(dir.path().join("TRIAGE.md"));
        store.append("Investigate flaky test").unwrap();
        assert_eq!(store.peek().unwrap().unwrap().text, "Investigate flaky test");
    }

    #[test]
    fn append_rejects_multiline_text() {
        let (_dir, store) = store_with("");
        assert!(matches!(store.append("a\nb"), Err(BacklogError::InvalidTask)));
        assert!(matches!(store.append("   "), Err(BacklogError::InvalidTask)));
    }

    #[test]
    fn remove_lines_preserves_order_and_formatting() {
        let (_dir, store) = store_with("# Tasks\n- **One**\n\n- Two  \n- Three\n");
        let removed = store.remove_lines(&[1, 4]).unwrap();
        assert_eq!(removed, vec!["- **One**", "- Three"]);
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "# Tasks\n\n- Two  \n");
    }

    #[test]
    fn remove_task_targets_exact_text() {
        let (_dir, store) = store_with("- Task A\n- Task B\n- Task C\n");
        let removed = store.remove_task("Task B").unwrap().unwrap();
        assert_eq!(removed.position, 1);
        assert!(store.remove_task("Task Z").unwrap().is_none());
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content, "- Task A\n- Task C\n");
    }

    #[test]
    fn rewrite_leaves_no_temp_file() {
        let (dir, store) = store_with("- Task A\n");
        store.pop().unwrap();
        assert!(!dir.path().join("BACKLOG.md.tmp").exists());
    }

    #[test]
    fn label_is_file_name() {
        let store = BacklogStore::new("/repo/docs/TRIAGE.md");
        assert_eq!(store.label(), "TRIAGE.md");
    }
}
