//! Version-control plumbing.
//!
//! Thin async wrappers over the `git` and `gh` CLIs. Callers only see
//! success/failure and small parsed values; diffs are never inspected.

use improve_core::prompt::sanitize_branch_name;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute {program}: {source}")]
    Execution {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("dirty working tree: {0}")]
    DirtyWorkingTree(String),
    #[error("unexpected output: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

async fn exec<I, S>(program: &OsStr, dir: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| GitError::Execution {
            program: program.to_string_lossy().to_string(),
            source,
        })
}

/// Run git and return its raw output regardless of exit status.
async fn git_output(dir: &Path, args: &[&str]) -> Result<Output> {
    debug!(dir = %dir.display(), args = ?args, "git");
    exec(OsStr::new("git"), dir, args).await
}

/// Run git and return trimmed stdout, failing on non-zero exit.
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git_output(dir, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Whether an executable answers `--version`.
pub async fn is_available(program: &Path) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Top-level directory of the repository containing `dir`.
pub async fn repo_root(dir: &Path) -> Result<PathBuf> {
    git(dir, &["rev-parse", "--show-toplevel"])
        .await
        .map(PathBuf::from)
}

/// Get the repository directory name.
pub fn repo_name(repo: &Path) -> String {
    repo.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Expand the worktree path template.
///
/// Template variables:
/// - `{{ repo }}`: repository directory name
/// - `{{ branch }}`: full branch name
/// - `{{ branch | sanitize }}`: filesystem-safe branch (slashes replaced with `-`)
pub fn expand_worktree_template(template: &str, repo: &Path, branch: &str) -> String {
    let name = repo_name(repo);
    let sanitized = sanitize_branch_name(branch);

    template
        .replace("{{ repo }}", &name)
        .replace("{{repo}}", &name)
        .replace("{{ branch | sanitize }}", &sanitized)
        .replace("{{branch | sanitize}}", &sanitized)
        .replace("{{ branch }}", branch)
        .replace("{{branch}}", branch)
}

/// Resolve an expanded template to an absolute path (relative to the repo).
pub fn resolve_worktree_path(expanded: &str, repo: &Path) -> PathBuf {
    let path = Path::new(expanded);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize_path(&repo.join(expanded))
    }
}

/// Normalize a path by resolving `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

// --- Branches ---

/// Check if a branch exists locally.
pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    let output = git_output(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
    .await?;
    Ok(output.status.success())
}

/// Create a new branch from base without checking it out.
pub async fn create_branch(repo: &Path, branch: &str, base: &str) -> Result<()> {
    git(repo, &["branch", branch, base]).await.map(drop)
}

/// Force-delete a local branch. Missing branches are not an error.
pub async fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    if !branch_exists(repo, branch).await? {
        return Ok(());
    }
    git(repo, &["branch", "-D", branch]).await.map(drop)
}

/// Number of commits on `branch` that are not on `base`.
pub async fn commits_ahead(repo: &Path, base: &str, branch: &str) -> Result<u32> {
    let range = format!("{base}..{branch}");
    let count = git(repo, &["rev-list", "--count", &range]).await?;
    count
        .parse()
        .map_err(|_| GitError::Parse(format!("rev-list --count {range}: {count}")))
}

/// Whether `ancestor` is reachable from `descendant`.
pub async fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    let output = git_output(repo, &["merge-base", "--is-ancestor", ancestor, descendant]).await?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(GitError::CommandFailed(format!(
            "git merge-base --is-ancestor {ancestor} {descendant}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

pub async fn rev_parse(dir: &Path, rev: &str) -> Result<String> {
    git(dir, &["rev-parse", rev]).await
}

pub async fn current_branch(dir: &Path) -> Result<String> {
    git(dir, &["branch", "--show-current"]).await
}

/// Checkout a branch in the given working tree.
pub async fn checkout_branch(dir: &Path, branch: &str) -> Result<()> {
    git(dir, &["checkout", branch]).await.map(drop)
}

// --- Worktrees ---

/// Attach a worktree at `path` to an existing branch.
pub async fn create_worktree(repo: &Path, path: &Path, branch: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GitError::CommandFailed(format!("failed to create parent directory: {e}"))
        })?;
    }
    let path = path.to_string_lossy();
    git(repo, &["worktree", "add", path.as_ref(), branch])
        .await
        .map(drop)
}

/// Force remove a worktree (even with local changes).
pub async fn remove_worktree_force(repo: &Path, path: &Path) -> Result<()> {
    let path = path.to_string_lossy();
    git(repo, &["worktree", "remove", "--force", path.as_ref()])
        .await
        .map(drop)
}

/// Drop administrative entries for worktrees whose directories are gone.
pub async fn prune_worktrees(repo: &Path) -> Result<()> {
    git(repo, &["worktree", "prune"]).await.map(drop)
}

/// Information about a git worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all worktrees for a repository.
pub async fn list_worktrees(repo: &Path) -> Result<Vec<WorktreeInfo>> {
    let stdout = git(repo, &["worktree", "list", "--porcelain"]).await?;
    Ok(parse_worktree_list(&stdout))
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo {
                    path: PathBuf::from(path),
                    commit,
                    branch: current_branch.take(),
                });
            }
            current_branch = None;
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo {
            path: PathBuf::from(path),
            commit,
            branch: current_branch,
        });
    }

    worktrees
}

// --- Working tree state ---

/// Check if the working tree is clean (no uncommitted changes).
pub async fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let stdout = git(dir, &["status", "--porcelain"]).await?;
    Ok(stdout.is_empty())
}

/// Stage everything and commit. Returns `false` when there was nothing to commit.
pub async fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    git(dir, &["add", "-A"]).await?;

    let staged = git_output(dir, &["diff", "--cached", "--quiet"]).await?;
    if staged.status.success() {
        return Ok(false);
    }

    git(dir, &["commit", "--no-verify", "-m", message]).await?;
    Ok(true)
}

/// Merge `source` into the branch checked out in `dir` with a merge commit.
///
/// Conflicts abort the merge so the tree is left clean.
pub async fn merge_branch(dir: &Path, source: &str, message: &str) -> Result<()> {
    let output = git_output(dir, &["merge", "--no-ff", "-m", message, source]).await?;
    if output.status.success() {
        return Ok(());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stdout.contains("CONFLICT")
        || stderr.contains("CONFLICT")
        || stderr.contains("Automatic merge failed")
    {
        if let Err(err) = git(dir, &["merge", "--abort"]).await {
            warn!(dir = %dir.display(), error = %err, "merge --abort failed");
        }
        return Err(GitError::MergeConflict(format!(
            "merge from {source} failed: {}",
            stdout.trim()
        )));
    }

    Err(GitError::CommandFailed(format!(
        "git merge {source}: {}",
        stderr.trim()
    )))
}

// --- History ---

/// Count merge commits on `base` whose subject starts with `subject_prefix`.
pub async fn count_merges(repo: &Path, base: &str, subject_prefix: &str) -> Result<u32> {
    let merges = merge_log(repo, base).await?;
    Ok(merges
        .iter()
        .filter(|m| m.subject.starts_with(subject_prefix))
        .count() as u32)
}

/// A merge commit subject and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCommit {
    pub subject: String,
    pub body: String,
}

/// Most recent merge commit on `base` whose subject names `branch`.
pub async fn find_merge_commit(repo: &Path, base: &str, branch: &str) -> Result<Option<MergeCommit>> {
    let merges = merge_log(repo, base).await?;
    Ok(merges
        .into_iter()
        .find(|m| subject_names_branch(&m.subject, branch)))
}

async fn merge_log(repo: &Path, base: &str) -> Result<Vec<MergeCommit>> {
    let stdout = git(repo, &["log", "--merges", "--format=%s%x1f%b%x1e", base]).await?;
    Ok(parse_merge_log(&stdout))
}

fn parse_merge_log(raw: &str) -> Vec<MergeCommit> {
    raw.split('\x1e')
        .filter_map(|record| {
            let record = record.trim_start_matches(['\n', '\r']);
            if record.trim().is_empty() {
                return None;
            }
            let (subject, body) = record.split_once('\x1f').unwrap_or((record, ""));
            Some(MergeCommit {
                subject: subject.trim().to_string(),
                body: body.trim().to_string(),
            })
        })
        .collect()
}

/// `branch` appears in `subject` as a whole token (so `improve/001` does not
/// match `improve/0012`).
fn subject_names_branch(subject: &str, branch: &str) -> bool {
    subject.match_indices(branch).any(|(start, _)| {
        let before = subject[..start].chars().next_back();
        let after = subject[start + branch.len()..].chars().next();
        let boundary = |c: Option<char>| {
            !matches!(c, Some(c) if c.is_alphanumeric() || c == '/' || c == '-' || c == '_')
        };
        boundary(before) && boundary(after)
    })
}

// --- Remote and review requests ---

pub async fn push_branch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    git(repo, &["push", "--force-with-lease", "-u", remote, branch])
        .await
        .map(drop)
}

pub async fn fetch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    git(repo, &["fetch", remote, branch]).await.map(drop)
}

/// Pull request state as reported by `gh pr view --json`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct ReviewRequest {
    pub number: u64,
    pub url: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub mergeable: String,
}

impl ReviewRequest {
    pub fn is_open(&self) -> bool {
        self.state.eq_ignore_ascii_case("open")
    }

    pub fn is_mergeable(&self) -> bool {
        self.mergeable.eq_ignore_ascii_case("mergeable")
    }
}

async fn gh(gh_bin: &Path, repo: &Path, args: &[&str]) -> Result<Output> {
    debug!(args = ?args, "gh");
    exec(gh_bin.as_os_str(), repo, args).await
}

/// Look up the pull request whose head is `branch`.
pub async fn find_review_request(
    gh_bin: &Path,
    repo: &Path,
    branch: &str,
) -> Result<Option<ReviewRequest>> {
    let output = gh(
        gh_bin,
        repo,
        &["pr", "view", branch, "--json", "number,url,state,mergeable"],
    )
    .await?;
    if !output.status.success() {
        // `gh pr view` exits non-zero when no pull request exists.
        return Ok(None);
    }
    serde_json::from_slice(&output.stdout)
        .map(Some)
        .map_err(|e| GitError::Parse(format!("gh pr view: {e}")))
}

/// Open a pull request from `branch` into `base`; returns its URL.
pub async fn create_review_request(
    gh_bin: &Path,
    repo: &Path,
    base: &str,
    branch: &str,
    title: &str,
    body: &str,
) -> Result<String> {
    let output = gh(
        gh_bin,
        repo,
        &[
            "pr", "create", "--base", base, "--head", branch, "--title", title, "--body", body,
        ],
    )
    .await?;
    if !output.status.success() {
        return Err(GitError::CommandFailed(format!(
            "gh pr create: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Merge a pull request with a merge commit using the given message.
pub async fn merge_review_request(
    gh_bin: &Path,
    repo: &Path,
    number: u64,
    subject: &str,
    body: &str,
) -> Result<()> {
    let number = number.to_string();
    let output = gh(
        gh_bin,
        repo,
        &[
            "pr", "merge", &number, "--merge", "--subject", subject, "--body", body,
        ],
    )
    .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not mergeable") || stderr.contains("conflict") {
            return Err(GitError::MergeConflict(format!("pull request #{number}: {}", stderr.trim())));
        }
        return Err(GitError::CommandFailed(format!("gh pr merge: {}", stderr.trim())));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_repo_name() {
        assert_eq!(repo_name(Path::new("/home/user/my-project")), "my-project");
        assert_eq!(repo_name(Path::new("/workspace")), "workspace");
    }

    #[test]
    fn test_expand_worktree_template() {
        let expanded = expand_worktree_template(
            "../{{ repo }}.{{ branch | sanitize }}",
            Path::new("/home/user/my-project"),
            "improve/007",
        );
        assert_eq!(expanded, "../my-project.improve-007");

        let expanded = expand_worktree_template(
            "/worktrees/{{branch}}",
            Path::new("/home/user/my-project"),
            "improve/007",
        );
        assert_eq!(expanded, "/worktrees/improve/007");
    }

    #[test]
    fn test_resolve_worktree_path() {
        assert_eq!(
            resolve_worktree_path("../proj.improve-001", Path::new("/home/user/proj")),
            PathBuf::from("/home/user/proj.improve-001")
        );
        assert_eq!(
            resolve_worktree_path("/abs/path", Path::new("/home/user/proj")),
            PathBuf::from("/abs/path")
        );
    }

    #[test]
    fn test_parse_worktree_list() {
        let porcelain = "worktree /repo\nHEAD aaa\nbranch refs/heads/main\n\nworktree /wt/detached\nHEAD bbb\ndetached\n\nworktree /wt/one\nHEAD ccc\nbranch refs/heads/improve/001\n";
        let list = parse_worktree_list(porcelain);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert_eq!(list[1].branch, None);
        assert_eq!(list[2].path, PathBuf::from("/wt/one"));
        assert_eq!(list[2].branch.as_deref(), Some("improve/001"));
    }

    #[test]
    fn test_parse_merge_log() {
        let raw = "Merge improve/002 [task:abc]\x1fTask: Second\x1e\nMerge improve/001 [task:def]\x1f\x1e\n";
        let merges = parse_merge_log(raw);
        assert_eq!(merges.len(), 2);
        assert_eq!(merges[0].subject, "Merge improve/002 [task:abc]");
        assert_eq!(merges[0].body, "Task: Second");
        assert_eq!(merges[1].body, "");
    }

    #[test]
    fn test_subject_names_branch() {
        assert!(subject_names_branch("Merge improve/001 [task:x]", "improve/001"));
        assert!(subject_names_branch("Merge branch 'improve/001'", "improve/001"));
        assert!(!subject_names_branch("Merge improve/0012 [task:x]", "improve/001"));
        assert!(!subject_names_branch("Merge improve/001-b", "improve/001"));
    }

    #[test]
    fn test_review_request_flags() {
        let pr: ReviewRequest = serde_json::from_str(
            r#"{"number":12,"url":"https://example.test/pr/12","state":"OPEN","mergeable":"MERGEABLE"}"#,
        )
        .unwrap();
        assert!(pr.is_open());
        assert!(pr.is_mergeable());
    }

    #[tokio::test]
    async fn test_branch_lifecycle() {
        let dir = setup_test_repo();
        let repo = repo_path(&dir);

        assert!(!branch_exists(&repo, "improve/001").await.unwrap());
        create_branch(&repo, "improve/001", "main").await.unwrap();
        assert!(branch_exists(&repo, "improve/001").await.unwrap());
        assert_eq!(commits_ahead(&repo, "main", "improve/001").await.unwrap(), 0);

        delete_branch(&repo, "improve/001").await.unwrap();
        assert!(!branch_exists(&repo, "improve/001").await.unwrap());
        // Deleting again is fine.
        delete_branch(&repo, "improve/001").await.unwrap();
    }

    #[tokio::test]
    async fn test_worktree_commit_and_ahead_count() {
        let dir = setup_test_repo();
        let repo = repo_path(&dir);
        let wt = dir.path().join("wt-001");

        create_branch(&repo, "improve/001", "main").await.unwrap();
        create_worktree(&repo, &wt, "improve/001").await.unwrap();
        assert!(wt.join("README.md").exists());

        assert!(!commit_all(&wt, "nothing").await.unwrap());
        std::fs::write(wt.join("new.txt"), "data").unwrap();
        assert!(!is_working_tree_clean(&wt).await.unwrap());
        assert!(commit_all(&wt, "add new.txt").await.unwrap());
        assert!(is_working_tree_clean(&wt).await.unwrap());
        assert_eq!(commits_ahead(&repo, "main", "improve/001").await.unwrap(), 1);

        let listed = list_worktrees(&repo).await.unwrap();
        assert!(listed
            .iter()
            .any(|w| w.branch.as_deref() == Some("improve/001")));

        remove_worktree_force(&repo, &wt).await.unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn test_merge_branch_and_history() {
        let dir = setup_test_repo();
        let repo = repo_path(&dir);

        create_branch(&repo, "improve/001", "main").await.unwrap();
        checkout_branch(&repo, "improve/001").await.unwrap();
        commit_file(&repo, "feature.txt", "feature", "Add feature");
        checkout_branch(&repo, "main").await.unwrap();

        merge_branch(&repo, "improve/001", "Merge improve/001 [task:abc123]\n\nTask: Add feature")
            .await
            .unwrap();
        assert!(repo.join("feature.txt").exists());
        assert!(is_ancestor(&repo, "improve/001", "main").await.unwrap());

        assert_eq!(count_merges(&repo, "main", "Merge improve/").await.unwrap(), 1);
        let found = find_merge_commit(&repo, "main", "improve/001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.subject, "Merge improve/001 [task:abc123]");
        assert_eq!(found.body, "Task: Add feature");
        assert!(find_merge_commit(&repo, "main", "improve/002")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_conflict_aborts() {
        let dir = setup_test_repo();
        let repo = repo_path(&dir);

        create_branch(&repo, "improve/001", "main").await.unwrap();
        checkout_branch(&repo, "improve/001").await.unwrap();
        commit_file(&repo, "README.md", "branch side\n", "Branch edit");
        checkout_branch(&repo, "main").await.unwrap();
        commit_file(&repo, "README.md", "main side\n", "Main edit");

        let result = merge_branch(&repo, "improve/001", "Merge improve/001").await;
        assert!(matches!(result, Err(GitError::MergeConflict(_))));
        assert!(is_working_tree_clean(&repo).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_available() {
        assert!(is_available(Path::new("git")).await);
        assert!(!is_available(Path::new("definitely-not-a-real-binary-xyz")).await);
    }
}
