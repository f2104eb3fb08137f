//! End-to-end reconciliation against a temporary repository and event log.

use improve::{EventLog, ReconciliationEngine};
use improve_core::matching::fingerprint;
use improve_core::{Config, EventKind, Id};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

struct Fixture {
    dir: TempDir,
    config: Config,
}

impl Fixture {
    fn new(backlog: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path();
        git(repo, &["init", "-b", "main"]);
        git(repo, &["config", "user.email", "test@test.com"]);
        git(repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "# Test\n").unwrap();
        git(repo, &["add", "README.md"]);
        git(repo, &["commit", "-m", "Initial commit"]);

        let mut config = Config::default();
        config.resolve_paths(repo);
        std::fs::write(&config.backlog_file, backlog).unwrap();
        Self { dir, config }
    }

    fn record_merge(&self, id: u32, task: &str) {
        let log = EventLog::open(self.config.event_log_path()).unwrap();
        let branch = self.config.branch_for(id);
        log.append(EventKind::WorkerStarted {
            improvement_id: id,
            worker_id: 0,
            branch: branch.clone(),
            task: task.to_string(),
            task_fingerprint: fingerprint(task),
            resumed: false,
        })
        .unwrap();
        log.append(EventKind::MergeCompleted {
            job_id: Id::new(),
            improvement_id: id,
            branch,
            success: true,
            reason: None,
            commit: None,
        })
        .unwrap();
    }

    fn backlog(&self) -> String {
        std::fs::read_to_string(&self.config.backlog_file).unwrap()
    }

    fn engine(&self) -> ReconciliationEngine<'_> {
        ReconciliationEngine::new(&self.config, self.dir.path())
    }
}

#[tokio::test]
async fn exact_match_removes_only_the_merged_task() {
    let fixture = Fixture::new("- Task A\n- Task B\n");
    fixture.record_merge(1, "Task A");

    let report = fixture.engine().run(false).await.unwrap();
    assert_eq!(report.total_removed(), 1);
    assert!(report.files[0].removals[0].exact);
    assert_eq!(fixture.backlog(), "- Task B\n");
}

#[tokio::test]
async fn paraphrased_line_is_the_single_fuzzy_removal() {
    let fixture = Fixture::new(
        "- Add logging to the database layer\n\
         - **Add retry logic** to HTTP client (`src/client.rs`)\n\
         - Document the HTTP client retry settings\n",
    );
    fixture.record_merge(1, "Add retry logic to the HTTP client");

    let report = fixture.engine().run(false).await.unwrap();
    assert_eq!(report.total_removed(), 1);
    let removal = &report.files[0].removals[0];
    assert!(!removal.exact);
    assert!(removal.score >= fixture.config.fuzzy_threshold);
    assert_eq!(
        fixture.backlog(),
        "- Add logging to the database layer\n\
         - Document the HTTP client retry settings\n"
    );
}

#[tokio::test]
async fn second_pass_removes_nothing() {
    let fixture = Fixture::new("- Task A\n- Task B\n");
    fixture.record_merge(1, "Task A");

    let first = fixture.engine().run(false).await.unwrap();
    assert_eq!(first.total_removed(), 1);

    let second = fixture.engine().run(false).await.unwrap();
    assert_eq!(second.total_removed(), 0);
    assert_eq!(fixture.backlog(), "- Task B\n");
}

#[tokio::test]
async fn triage_file_is_reconciled_too() {
    let fixture = Fixture::new("- Tighten config validation\n");
    std::fs::write(
        &fixture.config.triage_file,
        "# Triage\n- Add retry logic\n- Cache parsed templates\n",
    )
    .unwrap();
    fixture.record_merge(1, "Add retry logic");

    let report = fixture.engine().run(false).await.unwrap();
    assert_eq!(report.total_removed(), 1);
    assert_eq!(fixture.backlog(), "- Tighten config validation\n");
    assert_eq!(
        std::fs::read_to_string(&fixture.config.triage_file).unwrap(),
        "# Triage\n- Cache parsed templates\n"
    );
}
