//! GitAdapter — the capability the core requires for patch application,
//! branch status, and commit tagging. Implementations are external; the
//! Supervisor only ever talks to the trait.
//!
//! `ShellGitAdapter` shells out to the system `git` binary the same way the
//! teacher's worktree bridge does; `NullGitAdapter` is an in-memory test
//! double used by unit and integration tests.

use crate::error::{AutopackError, Result};
use crate::model::RunId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Plain,
    IgnoreWhitespace,
    ThreeWay,
    DirectWriteFallback,
}

impl ApplyMode {
    /// The escalation ladder order from §4.1: exhausting one method moves to
    /// the next; exhausting all of them counts as a Builder failure.
    pub const LADDER: [ApplyMode; 4] = [
        ApplyMode::Plain,
        ApplyMode::IgnoreWhitespace,
        ApplyMode::ThreeWay,
        ApplyMode::DirectWriteFallback,
    ];
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub applied_files: Vec<String>,
    pub rejected_hunks: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BranchStatus {
    pub head: String,
    pub dirty: bool,
    pub ahead_behind_of_main: (u32, u32),
}

#[async_trait]
pub trait GitAdapter: Send + Sync {
    async fn ensure_integration_branch(&self, run_id: &RunId) -> Result<String>;
    async fn apply_patch(&self, branch: &str, patch_bytes: &[u8], mode: ApplyMode) -> Result<ApplyOutcome>;
    async fn tag_commit(&self, branch: &str, phase_id: &str, message: &str) -> Result<String>;
    async fn status(&self, branch: &str) -> Result<BranchStatus>;
}

/// Real adapter: shells out to `git` against a worktree-free bare checkout
/// rooted at `repo_root`, using `git -C <repo_root> <branch-scoped ops>`.
/// Never touches `main` — every operation here is parameterized on the
/// caller-supplied `branch`, and `ensure_integration_branch` is the only
/// entry point that creates branches, always named `autonomous/{run_id}`.
pub struct ShellGitAdapter {
    repo_root: PathBuf,
}

impl ShellGitAdapter {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self { repo_root: repo_root.into() }
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .map_err(|e| AutopackError::Infra { detail: format!("git {args:?} failed to spawn: {e}") })
    }

    fn write_patch_file(&self, patch_bytes: &[u8]) -> Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("autopack-patch-{}.diff", uuid::Uuid::new_v4()));
        std::fs::write(&path, patch_bytes)
            .map_err(|e| AutopackError::Io { path: path.display().to_string(), source: e })?;
        Ok(path)
    }

    /// Last rung of the escalation ladder: reconstruct each file's post-image
    /// directly from the diff text (context + added lines, in order, removed
    /// lines dropped) and overwrite it on disk, bypassing `git apply`'s
    /// context-matching entirely. Unlike the first three rungs this cannot
    /// reject a hunk for not matching — it only fails a file if it has
    /// nothing to write to disk (e.g. a delete-only diff).
    fn direct_write_patch(&self, patch_bytes: &[u8]) -> Result<ApplyOutcome> {
        let text = String::from_utf8_lossy(patch_bytes);
        let mut applied_files = Vec::new();
        let mut rejected_hunks = Vec::new();
        let mut current_path: Option<String> = None;
        let mut current_body = String::new();

        let mut flush = |path: &mut Option<String>, body: &mut String| {
            if let Some(p) = path.take() {
                let target = self.repo_root.join(&p);
                if let Some(parent) = target.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match std::fs::write(&target, &body) {
                    Ok(()) => applied_files.push(p),
                    Err(e) => rejected_hunks.push(format!("direct write of {p} failed: {e}")),
                }
            }
            body.clear();
        };

        for line in text.lines() {
            if let Some(path) = line.strip_prefix("+++ b/") {
                flush(&mut current_path, &mut current_body);
                current_path = Some(path.to_string());
            } else if line.starts_with("+++ ") {
                flush(&mut current_path, &mut current_body);
            } else if let Some(added) = line.strip_prefix('+') {
                current_body.push_str(added);
                current_body.push('\n');
            } else if let Some(context) = line.strip_prefix(' ') {
                current_body.push_str(context);
                current_body.push('\n');
            }
        }
        flush(&mut current_path, &mut current_body);

        Ok(ApplyOutcome { ok: !applied_files.is_empty() && rejected_hunks.is_empty(), applied_files, rejected_hunks })
    }
}

#[async_trait]
impl GitAdapter for ShellGitAdapter {
    async fn ensure_integration_branch(&self, run_id: &RunId) -> Result<String> {
        let branch = run_id.integration_branch();
        let exists = self.run(&["rev-parse", "--verify", &branch])?.status.success();
        if !exists {
            let output = self.run(&["branch", &branch, "HEAD"])?;
            if !output.status.success() {
                return Err(AutopackError::Infra {
                    detail: format!("failed to create {branch}: {}", String::from_utf8_lossy(&output.stderr)),
                });
            }
        }
        Ok(branch)
    }

    async fn apply_patch(&self, branch: &str, patch_bytes: &[u8], mode: ApplyMode) -> Result<ApplyOutcome> {
        if branch == "main" {
            return Err(AutopackError::Policy { detail: "refusing to apply a patch to main".into() });
        }
        self.run(&["checkout", branch])?;
        if mode == ApplyMode::DirectWriteFallback {
            return self.direct_write_patch(patch_bytes);
        }
        let patch_path = self.write_patch_file(patch_bytes)?;
        let patch_str = patch_path.display().to_string();

        // `--numstat`/`--stat` only report what a patch *would* do; without
        // one of those this is the actual apply.
        let mut args = vec!["apply"];
        match mode {
            ApplyMode::Plain => {}
            ApplyMode::IgnoreWhitespace => args.push("--ignore-whitespace"),
            ApplyMode::ThreeWay => args.push("--3way"),
            ApplyMode::DirectWriteFallback => unreachable!("handled above"),
        }
        args.push(&patch_str);
        let output = self.run(&args)?;
        let _ = std::fs::remove_file(&patch_path);

        if !output.status.success() {
            return Ok(ApplyOutcome {
                ok: false,
                applied_files: Vec::new(),
                rejected_hunks: vec![String::from_utf8_lossy(&output.stderr).into_owned()],
            });
        }

        let applied_files = String::from_utf8_lossy(patch_bytes)
            .lines()
            .filter_map(|line| line.strip_prefix("+++ b/").map(str::to_string))
            .collect();

        Ok(ApplyOutcome { ok: true, applied_files, rejected_hunks: Vec::new() })
    }

    async fn tag_commit(&self, branch: &str, phase_id: &str, message: &str) -> Result<String> {
        self.run(&["checkout", branch])?;
        self.run(&["add", "-A"])?;
        let output = self.run(&["commit", "-m", &format!("{phase_id}: {message}"), "--allow-empty"])?;
        if !output.status.success() {
            return Err(AutopackError::Infra {
                detail: format!("commit failed on {branch}: {}", String::from_utf8_lossy(&output.stderr)),
            });
        }
        let rev = self.run(&["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&rev.stdout).trim().to_string())
    }

    async fn status(&self, branch: &str) -> Result<BranchStatus> {
        let head = self.run(&["rev-parse", branch])?;
        let porcelain = self.run(&["status", "--porcelain"])?;
        let ahead_behind = self.run(&["rev-list", "--left-right", "--count", &format!("{branch}...main")])?;
        let (ahead, behind) = parse_ahead_behind(&String::from_utf8_lossy(&ahead_behind.stdout));
        Ok(BranchStatus {
            head: String::from_utf8_lossy(&head.stdout).trim().to_string(),
            dirty: !String::from_utf8_lossy(&porcelain.stdout).trim().is_empty(),
            ahead_behind_of_main: (ahead, behind),
        })
    }
}

fn parse_ahead_behind(raw: &str) -> (u32, u32) {
    let mut parts = raw.split_whitespace();
    let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (ahead, behind)
}

/// In-memory double for tests: tracks "applied" files without touching the
/// filesystem or spawning a process. Configurable to fail a given number of
/// apply attempts before succeeding, to exercise the escalation ladder.
pub struct NullGitAdapter {
    fail_first_n_applies: std::sync::atomic::AtomicU32,
}

impl NullGitAdapter {
    pub fn new() -> Self {
        Self { fail_first_n_applies: std::sync::atomic::AtomicU32::new(0) }
    }

    pub fn failing(n: u32) -> Self {
        Self { fail_first_n_applies: std::sync::atomic::AtomicU32::new(n) }
    }
}

impl Default for NullGitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitAdapter for NullGitAdapter {
    async fn ensure_integration_branch(&self, run_id: &RunId) -> Result<String> {
        Ok(run_id.integration_branch())
    }

    async fn apply_patch(&self, branch: &str, patch_bytes: &[u8], _mode: ApplyMode) -> Result<ApplyOutcome> {
        if branch == "main" {
            return Err(AutopackError::Policy { detail: "refusing to apply a patch to main".into() });
        }
        use std::sync::atomic::Ordering;
        let remaining = self.fail_first_n_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first_n_applies.store(remaining - 1, Ordering::SeqCst);
            return Ok(ApplyOutcome { ok: false, applied_files: Vec::new(), rejected_hunks: vec!["simulated rejection".into()] });
        }
        let text = String::from_utf8_lossy(patch_bytes);
        let files: Vec<String> = text
            .lines()
            .filter_map(|line| line.strip_prefix("+++ b/").map(str::to_string))
            .collect();
        Ok(ApplyOutcome { ok: true, applied_files: files, rejected_hunks: Vec::new() })
    }

    async fn tag_commit(&self, _branch: &str, phase_id: &str, _message: &str) -> Result<String> {
        Ok(format!("sha-{phase_id}"))
    }

    async fn status(&self, branch: &str) -> Result<BranchStatus> {
        Ok(BranchStatus { head: format!("sha-{branch}"), dirty: false, ahead_behind_of_main: (0, 0) })
    }
}

pub fn unified_diff_files(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(&path)
        .map_err(|e| AutopackError::Io { path: path.as_ref().display().to_string(), source: e })?;
    Ok(content
        .lines()
        .filter_map(|line| line.strip_prefix("+++ b/").map(str::to_string))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch(file: &str) -> Vec<u8> {
        format!("diff --git a/{file} b/{file}\n+++ b/{file}\n@@ -0,0 +1 @@\n+hello\n").into_bytes()
    }

    #[tokio::test]
    async fn null_adapter_refuses_main() {
        let adapter = NullGitAdapter::new();
        let err = adapter.apply_patch("main", &sample_patch("docs/README.md"), ApplyMode::Plain).await.unwrap_err();
        assert!(matches!(err, AutopackError::Policy { .. }));
    }

    #[tokio::test]
    async fn integration_branch_is_never_main() {
        let adapter = NullGitAdapter::new();
        let run_id = RunId::from("alpha-foundation-abc");
        let branch = adapter.ensure_integration_branch(&run_id).await.unwrap();
        assert_ne!(branch, "main");
        assert!(branch.starts_with("autonomous/"));
    }

    #[tokio::test]
    async fn apply_reports_applied_files() {
        let adapter = NullGitAdapter::new();
        let outcome = adapter
            .apply_patch("autonomous/run-1", &sample_patch("docs/README.md"), ApplyMode::Plain)
            .await
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.applied_files, vec!["docs/README.md".to_string()]);
    }

    #[tokio::test]
    async fn escalation_ladder_eventually_succeeds() {
        let adapter = NullGitAdapter::failing(2);
        let mut last = None;
        for mode in ApplyMode::LADDER {
            let outcome = adapter.apply_patch("autonomous/run-1", &sample_patch("docs/README.md"), mode).await.unwrap();
            last = Some(outcome.ok);
            if outcome.ok {
                break;
            }
        }
        assert_eq!(last, Some(true));
    }

    fn init_repo(root: &Path) {
        let run = |args: &[&str]| {
            let status = Command::new("git").args(args).current_dir(root).status().unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "--initial-branch=main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(root.join("README.md"), "seed\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "seed"]);
    }

    #[tokio::test]
    async fn shell_adapter_direct_write_fallback_writes_the_reconstructed_file() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let adapter = ShellGitAdapter::new(dir.path());
        let run_id = RunId::from("alpha-foundation-abc");
        let branch = adapter.ensure_integration_branch(&run_id).await.unwrap();

        let outcome = adapter
            .apply_patch(&branch, &sample_patch("docs/new_file.md"), ApplyMode::DirectWriteFallback)
            .await
            .unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.applied_files, vec!["docs/new_file.md".to_string()]);
        let written = std::fs::read_to_string(dir.path().join("docs/new_file.md")).unwrap();
        assert_eq!(written, "hello\n");
    }

    #[tokio::test]
    async fn shell_adapter_escalation_ladder_falls_through_to_direct_write() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let adapter = ShellGitAdapter::new(dir.path());
        let run_id = RunId::from("alpha-foundation-abc");
        let branch = adapter.ensure_integration_branch(&run_id).await.unwrap();

        // A patch with scrambled context that every real `git apply` mode
        // rejects, forcing the ladder down to `DirectWriteFallback`.
        let patch = b"diff --git a/docs/unmatched.md b/docs/unmatched.md\n--- a/docs/unmatched.md\n+++ b/docs/unmatched.md\n@@ -1,3 +1,3 @@\n nonexistent context that will never match\n-old line\n+new line\n more nonexistent context\n".to_vec();

        let mut last = None;
        for mode in ApplyMode::LADDER {
            let outcome = adapter.apply_patch(&branch, &patch, mode).await.unwrap();
            last = Some((mode, outcome.ok));
            if outcome.ok {
                break;
            }
        }
        assert_eq!(last, Some((ApplyMode::DirectWriteFallback, true)));
    }
}
