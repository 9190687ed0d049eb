//! FileLayout — owns the on-disk artifact tree for one run, plus the
//! sibling per-project files shared across runs (§6.3).
//!
//! ```text
//! {autonomous_runs_dir}/{project_id}/runs/{family}/{run_id}/
//!   run_summary.json
//!   tiers/tier_{nn}_{name}.json
//!   phases/phase_{nn}_{phase_id}.json
//!   issues/phase_{nn}_{phase_id}_issues.json
//!   run_issue_index.json
//!   run_rule_hints.json
//! {autonomous_runs_dir}/{project_id}/
//!   project_issue_backlog.json
//!   project_learned_rules.json
//! ```

use crate::error::{AutopackError, Result};
use crate::model::{
    PhaseIssue, ProjectIssueBacklog, Run, RunId, RunRuleHint, Tier,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

pub struct FileLayout {
    autonomous_runs_dir: PathBuf,
}

impl FileLayout {
    pub fn new(autonomous_runs_dir: impl Into<PathBuf>) -> Self {
        Self { autonomous_runs_dir: autonomous_runs_dir.into() }
    }

    fn project_root(&self, project_id: &str) -> PathBuf {
        self.autonomous_runs_dir.join(project_id)
    }

    fn run_root(&self, project_id: &str, run_id: &RunId) -> PathBuf {
        self.project_root(project_id).join("runs").join(run_id.family()).join(run_id.as_str())
    }

    /// Materialize the run's directory tree. Idempotent: called once at
    /// `RUN_CREATED`, safe to call again if the Supervisor resumes after a
    /// crash before this step was confirmed.
    pub fn materialize_run(&self, run: &Run) -> Result<()> {
        let root = self.run_root(run.project_id.as_str(), &run.run_id);
        create_dir_all(&root)?;
        create_dir_all(&root.join("tiers"))?;
        create_dir_all(&root.join("phases"))?;
        create_dir_all(&root.join("issues"))?;
        create_dir_all(&self.project_root(run.project_id.as_str()))?;
        self.write_run_summary(run)
    }

    pub fn write_run_summary(&self, run: &Run) -> Result<()> {
        let root = self.run_root(run.project_id.as_str(), &run.run_id);
        write_json(&root.join("run_summary.json"), run)
    }

    pub fn read_run_summary(&self, project_id: &str, run_id: &RunId) -> Result<Run> {
        let root = self.run_root(project_id, run_id);
        read_json(&root.join("run_summary.json"))
    }

    pub fn write_tier(&self, project_id: &str, run_id: &RunId, tier: &Tier) -> Result<()> {
        let root = self.run_root(project_id, run_id);
        let path = root.join("tiers").join(format!("tier_{:02}_{}.json", tier.index, tier.name));
        write_json(&path, tier)
    }

    pub fn write_phase(&self, project_id: &str, run_id: &RunId, phase: &crate::model::Phase) -> Result<()> {
        let root = self.run_root(project_id, run_id);
        let path = root.join("phases").join(format!("phase_{:02}_{}.json", phase.index, phase.phase_id));
        write_json(&path, phase)
    }

    pub fn write_phase_issues(
        &self,
        project_id: &str,
        run_id: &RunId,
        phase_index: u32,
        phase_id: &str,
        issues: &[PhaseIssue],
    ) -> Result<()> {
        let root = self.run_root(project_id, run_id);
        let path = root.join("issues").join(format!("phase_{phase_index:02}_{phase_id}_issues.json"));
        write_json(&path, issues)
    }

    pub fn write_run_issue_index(&self, project_id: &str, run_id: &RunId, index: &crate::model::RunIssueIndex) -> Result<()> {
        let root = self.run_root(project_id, run_id);
        write_json(&root.join("run_issue_index.json"), index)
    }

    pub fn write_run_rule_hints(&self, project_id: &str, run_id: &RunId, hints: &[RunRuleHint]) -> Result<()> {
        let root = self.run_root(project_id, run_id);
        write_json(&root.join("run_rule_hints.json"), hints)
    }

    pub fn read_run_rule_hints(&self, project_id: &str, run_id: &RunId) -> Result<Vec<RunRuleHint>> {
        let root = self.run_root(project_id, run_id);
        let path = root.join("run_rule_hints.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }

    pub fn write_project_backlog(&self, project_id: &str, backlog: &ProjectIssueBacklog) -> Result<()> {
        create_dir_all(&self.project_root(project_id))?;
        write_json(&self.project_root(project_id).join("project_issue_backlog.json"), backlog)
    }

    pub fn read_project_backlog(&self, project_id: &str) -> Result<ProjectIssueBacklog> {
        let path = self.project_root(project_id).join("project_issue_backlog.json");
        if !path.exists() {
            return Ok(ProjectIssueBacklog::default());
        }
        read_json(&path)
    }

    pub fn write_project_learned_rules(&self, project_id: &str, rules: &[crate::model::LearnedRule]) -> Result<()> {
        create_dir_all(&self.project_root(project_id))?;
        write_json(&self.project_root(project_id).join("project_learned_rules.json"), rules)
    }

    pub fn read_project_learned_rules(&self, project_id: &str) -> Result<Vec<crate::model::LearnedRule>> {
        let path = self.project_root(project_id).join("project_learned_rules.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

fn create_dir_all(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| AutopackError::Io { path: path.display().to_string(), source: e })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes).map_err(|e| AutopackError::Io { path: path.display().to_string(), source: e })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| AutopackError::Io { path: path.display().to_string(), source: e })?;
    Ok(serde_json::from_slice(&bytes)?)
}
