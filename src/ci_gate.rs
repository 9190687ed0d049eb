//! CIGate — runs the configured CI profile against the integration branch
//! with bounded retry and returns a verdict. Like `GitAdapter`, the real
//! implementation is external; the core only depends on the trait.

use crate::error::Result;
use crate::model::{CiProfile, Issue, IssueSource, Severity};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Green,
    Red,
    Flaky,
}

#[derive(Debug, Clone)]
pub struct CiOutcome {
    pub verdict: Verdict,
    pub issues: Vec<Issue>,
    pub retries_used: u32,
}

#[async_trait]
pub trait CIGate: Send + Sync {
    async fn run(&self, branch: &str, ci_profile: CiProfile, timeout: Duration) -> Result<CiOutcome>;
}

/// Retries a `flaky` verdict up to `ci_profile.max_retries` with exponential
/// backoff before surfacing the final outcome to the caller. `max_retries`
/// and per-attempt backoff are accountant-level, not compiled into
/// `CiProfile` itself, since they're a CIGate implementation detail rather
/// than a Supervisor-visible policy field.
pub struct CommandCIGate {
    command: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl CommandCIGate {
    pub fn new(command: impl Into<String>, max_retries: u32) -> Self {
        Self { command: command.into(), max_retries, backoff_base: Duration::from_millis(200) }
    }

    fn suite_args(&self, ci_profile: CiProfile) -> Vec<&'static str> {
        match ci_profile {
            CiProfile::Normal => vec!["--unit", "--integration"],
            CiProfile::Strict => vec!["--unit", "--integration", "--e2e", "--safety-critical"],
        }
    }
}

#[async_trait]
impl CIGate for CommandCIGate {
    async fn run(&self, branch: &str, ci_profile: CiProfile, timeout: Duration) -> Result<CiOutcome> {
        let mut retries_used = 0;
        loop {
            let args = self.suite_args(ci_profile);
            let result = tokio::time::timeout(
                timeout,
                tokio::process::Command::new(&self.command)
                    .arg("--branch")
                    .arg(branch)
                    .args(&args)
                    .output(),
            )
            .await;

            let outcome = match result {
                Err(_) => CiOutcome { verdict: Verdict::Flaky, issues: Vec::new(), retries_used },
                Ok(Err(_)) => CiOutcome { verdict: Verdict::Flaky, issues: Vec::new(), retries_used },
                Ok(Ok(output)) => parse_command_output(&output, retries_used),
            };

            if outcome.verdict != Verdict::Flaky || retries_used >= self.max_retries {
                return Ok(outcome);
            }
            retries_used += 1;
            tokio::time::sleep(self.backoff_base * 2u32.pow(retries_used)).await;
        }
    }
}

fn parse_command_output(output: &std::process::Output, retries_used: u32) -> CiOutcome {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let issues: Vec<Issue> = stdout
        .lines()
        .filter(|line| line.starts_with("FAIL:"))
        .map(|line| Issue {
            issue_key: String::new(),
            severity: Severity::Major,
            source: IssueSource::Ci,
            category: "ci_failure".to_string(),
            message: line.trim_start_matches("FAIL:").trim().to_string(),
            evidence_ref: None,
        })
        .collect();

    let verdict = if output.status.success() {
        Verdict::Green
    } else if !issues.is_empty() {
        Verdict::Red
    } else {
        Verdict::Flaky
    };

    CiOutcome { verdict, issues, retries_used }
}

/// Test double that returns a fixed verdict without spawning any process.
pub struct FixedVerdictCIGate {
    pub verdict: Verdict,
    pub issues: Vec<Issue>,
}

impl FixedVerdictCIGate {
    pub fn green() -> Self {
        Self { verdict: Verdict::Green, issues: Vec::new() }
    }

    pub fn red(issues: Vec<Issue>) -> Self {
        Self { verdict: Verdict::Red, issues }
    }
}

#[async_trait]
impl CIGate for FixedVerdictCIGate {
    async fn run(&self, _branch: &str, _ci_profile: CiProfile, _timeout: Duration) -> Result<CiOutcome> {
        Ok(CiOutcome { verdict: self.verdict, issues: self.issues.clone(), retries_used: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_gate_returns_green() {
        let gate = FixedVerdictCIGate::green();
        let outcome = gate.run("autonomous/run-1", CiProfile::Normal, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Green);
    }

    #[tokio::test]
    async fn red_verdict_carries_ci_source_issues() {
        let issue = Issue {
            issue_key: String::new(),
            severity: Severity::Major,
            source: IssueSource::Ci,
            category: "ci_failure".into(),
            message: "schema migration test failed".into(),
            evidence_ref: None,
        };
        let gate = FixedVerdictCIGate::red(vec![issue]);
        let outcome = gate.run("autonomous/run-1", CiProfile::Strict, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::Red);
        assert_eq!(outcome.issues[0].source, IssueSource::Ci);
    }
}
