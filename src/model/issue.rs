//! Issue, PhaseIssue, RunIssueIndex, ProjectIssueBacklog — the three-level
//! dedup-and-age ledger data types owned by the IssueTracker.

use super::ids::IssueKey;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    Builder,
    Auditor,
    Ci,
    Tests,
}

/// Canonical wire shape for an issue, as submitted by Builder/Auditor/CIGate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Issue {
    pub issue_key: String,
    pub severity: Severity,
    pub source: IssueSource,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
}

/// A recorded issue within one Phase's append-only list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseIssue {
    pub issue_key: IssueKey,
    pub severity: Severity,
    pub source: IssueSource,
    pub category: String,
    pub evidence_ref: Option<String>,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub occurrence_count: u32,
}

impl PhaseIssue {
    pub fn from_issue(issue: &Issue, key: IssueKey, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            issue_key: key,
            severity: issue.severity,
            source: issue.source,
            category: issue.category.clone(),
            evidence_ref: issue.evidence_ref.clone(),
            first_seen: now,
            last_seen: now,
            occurrence_count: 1,
        }
    }

    pub fn record_recurrence(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.occurrence_count += 1;
        self.last_seen = now;
    }
}

/// Aggregated view of one issue_key across all phases of a Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedIssue {
    pub issue_key: IssueKey,
    pub severity: Severity,
    pub category: String,
    pub occurrence_count: u32,
    pub first_phase_seen: String,
    pub is_resolved: bool,
}

/// Per-run map `issue_key -> aggregated occurrences across phases in run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunIssueIndex {
    pub entries: HashMap<String, AggregatedIssue>,
}

/// Per-project aging ledger of unresolved issue_keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogEntry {
    pub issue_key: IssueKey,
    pub occurrence_count_across_runs: u32,
    pub runs_seen: Vec<String>,
    pub age_in_runs: u32,
    pub needs_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectIssueBacklog {
    pub entries: HashMap<String, BacklogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogSnapshot {
    pub project_id: String,
    pub entries: Vec<BacklogEntry>,
}
