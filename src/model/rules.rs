//! RunRuleHint and LearnedRule — the two-level learning loop data types.

use super::ids::{HintId, IssueKey, RuleId};
use super::phase::TaskCategory;
use serde::{Deserialize, Serialize};

/// Per-run hint, recorded when a phase resolves an issue pattern. Not
/// persisted beyond the run's own FileLayout files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRuleHint {
    pub hint_id: HintId,
    pub phase_id: String,
    pub task_category: TaskCategory,
    pub scope_paths: Vec<String>,
    pub source_issue_keys: Vec<IssueKey>,
    /// The issue category this hint was generated for (e.g.
    /// `"missing_type_hints"`), carried as a structured field rather than
    /// recovered later from `hint_text` or an opaque `issue_key`.
    pub issue_key_class: String,
    pub hint_text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Deprecated,
}

/// Persistent project-level constraint promoted from repeated hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedRule {
    pub rule_id: RuleId,
    pub task_category: TaskCategory,
    pub scope_pattern: Option<String>,
    pub constraint_text: String,
    pub source_hint_ids: Vec<HintId>,
    pub promotion_count: u32,
    pub first_seen: chrono::DateTime<chrono::Utc>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub status: RuleStatus,
    /// Index (run-count ticks) of the run that last reinforced this rule;
    /// used to compute staleness against `rule_staleness_runs`.
    pub last_reinforced_run_tick: u64,
}
