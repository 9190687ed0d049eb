//! ProjectRuleset and RunStrategy — the StrategyEngine's input and output.

use super::phase::{Complexity, TaskCategory};
use super::rules::LearnedRule;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SafetyProfile {
    Normal,
    SafetyCritical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiProfile {
    Normal,
    Strict,
}

/// Per-`task_category x complexity x safety_profile` policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryDefaults {
    pub phase_token_cap_low: u64,
    pub phase_token_cap_medium: u64,
    pub phase_token_cap_high: u64,
    pub max_builder_attempts: u32,
    pub max_auditor_attempts: u32,
    pub ci_profile: CiProfile,
    pub auditor_strictness: AuditorStrictness,
    pub minor_issue_tolerance: u32,
}

impl CategoryDefaults {
    pub fn token_cap_for(&self, complexity: Complexity) -> u64 {
        match complexity {
            Complexity::Low => self.phase_token_cap_low,
            Complexity::Medium => self.phase_token_cap_medium,
            Complexity::High => self.phase_token_cap_high,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditorStrictness {
    Standard,
    Strict,
}

/// Persistent per-project configuration: one `CategoryDefaults` per
/// `task_category`. Every category in `TaskCategory::ALL` MUST be mapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRuleset {
    pub project_id: String,
    pub categories: HashMap<TaskCategory, CategoryDefaults>,
    /// Ceiling a spec-provided run-level token cap is clamped to.
    pub run_token_cap_ceiling: u64,
    /// Aging threshold (runs) before a backlog entry needs cleanup, normal profile.
    pub aging_threshold_normal: u32,
    /// Aging threshold, safety_critical profile (tighter).
    pub aging_threshold_safety_critical: u32,
    /// Learned-rule promotion threshold (occurrences within one run), a
    /// safety_profile-configurable parameter per the open-question resolution.
    pub promotion_threshold: u32,
    /// Runs without reinforcement before a LearnedRule is deprecated.
    pub rule_staleness_runs: u32,
}

impl ProjectRuleset {
    pub fn aging_threshold(&self, safety_profile: SafetyProfile) -> u32 {
        match safety_profile {
            SafetyProfile::Normal => self.aging_threshold_normal,
            SafetyProfile::SafetyCritical => self.aging_threshold_safety_critical,
        }
    }
}

/// The frozen, compiled view of ruleset + learned rules for one Run. Never
/// mutated mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStrategy {
    pub safety_profile: SafetyProfile,
    pub category_policy: HashMap<TaskCategory, CategoryDefaults>,
    pub run_token_cap: u64,
    pub run_max_phases: u32,
    pub learned_rules_snapshot: Vec<LearnedRule>,
    /// Caps phases per tier when `safety_profile=safety_critical` prefers
    /// `run_scope=small_steps`.
    pub max_phases_per_tier: Option<u32>,
    pub promotion_threshold: u32,
    pub aging_threshold: u32,
    /// Hash of the compiled strategy for auditability (`Compile` determinism law).
    pub strategy_hash: String,
}
