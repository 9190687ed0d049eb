//! Phase — the smallest bounded unit of work: one Builder/Auditor loop with
//! explicit scope and budgets.

use super::ids::{PhaseId, TierId};
use super::issue::PhaseIssue;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Closed set of task categories known to the core. New categories require a
/// ruleset migration; the core refuses unknown categories at `StartRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    FeatureScaffolding,
    FeatureEnhancement,
    RefactorOptimization,
    TestScaffolding,
    TestEnhancement,
    DocsCreation,
    DocsEnhancement,
    BugfixTargeted,
    BugfixExploratory,
    SecurityHardening,
    ConfigInfra,
    ExternalFeatureReuse,
    SchemaContractChange,
    CrossCuttingRefactor,
    IndexRegistryChange,
    BulkMultiFileOperation,
    SecurityAuthChange,
    DebtCleanup,
}

impl TaskCategory {
    pub const ALL: &'static [TaskCategory] = &[
        TaskCategory::FeatureScaffolding,
        TaskCategory::FeatureEnhancement,
        TaskCategory::RefactorOptimization,
        TaskCategory::TestScaffolding,
        TaskCategory::TestEnhancement,
        TaskCategory::DocsCreation,
        TaskCategory::DocsEnhancement,
        TaskCategory::BugfixTargeted,
        TaskCategory::BugfixExploratory,
        TaskCategory::SecurityHardening,
        TaskCategory::ConfigInfra,
        TaskCategory::ExternalFeatureReuse,
        TaskCategory::SchemaContractChange,
        TaskCategory::CrossCuttingRefactor,
        TaskCategory::IndexRegistryChange,
        TaskCategory::BulkMultiFileOperation,
        TaskCategory::SecurityAuthChange,
        TaskCategory::DebtCleanup,
    ];

    /// HIGH_RISK categories force `ci_profile=strict`, tighter attempt caps,
    /// and Auditor-preferred mode for patch decisions.
    pub fn is_high_risk(self) -> bool {
        matches!(
            self,
            TaskCategory::ExternalFeatureReuse
                | TaskCategory::SchemaContractChange
                | TaskCategory::CrossCuttingRefactor
                | TaskCategory::IndexRegistryChange
                | TaskCategory::BulkMultiFileOperation
                | TaskCategory::SecurityAuthChange
        )
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "unknown".into());
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuilderMode {
    Compose,
    Transform,
    Extend,
}

/// Per-phase budget caps, resolved by the StrategyEngine from `CategoryDefaults`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PhaseBudgets {
    pub token_cap: u64,
    pub max_builder_attempts: u32,
    pub max_auditor_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Queued,
    Executing,
    Gate,
    CiRunning,
    Complete,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PhaseState::Complete | PhaseState::Failed | PhaseState::Skipped
        )
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseState::Queued => "QUEUED",
            PhaseState::Executing => "EXECUTING",
            PhaseState::Gate => "GATE",
            PhaseState::CiRunning => "CI_RUNNING",
            PhaseState::Complete => "COMPLETE",
            PhaseState::Failed => "FAILED",
            PhaseState::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: PhaseId,
    pub tier_id: TierId,
    pub index: u32,
    pub name: String,
    pub task_category: TaskCategory,
    pub complexity: Complexity,
    pub builder_mode: BuilderMode,
    pub scope_paths: Vec<String>,
    pub read_only_context_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub phase_budgets: PhaseBudgets,
    pub state: PhaseState,
    pub builder_attempts: u32,
    pub auditor_attempts: u32,
    pub tokens_used: u64,
    pub last_failure_reason: Option<String>,
    pub artifact_refs: Vec<String>,
    pub issues: Vec<PhaseIssue>,
}

impl Phase {
    pub fn new(
        phase_id: PhaseId,
        tier_id: TierId,
        index: u32,
        name: impl Into<String>,
        task_category: TaskCategory,
        complexity: Complexity,
        builder_mode: BuilderMode,
        scope_paths: Vec<String>,
        phase_budgets: PhaseBudgets,
    ) -> Self {
        Self {
            phase_id,
            tier_id,
            index,
            name: name.into(),
            task_category,
            complexity,
            builder_mode,
            scope_paths,
            read_only_context_paths: Vec::new(),
            acceptance_criteria: Vec::new(),
            phase_budgets,
            state: PhaseState::Queued,
            builder_attempts: 0,
            auditor_attempts: 0,
            tokens_used: 0,
            last_failure_reason: None,
            artifact_refs: Vec::new(),
            issues: Vec::new(),
        }
    }

    /// Whether a proposed file path is covered by some glob in `scope_paths`.
    /// An empty `scope_paths` rejects every proposed file (boundary behavior).
    pub fn covers(&self, path: &str) -> bool {
        self.scope_paths.iter().any(|glob| glob_matches(glob, path))
    }
}

/// Minimal glob matcher supporting `**` (any depth) and `*` (single segment)
/// — enough for the `scope_paths` contract without pulling in a globbing crate
/// the pack doesn't otherwise use for this purpose.
pub fn glob_matches(glob: &str, path: &str) -> bool {
    let glob_parts: Vec<&str> = glob.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();
    matches_parts(&glob_parts, &path_parts)
}

fn matches_parts(glob: &[&str], path: &[&str]) -> bool {
    match (glob.first(), path.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(&"**"), _) => {
            if glob.len() == 1 {
                return true;
            }
            (0..=path.len()).any(|skip| matches_parts(&glob[1..], &path[skip..]))
        }
        (Some(g), Some(p)) => segment_matches(g, p) && matches_parts(&glob[1..], &path[1..]),
        (Some(_), None) => false,
    }
}

fn segment_matches(glob_segment: &str, path_segment: &str) -> bool {
    if glob_segment == "*" {
        return true;
    }
    if let Some((prefix, suffix)) = glob_segment.split_once('*') {
        return path_segment.starts_with(prefix) && path_segment.ends_with(suffix);
    }
    glob_segment == path_segment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_risk_categories_are_closed() {
        assert!(TaskCategory::SchemaContractChange.is_high_risk());
        assert!(!TaskCategory::DocsCreation.is_high_risk());
    }

    #[test]
    fn glob_matches_double_star() {
        assert!(glob_matches("docs/**", "docs/README.md"));
        assert!(glob_matches("docs/**", "docs/sub/dir/file.md"));
        assert!(!glob_matches("docs/**", "src/core.py"));
    }

    #[test]
    fn glob_matches_single_segment_star() {
        assert!(glob_matches("src/*.rs", "src/lib.rs"));
        assert!(!glob_matches("src/*.rs", "src/sub/lib.rs"));
    }

    #[test]
    fn empty_scope_rejects_everything() {
        let phase = Phase::new(
            PhaseId::from("p1"),
            TierId::from("t1"),
            0,
            "empty",
            TaskCategory::DocsCreation,
            Complexity::Low,
            BuilderMode::Compose,
            vec![],
            PhaseBudgets {
                token_cap: 1000,
                max_builder_attempts: 1,
                max_auditor_attempts: 1,
            },
        );
        assert!(!phase.covers("docs/README.md"));
    }

    #[test]
    fn phase_state_terminal() {
        assert!(PhaseState::Complete.is_terminal());
        assert!(!PhaseState::Executing.is_terminal());
    }
}
