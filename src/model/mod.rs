//! Entity types for the Autopack core: ids, runs, tiers, phases, issues,
//! strategy, and learned rules. Pure data — no I/O, no policy.

pub mod ids;
pub mod issue;
pub mod phase;
pub mod rules;
pub mod run;
pub mod strategy;
pub mod tier;

pub use ids::{HintId, IssueKey, PhaseId, ProjectId, RuleId, RunId, TierId};
pub use issue::{
    AggregatedIssue, BacklogEntry, BacklogSnapshot, Issue, IssueSource, PhaseIssue,
    ProjectIssueBacklog, RunIssueIndex, Severity,
};
pub use phase::{glob_matches, BuilderMode, Complexity, Phase, PhaseBudgets, PhaseState, TaskCategory};
pub use rules::{LearnedRule, RuleStatus, RunRuleHint};
pub use run::{is_legal_run_transition, Run, RunBudgetsSnapshot, RunState};
pub use strategy::{
    AuditorStrictness, CategoryDefaults, CiProfile, ProjectRuleset, RunStrategy, SafetyProfile,
};
pub use tier::{Tier, TierBudgets, TierState};
