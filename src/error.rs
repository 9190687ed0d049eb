//! Error taxonomy for the Autopack core.
//!
//! Every operation in the Supervisor, StrategyEngine, IssueTracker,
//! LearnedRules and BudgetAccountant returns `Result<T, AutopackError>`.
//! `anyhow` is reserved for the process boundary (`main.rs`).

use crate::model::ids::{PhaseId, RunId, TierId};
use thiserror::Error;

/// Named error kinds matching the taxonomy in the core's error handling design.
#[derive(Debug, Error)]
pub enum AutopackError {
    /// Invalid ruleset, or missing `task_category` mapping. Fails fast at `StartRun`.
    #[error("ruleset invalid: {reason}")]
    RulesetInvalid { reason: String },

    /// Builder proposed a file outside `scope_paths`.
    #[error("scope violation in phase {phase_id}: {path} is not covered by scope_paths")]
    ScopeViolation { phase_id: PhaseId, path: String },

    /// GitAdapter could not land the patch after exhausting the escalation ladder.
    #[error("patch apply exhausted for phase {phase_id}: {detail}")]
    PatchApplyExhausted { phase_id: PhaseId, detail: String },

    /// Builder or Auditor attempt caps were hit without a clean verdict.
    #[error("attempts exhausted for phase {phase_id}: {which}")]
    AttemptsExhausted { phase_id: PhaseId, which: &'static str },

    /// BudgetAccountant refused a charge that would exceed a cap.
    #[error("budget exceeded for {scope} {id}: {used} + {requested} > {cap}")]
    BudgetExceeded {
        scope: &'static str,
        id: String,
        used: u64,
        requested: u64,
        cap: u64,
    },

    /// CIGate returned `red` after exhausting configured retries.
    #[error("CI red for run {run_id} after {retries} retries")]
    CiRed { run_id: RunId, retries: u32 },

    /// GitAdapter / FileLayout / CIGate / IssueTracker unreachable beyond retry budgets.
    #[error("infrastructure failure: {detail}")]
    Infra { detail: String },

    /// A HIGH_RISK action was attempted against a safety_critical profile without
    /// the required Auditor strictness, and no safe downgrade path was available.
    #[error("policy violation: {detail}")]
    Policy { detail: String },

    /// The Run was cancelled externally.
    #[error("run {run_id} cancelled")]
    Cancelled { run_id: RunId },

    /// Transition requested is not legal from the current state.
    #[error("illegal transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: RunId,
        from: String,
        to: String,
    },

    /// A run, tier, or phase id referenced by an operation does not exist.
    #[error("unknown {kind}: {id}")]
    Unknown { kind: &'static str, id: String },

    /// Underlying I/O failure while reading or writing the FileLayout tree.
    #[error("file layout I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Underlying (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AutopackError {
    /// True if this run of the error taxonomy should sink a Run to a terminal
    /// `DONE_FAILED_*` state rather than be handled inside a Phase sub-loop.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            AutopackError::BudgetExceeded { .. }
                | AutopackError::CiRed { .. }
                | AutopackError::Infra { .. }
                | AutopackError::Policy { .. }
                | AutopackError::Cancelled { .. }
        )
    }

    /// The tier_id-specific budget-exceeded constructor, used by BudgetAccountant.
    pub fn budget_exceeded_tier(tier_id: &TierId, used: u64, requested: u64, cap: u64) -> Self {
        AutopackError::BudgetExceeded {
            scope: "tier",
            id: tier_id.to_string(),
            used,
            requested,
            cap,
        }
    }
}

pub type Result<T> = std::result::Result<T, AutopackError>;
