//! Run — one autonomous build attempt, and its state machine.

use super::ids::{ProjectId, RunId, TierId};
use super::strategy::{RunStrategy, SafetyProfile};
use serde::{Deserialize, Serialize};

/// Run state machine: `PLAN_BOOTSTRAP -> RUN_CREATED -> PHASE_QUEUEING ->
/// PHASE_EXECUTION -> GATE -> CI_RUNNING -> SNAPSHOT_CREATED -> DONE_SUCCESS`,
/// with failure sinks `DONE_FAILED_BUDGET`, `DONE_FAILED_POLICY`,
/// `DONE_FAILED_INFRA`, `DONE_FAILED_CI`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    PlanBootstrap,
    RunCreated,
    PhaseQueueing,
    PhaseExecution,
    Gate,
    CiRunning,
    SnapshotCreated,
    DoneSuccess,
    DoneFailedBudget,
    DoneFailedPolicy,
    DoneFailedInfra,
    DoneFailedCi,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::DoneSuccess
                | RunState::DoneFailedBudget
                | RunState::DoneFailedPolicy
                | RunState::DoneFailedInfra
                | RunState::DoneFailedCi
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::PlanBootstrap => "PLAN_BOOTSTRAP",
            RunState::RunCreated => "RUN_CREATED",
            RunState::PhaseQueueing => "PHASE_QUEUEING",
            RunState::PhaseExecution => "PHASE_EXECUTION",
            RunState::Gate => "GATE",
            RunState::CiRunning => "CI_RUNNING",
            RunState::SnapshotCreated => "SNAPSHOT_CREATED",
            RunState::DoneSuccess => "DONE_SUCCESS",
            RunState::DoneFailedBudget => "DONE_FAILED_BUDGET",
            RunState::DoneFailedPolicy => "DONE_FAILED_POLICY",
            RunState::DoneFailedInfra => "DONE_FAILED_INFRA",
            RunState::DoneFailedCi => "DONE_FAILED_CI",
        };
        write!(f, "{s}")
    }
}

/// Legal transitions in the Run state graph. Any non-terminal state may
/// transition to a `DONE_FAILED_*` sink; forward progression is otherwise
/// strictly ordered with one loop-back edge (`CI_RUNNING -> PHASE_QUEUEING`).
pub fn is_legal_run_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;

    if from.is_terminal() {
        return false;
    }
    if matches!(
        to,
        DoneFailedBudget | DoneFailedPolicy | DoneFailedInfra | DoneFailedCi
    ) {
        return true;
    }

    matches!(
        (from, to),
        (PlanBootstrap, RunCreated)
            | (RunCreated, PhaseQueueing)
            | (PhaseQueueing, PhaseExecution)
            | (PhaseExecution, Gate)
            | (Gate, CiRunning)
            | (Gate, SnapshotCreated)
            | (CiRunning, PhaseQueueing)
            | (PhaseQueueing, SnapshotCreated)
            | (SnapshotCreated, DoneSuccess)
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunBudgetsSnapshot {
    pub run_token_cap: u64,
    pub run_max_phases: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub project_id: ProjectId,
    pub stack_profile: String,
    pub safety_profile: SafetyProfile,
    pub state: RunState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub budgets_snapshot: RunBudgetsSnapshot,
    pub tokens_used: u64,
    pub phases_used: u32,
    pub duration_ms: u64,
    pub integration_branch: String,
    pub compiled_strategy_ref: RunStrategy,
    pub tier_ids_in_order: Vec<TierId>,
    pub active_tier_index: usize,
    pub terminal_reason: Option<String>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        project_id: ProjectId,
        stack_profile: impl Into<String>,
        strategy: RunStrategy,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let integration_branch = run_id.integration_branch();
        let budgets_snapshot = RunBudgetsSnapshot {
            run_token_cap: strategy.run_token_cap,
            run_max_phases: strategy.run_max_phases,
        };
        Self {
            run_id,
            project_id,
            stack_profile: stack_profile.into(),
            safety_profile: strategy.safety_profile,
            state: RunState::PlanBootstrap,
            created_at,
            budgets_snapshot,
            tokens_used: 0,
            phases_used: 0,
            duration_ms: 0,
            integration_branch,
            compiled_strategy_ref: strategy,
            tier_ids_in_order: Vec::new(),
            active_tier_index: 0,
            terminal_reason: None,
        }
    }

    /// Attempt a state transition, validating it is legal. Records
    /// `terminal_reason` when landing on a failure sink.
    pub fn advance(&mut self, to: RunState, reason: Option<&str>) -> Result<(), (RunState, RunState)> {
        if !is_legal_run_transition(self.state, to) {
            return Err((self.state, to));
        }
        tracing::info!(
            run_id = %self.run_id,
            from = %self.state,
            to = %to,
            reason = reason.unwrap_or(""),
            "run state transition"
        );
        if to.is_terminal() {
            self.terminal_reason = reason.map(String::from);
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use RunState::*;
        assert!(is_legal_run_transition(PlanBootstrap, RunCreated));
        assert!(is_legal_run_transition(RunCreated, PhaseQueueing));
        assert!(is_legal_run_transition(PhaseQueueing, PhaseExecution));
        assert!(is_legal_run_transition(PhaseExecution, Gate));
        assert!(is_legal_run_transition(Gate, CiRunning));
        assert!(is_legal_run_transition(CiRunning, PhaseQueueing));
        assert!(is_legal_run_transition(Gate, SnapshotCreated));
        assert!(is_legal_run_transition(SnapshotCreated, DoneSuccess));
    }

    #[test]
    fn any_nonterminal_can_fail() {
        use RunState::*;
        for s in [
            PlanBootstrap,
            RunCreated,
            PhaseQueueing,
            PhaseExecution,
            Gate,
            CiRunning,
            SnapshotCreated,
        ] {
            assert!(is_legal_run_transition(s, DoneFailedBudget));
            assert!(is_legal_run_transition(s, DoneFailedInfra));
        }
    }

    #[test]
    fn terminal_states_are_sinks() {
        use RunState::*;
        assert!(!is_legal_run_transition(DoneSuccess, PhaseExecution));
        assert!(!is_legal_run_transition(DoneFailedBudget, DoneSuccess));
    }

    #[test]
    fn cannot_skip_phase_queueing() {
        use RunState::*;
        assert!(!is_legal_run_transition(RunCreated, PhaseExecution));
    }
}
