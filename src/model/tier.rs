//! Tier — ordered grouping of phases sharing a theme.

use super::ids::{PhaseId, RunId, TierId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierState {
    Pending,
    InProgress,
    Complete,
    Failed,
    Skipped,
}

impl std::fmt::Display for TierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TierState::Pending => "PENDING",
            TierState::InProgress => "IN_PROGRESS",
            TierState::Complete => "COMPLETE",
            TierState::Failed => "FAILED",
            TierState::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierBudgets {
    /// Computed as ~3x sum(phase caps in tier).
    pub token_cap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier {
    pub tier_id: TierId,
    pub run_id: RunId,
    pub index: u32,
    pub name: String,
    pub state: TierState,
    pub phase_ids_in_order: Vec<PhaseId>,
    pub tier_budgets: TierBudgets,
    pub tokens_used: u64,
}

impl Tier {
    pub fn new(
        tier_id: TierId,
        run_id: RunId,
        index: u32,
        name: impl Into<String>,
        phase_ids_in_order: Vec<PhaseId>,
        tier_budgets: TierBudgets,
    ) -> Self {
        Self {
            tier_id,
            run_id,
            index,
            name: name.into(),
            state: TierState::Pending,
            phase_ids_in_order,
            tier_budgets,
            tokens_used: 0,
        }
    }
}
