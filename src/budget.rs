//! BudgetAccountant — centralizes all token/attempt/wallclock accounting so
//! budget checks are O(1) and identical across the core.
//!
//! Token numbers are authoritative inputs (`BuilderResult.tokens_used` /
//! `AuditorResult.tokens_used`); the accountant never estimates them.

use crate::error::{AutopackError, Result};
use crate::model::{PhaseId, RunId, TierId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct Remaining {
    pub tokens: u64,
    pub attempts: u32,
    pub wallclock_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct PhaseLedger {
    token_cap: u64,
    tokens_used: u64,
    attempt_cap: u32,
    attempts_used: u32,
    wallclock_cap_ms: u64,
    wallclock_used_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct TierLedger {
    token_cap: u64,
    tokens_used: u64,
}

#[derive(Debug, Clone, Copy)]
struct RunLedger {
    token_cap: u64,
    tokens_used: u64,
    phase_cap: u32,
    phases_used: u32,
}

/// A charge request. `wallclock_delta_ms` and `attempts_delta` may be zero
/// for a pure token charge (e.g. recording `AuditorResult.tokens_used`
/// without consuming a fresh attempt slot).
#[derive(Debug, Clone, Copy)]
pub struct Charge {
    pub tokens: u64,
    pub wallclock_delta_ms: u64,
    pub attempts_delta: u32,
}

/// Per-run accountant. One instance per Run worker; never shared across
/// Runs (matches the concurrency model's "Run worker owns its Run" rule).
#[derive(Debug, Default)]
pub struct BudgetAccountant {
    run: Option<(RunId, RunLedger)>,
    tiers: HashMap<String, TierLedger>,
    phases: HashMap<String, PhaseLedger>,
}

impl BudgetAccountant {
    pub fn new(run_id: RunId, run_token_cap: u64, run_max_phases: u32) -> Self {
        Self {
            run: Some((
                run_id,
                RunLedger {
                    token_cap: run_token_cap,
                    tokens_used: 0,
                    phase_cap: run_max_phases,
                    phases_used: 0,
                },
            )),
            tiers: HashMap::new(),
            phases: HashMap::new(),
        }
    }

    pub fn register_tier(&mut self, tier_id: &TierId, token_cap: u64) {
        self.tiers.insert(
            tier_id.as_str().to_string(),
            TierLedger { token_cap, tokens_used: 0 },
        );
    }

    pub fn register_phase(
        &mut self,
        phase_id: &PhaseId,
        token_cap: u64,
        attempt_cap: u32,
        wallclock_cap_ms: u64,
    ) {
        self.phases.insert(
            phase_id.as_str().to_string(),
            PhaseLedger {
                token_cap,
                tokens_used: 0,
                attempt_cap,
                attempts_used: 0,
                wallclock_cap_ms,
                wallclock_used_ms: 0,
            },
        );
    }

    /// Advisory reservation, checked before a Builder request when the
    /// strategy requires preflight. Does not mutate the ledger; a caller
    /// that reserves must still `charge` once the real usage is known.
    pub fn reserve(&self, phase_id: &PhaseId, token_estimate: u64) -> Result<()> {
        let phase = self.phase_ledger(phase_id)?;
        if phase.tokens_used + token_estimate > phase.token_cap {
            return Err(AutopackError::BudgetExceeded {
                scope: "phase",
                id: phase_id.to_string(),
                used: phase.tokens_used,
                requested: token_estimate,
                cap: phase.token_cap,
            });
        }
        Ok(())
    }

    /// Charge tokens/attempts/wallclock against phase, tier, and run caps
    /// atomically: either every level accepts the charge or none of the
    /// ledgers are mutated except the run-level charge, which is always
    /// recorded even on overage (the spec requires the overage itself be
    /// visible in `tokens_used`, while still refusing further charges).
    pub fn charge(&mut self, tier_id: &TierId, phase_id: &PhaseId, charge: Charge) -> Result<()> {
        {
            let phase = self.phase_ledger(phase_id)?;
            if phase.tokens_used + charge.tokens > phase.token_cap {
                tracing::warn!(phase_id = %phase_id, used = phase.tokens_used, requested = charge.tokens, cap = phase.token_cap, "phase budget exceeded");
                return Err(AutopackError::BudgetExceeded {
                    scope: "phase",
                    id: phase_id.to_string(),
                    used: phase.tokens_used,
                    requested: charge.tokens,
                    cap: phase.token_cap,
                });
            }
            if phase.attempts_used + charge.attempts_delta > phase.attempt_cap {
                return Err(AutopackError::AttemptsExhausted {
                    phase_id: phase_id.clone(),
                    which: "builder_or_auditor",
                });
            }
        }

        let (run_id, run) = self
            .run
            .as_mut()
            .ok_or_else(|| AutopackError::Unknown { kind: "run", id: "<none>".into() })?;
        let would_exceed_run = run.tokens_used + charge.tokens > run.token_cap;
        run.tokens_used += charge.tokens;
        if would_exceed_run {
            tracing::warn!(run_id = %run_id, used = run.tokens_used, requested = charge.tokens, cap = run.token_cap, "run budget exceeded");
            return Err(AutopackError::BudgetExceeded {
                scope: "run",
                id: run_id.to_string(),
                used: run.tokens_used,
                requested: charge.tokens,
                cap: run.token_cap,
            });
        }

        if let Some(tier) = self.tiers.get_mut(tier_id.as_str()) {
            tier.tokens_used += charge.tokens;
            if tier.tokens_used > tier.token_cap {
                return Err(AutopackError::budget_exceeded_tier(
                    tier_id,
                    tier.tokens_used,
                    charge.tokens,
                    tier.token_cap,
                ));
            }
        }

        let phase = self
            .phases
            .get_mut(phase_id.as_str())
            .ok_or_else(|| AutopackError::Unknown { kind: "phase", id: phase_id.to_string() })?;
        phase.tokens_used += charge.tokens;
        phase.attempts_used += charge.attempts_delta;
        phase.wallclock_used_ms += charge.wallclock_delta_ms;

        Ok(())
    }

    pub fn complete_phase(&mut self) {
        if let Some((_, run)) = self.run.as_mut() {
            run.phases_used += 1;
        }
    }

    pub fn remaining_for(&self, phase_id: &PhaseId) -> Result<Remaining> {
        let phase = self.phase_ledger(phase_id)?;
        Ok(Remaining {
            tokens: phase.token_cap.saturating_sub(phase.tokens_used),
            attempts: phase.attempt_cap.saturating_sub(phase.attempts_used),
            wallclock_ms: phase.wallclock_cap_ms.saturating_sub(phase.wallclock_used_ms),
        })
    }

    pub fn run_tokens_used(&self) -> u64 {
        self.run.as_ref().map(|(_, r)| r.tokens_used).unwrap_or(0)
    }

    pub fn run_phases_used(&self) -> u32 {
        self.run.as_ref().map(|(_, r)| r.phases_used).unwrap_or(0)
    }

    fn phase_ledger(&self, phase_id: &PhaseId) -> Result<PhaseLedger> {
        self.phases
            .get(phase_id.as_str())
            .copied()
            .ok_or_else(|| AutopackError::Unknown { kind: "phase", id: phase_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(run_cap: u64, phase_cap: u64) -> (BudgetAccountant, TierId, PhaseId) {
        let run_id = RunId::from("run-1");
        let tier_id = TierId::from("tier-1");
        let phase_id = PhaseId::from("phase-1");
        let mut accountant = BudgetAccountant::new(run_id, run_cap, 10);
        accountant.register_tier(&tier_id, phase_cap * 3);
        accountant.register_phase(&phase_id, phase_cap, 3, 60_000);
        (accountant, tier_id, phase_id)
    }

    #[test]
    fn charge_within_cap_succeeds() {
        let (mut accountant, tier_id, phase_id) = setup(1_000_000, 200_000);
        let result = accountant.charge(
            &tier_id,
            &phase_id,
            Charge { tokens: 12_000, wallclock_delta_ms: 500, attempts_delta: 1 },
        );
        assert!(result.is_ok());
        assert_eq!(accountant.run_tokens_used(), 12_000);
    }

    #[test]
    fn phase_token_cap_zero_is_immediately_terminal() {
        let (mut accountant, tier_id, phase_id) = setup(1_000_000, 0);
        let err = accountant
            .charge(&tier_id, &phase_id, Charge { tokens: 1, wallclock_delta_ms: 0, attempts_delta: 1 })
            .unwrap_err();
        assert!(matches!(err, AutopackError::BudgetExceeded { scope: "phase", .. }));
    }

    #[test]
    fn run_budget_exhaustion_mid_run_records_the_overage() {
        let (mut accountant, tier_id, _phase_id) = setup(300_000, 1_000_000);
        let phase_1 = PhaseId::from("phase-1");
        let phase_2 = PhaseId::from("phase-2");
        accountant.register_phase(&phase_2, 1_000_000, 3, 60_000);

        accountant
            .charge(&tier_id, &phase_1, Charge { tokens: 250_000, wallclock_delta_ms: 0, attempts_delta: 1 })
            .unwrap();
        let err = accountant
            .charge(&tier_id, &phase_2, Charge { tokens: 80_000, wallclock_delta_ms: 0, attempts_delta: 1 })
            .unwrap_err();

        assert!(matches!(err, AutopackError::BudgetExceeded { scope: "run", .. }));
        assert_eq!(accountant.run_tokens_used(), 330_000);
    }

    #[test]
    fn attempts_exhausted_is_raised_before_cap_is_exceeded() {
        let (mut accountant, tier_id, phase_id) = setup(1_000_000, 1_000_000);
        for _ in 0..3 {
            accountant
                .charge(&tier_id, &phase_id, Charge { tokens: 1, wallclock_delta_ms: 0, attempts_delta: 1 })
                .unwrap();
        }
        let err = accountant
            .charge(&tier_id, &phase_id, Charge { tokens: 1, wallclock_delta_ms: 0, attempts_delta: 1 })
            .unwrap_err();
        assert!(matches!(err, AutopackError::AttemptsExhausted { .. }));
    }

    #[test]
    fn remaining_for_reflects_charges() {
        let (mut accountant, tier_id, phase_id) = setup(1_000_000, 200_000);
        accountant
            .charge(&tier_id, &phase_id, Charge { tokens: 50_000, wallclock_delta_ms: 1_000, attempts_delta: 1 })
            .unwrap();
        let remaining = accountant.remaining_for(&phase_id).unwrap();
        assert_eq!(remaining.tokens, 150_000);
        assert_eq!(remaining.attempts, 2);
    }
}
