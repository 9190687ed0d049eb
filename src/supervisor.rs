//! Supervisor — the Run/Tier/Phase state machine and scheduler that
//! composes every other component (StrategyEngine, IssueTracker,
//! LearnedRules, BudgetAccountant, GitAdapter, CIGate) into the full build
//! lifecycle.
//!
//! Mirrors the pack's "worker owns its state, advance() validates the
//! transition table" idiom from `state_machine.rs`, generalized to three
//! nested state machines (Run, Tier, Phase) plus the budget/issue/learning
//! side-ledgers the original single state machine didn't need.
//!
//! All mutable state lives behind one `tokio::sync::Mutex`. The spec's
//! project-lock-then-run-lock discipline is about *ordering*, not about
//! using two distinct locks; a single lock can never deadlock on itself, so
//! this collapses both into one without weakening any invariant the
//! ordering rule protects. The lock is dropped before every await on
//! `GitAdapter`/`CIGate` so slow external calls for different Runs can
//! still proceed concurrently; only the bookkeeping around them is
//! serialized.

use crate::budget::{BudgetAccountant, Charge};
use crate::ci_gate::{CIGate, Verdict};
use crate::contracts::{AuditorRequest, AuditorResult, BuilderResult};
use crate::error::{AutopackError, Result};
use crate::file_layout::FileLayout;
use crate::git_adapter::{ApplyMode, GitAdapter};
use crate::issue_tracker::{self, RunIssueTracker};
use crate::learned_rules;
use crate::model::{
    BuilderMode, CiProfile, Complexity, HintId, Issue, IssueKey, Phase, PhaseBudgets,
    PhaseId, PhaseState, ProjectId, ProjectIssueBacklog, ProjectRuleset, RuleId, Run, RunId,
    RunRuleHint, RunState, SafetyProfile, TaskCategory, Tier, TierBudgets, TierId, TierState,
};
use crate::strategy_engine::{self, RunSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default per-phase wallclock budget handed to the BudgetAccountant. Not
/// part of the data model (`PhaseBudgets` only carries token/attempt caps);
/// this is an implementation-level ceiling against runaway wallclock use.
const DEFAULT_PHASE_WALLCLOCK_MS: u64 = 30 * 60 * 1000;

/// Default timeout handed to `CIGate::run`.
const DEFAULT_CI_TIMEOUT: Duration = Duration::from_secs(600);

/// Cap on how many learned-rules/hints are injected into a Phase's prompt
/// context, per the sub-loop's "top N by recency/weight" rule.
const LEARNED_CONTEXT_CAP: usize = 10;

/// One phase's declared shape, supplied by the caller at `StartRun`.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub task_category: TaskCategory,
    pub complexity: Complexity,
    pub builder_mode: BuilderMode,
    pub scope_paths: Vec<String>,
    pub read_only_context_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TierSpec {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

/// The run spec handed to `StartRun`: project, safety profile, requested
/// budgets, and the declared Tier/Phase tree.
#[derive(Debug, Clone)]
pub struct StartRunRequest {
    pub project_id: ProjectId,
    pub stack_profile: String,
    pub safety_profile: SafetyProfile,
    pub requested_token_cap: u64,
    pub requested_max_phases: u32,
    pub tiers: Vec<TierSpec>,
}

/// Read projection returned by `GetRun` — a serializable snapshot, never a
/// handle into the live stores (per the ownership note on `RunView`).
#[derive(Debug, Clone)]
pub struct RunView {
    pub run: Run,
    pub tiers: Vec<Tier>,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone)]
pub struct PhaseStatusUpdate {
    pub state: PhaseState,
    pub tokens_delta: Option<u64>,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IntegrationStatus {
    pub branch: String,
    pub commits: Vec<String>,
    pub ci_profile: CiProfile,
    pub last_ci_verdict: Option<Verdict>,
}

/// Registered, persistent per-project config. The ruleset is loaded once
/// (ambient TOML/YAML config, see `main.rs`) and registered before any Run
/// for that project starts.
struct ProjectState {
    ruleset: ProjectRuleset,
    /// Monotonic counter of completed runs for this project, used as the
    /// `run_tick` input to rule promotion/staleness. Reset on process
    /// restart; a real deployment would persist this alongside the rule
    /// store, but the data model has no field for it (see DESIGN.md).
    run_tick: u64,
}

/// All per-run mutable state, owned exclusively by its Run worker for the
/// lifetime of the Run.
struct RunWorkspace {
    run: Run,
    tiers: HashMap<TierId, Tier>,
    phases: HashMap<PhaseId, Phase>,
    budget: BudgetAccountant,
    issues: RunIssueTracker,
    hints: Vec<RunRuleHint>,
    commits: Vec<String>,
    last_ci_verdict: Option<Verdict>,
    /// Patch bytes from the most recent `SubmitBuilderResult`, keyed by
    /// phase_id, held so `RequestAuditorReview` can hand them back without
    /// the caller resending the patch.
    pending_patch: HashMap<String, Vec<u8>>,
}

struct SupervisorState {
    projects: HashMap<String, ProjectState>,
    runs: HashMap<RunId, RunWorkspace>,
}

/// The Supervisor: owns no business policy of its own beyond the state
/// machine and scheduling rules — StrategyEngine, IssueTracker,
/// LearnedRules and BudgetAccountant are the actual policy engines, this
/// just drives them in the right order.
pub struct Supervisor<G: GitAdapter, C: CIGate> {
    git: Arc<G>,
    ci: Arc<C>,
    file_layout: FileLayout,
    state: Mutex<SupervisorState>,
}

impl<G: GitAdapter, C: CIGate> Supervisor<G, C> {
    pub fn new(git: Arc<G>, ci: Arc<C>, file_layout: FileLayout) -> Self {
        Self {
            git,
            ci,
            file_layout,
            state: Mutex::new(SupervisorState { projects: HashMap::new(), runs: HashMap::new() }),
        }
    }

    /// Register (or replace) a project's compiled ruleset. Not itself part
    /// of the closed ControlPlane operation set — ruleset loading is
    /// ambient config (§1.1), wired once at process start by `main.rs`.
    pub async fn register_project(&self, ruleset: ProjectRuleset) {
        let mut state = self.state.lock().await;
        let key = ruleset.project_id.clone();
        match state.projects.get_mut(&key) {
            Some(project) => project.ruleset = ruleset,
            None => {
                state.projects.insert(key, ProjectState { ruleset, run_tick: 0 });
            }
        }
    }

    /// `StartRun(spec) -> run_id | ErrBudgetInvalid | ErrRulesetMissing`.
    pub async fn start_run(&self, req: StartRunRequest) -> Result<RunId> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .get(req.project_id.as_str())
            .ok_or_else(|| AutopackError::RulesetInvalid {
                reason: format!("no ruleset registered for project {}", req.project_id),
            })?;
        let ruleset = project.ruleset.clone();

        let learned_rules_snapshot = self.file_layout.read_project_learned_rules(req.project_id.as_str())?;

        let mut task_categories_in_use: Vec<TaskCategory> = Vec::new();
        for tier in &req.tiers {
            for phase in &tier.phases {
                if !task_categories_in_use.contains(&phase.task_category) {
                    task_categories_in_use.push(phase.task_category);
                }
            }
        }

        let run_spec = RunSpec {
            project_id: req.project_id.to_string(),
            safety_profile: req.safety_profile,
            requested_token_cap: req.requested_token_cap,
            requested_max_phases: req.requested_max_phases,
            task_categories_in_use,
        };
        let strategy = strategy_engine::compile(&ruleset, &learned_rules_snapshot, &run_spec)?;

        let slug: String = req.stack_profile.chars().map(|c| if c.is_alphanumeric() { c } else { '-' }).collect();
        let family = format!("{}-{}", req.project_id, slug);
        let run_id = RunId::generate(&req.project_id, &family);
        let now = chrono::Utc::now();

        let mut run = Run::new(run_id.clone(), req.project_id.clone(), req.stack_profile.clone(), strategy.clone(), now);
        run.advance(RunState::RunCreated, None).map_err(|(from, to)| AutopackError::IllegalTransition {
            run_id: run_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })?;

        let mut tiers: HashMap<TierId, Tier> = HashMap::new();
        let mut phases: HashMap<PhaseId, Phase> = HashMap::new();
        let mut tier_ids_in_order: Vec<TierId> = Vec::new();
        let mut budget = BudgetAccountant::new(run_id.clone(), strategy.run_token_cap, strategy.run_max_phases);

        for (tier_index, tier_spec) in req.tiers.iter().enumerate() {
            let tier_id = TierId::new(format!("{run_id}-tier-{tier_index:02}"));
            let mut phase_ids = Vec::new();
            let mut phase_caps = Vec::new();

            for (phase_index, phase_spec) in tier_spec.phases.iter().enumerate() {
                let phase_id = PhaseId::new(format!("{tier_id}-phase-{phase_index:02}"));
                let defaults = strategy.category_policy.get(&phase_spec.task_category).ok_or_else(|| {
                    AutopackError::RulesetInvalid {
                        reason: format!("no compiled policy for task_category={}", phase_spec.task_category),
                    }
                })?;
                let token_cap = defaults.token_cap_for(phase_spec.complexity);
                let phase_budgets = PhaseBudgets {
                    token_cap,
                    max_builder_attempts: defaults.max_builder_attempts,
                    max_auditor_attempts: defaults.max_auditor_attempts,
                };
                let mut phase = Phase::new(
                    phase_id.clone(),
                    tier_id.clone(),
                    phase_index as u32,
                    phase_spec.name.clone(),
                    phase_spec.task_category,
                    phase_spec.complexity,
                    phase_spec.builder_mode,
                    phase_spec.scope_paths.clone(),
                    phase_budgets,
                );
                phase.read_only_context_paths = phase_spec.read_only_context_paths.clone();
                phase.acceptance_criteria = phase_spec.acceptance_criteria.clone();

                let attempt_cap = phase_budgets.max_builder_attempts + phase_budgets.max_auditor_attempts;
                budget.register_phase(&phase_id, token_cap, attempt_cap, DEFAULT_PHASE_WALLCLOCK_MS);

                phase_caps.push(token_cap);
                phase_ids.push(phase_id.clone());
                phases.insert(phase_id, phase);
            }

            let tier_budgets = TierBudgets { token_cap: strategy_engine::tier_token_cap(phase_caps) };
            budget.register_tier(&tier_id, tier_budgets.token_cap);
            let tier = Tier::new(tier_id.clone(), run_id.clone(), tier_index as u32, tier_spec.name.clone(), phase_ids, tier_budgets);
            tier_ids_in_order.push(tier_id.clone());
            tiers.insert(tier_id, tier);
        }

        run.tier_ids_in_order = tier_ids_in_order;

        self.file_layout.materialize_run(&run)?;
        for tier in tiers.values() {
            self.file_layout.write_tier(req.project_id.as_str(), &run_id, tier)?;
        }
        for phase in phases.values() {
            self.file_layout.write_phase(req.project_id.as_str(), &run_id, phase)?;
        }

        run.advance(RunState::PhaseQueueing, None).map_err(|(from, to)| AutopackError::IllegalTransition {
            run_id: run_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })?;
        self.file_layout.write_run_summary(&run)?;

        state.runs.insert(
            run_id.clone(),
            RunWorkspace {
                run,
                tiers,
                phases,
                budget,
                issues: RunIssueTracker::new(),
                hints: Vec::new(),
                commits: Vec::new(),
                last_ci_verdict: None,
                pending_patch: HashMap::new(),
            },
        );

        Ok(run_id)
    }

    /// `GetRun(run_id) -> RunView`.
    pub async fn get_run(&self, run_id: &RunId) -> Result<RunView> {
        let state = self.state.lock().await;
        let ws = state.runs.get(run_id).ok_or_else(|| unknown_run(run_id))?;
        let mut tiers: Vec<Tier> = ws.tiers.values().cloned().collect();
        tiers.sort_by_key(|t| t.index);
        let mut phases: Vec<Phase> = ws.phases.values().cloned().collect();
        phases.sort_by_key(|p| (p.tier_id.as_str().to_string(), p.index));
        Ok(RunView { run: ws.run.clone(), tiers, phases })
    }

    /// `UpdatePhaseStatus(run_id, phase_id, {state, metrics, evidence?}) ->
    /// Ack | ErrInvalidTransition | ErrUnknownPhase`.
    pub async fn update_phase_status(&self, run_id: &RunId, phase_id: &PhaseId, update: PhaseStatusUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let ws = state.runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))?;
        let tier_id = {
            let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
            phase.tier_id.clone()
        };

        {
            let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
            if !is_legal_phase_transition(phase.state, update.state) {
                return Err(AutopackError::IllegalTransition {
                    run_id: run_id.clone(),
                    from: phase.state.to_string(),
                    to: update.state.to_string(),
                });
            }
        }

        if let Some(tokens) = update.tokens_delta {
            charge_phase(ws, &tier_id, phase_id, tokens, 0, 0)?;
        }

        let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
        tracing::info!(phase_id = %phase_id, from = %phase.state, to = %update.state, "phase state transition");
        phase.state = update.state;
        if let Some(evidence) = update.evidence {
            phase.artifact_refs.push(evidence);
        }
        self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, phase)?;
        Ok(())
    }

    /// `SubmitBuilderResult(run_id, phase_id, BuilderResult) -> Ack`.
    ///
    /// Implements sub-loop steps 2-4: increments `builder_attempts`,
    /// charges tokens, validates scope, then applies the patch via the
    /// escalation ladder. The patch-apply await happens with the state
    /// lock released.
    pub async fn submit_builder_result(&self, run_id: &RunId, phase_id: &PhaseId, result: BuilderResult) -> Result<()> {
        let branch = {
            let mut state = self.state.lock().await;
            let ws = state.runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))?;
            let branch = ws.run.integration_branch.clone();
            let tier_id = {
                let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                phase.tier_id.clone()
            };

            if ws.run.state == RunState::PhaseQueueing {
                ws.run.advance(RunState::PhaseExecution, Some("phase dequeued")).map_err(illegal(run_id))?;
            }

            {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                if phase.state == PhaseState::Queued {
                    phase.state = PhaseState::Executing;
                }
                phase.builder_attempts += 1;
                if phase.builder_attempts > phase.phase_budgets.max_builder_attempts {
                    phase.state = PhaseState::Failed;
                    phase.last_failure_reason = Some("builder attempts exhausted".into());
                    return Err(AutopackError::AttemptsExhausted { phase_id: phase_id.clone(), which: "builder" });
                }
            }

            charge_phase(ws, &tier_id, phase_id, result.tokens_used, result.elapsed_ms, 1)?;

            for path in &result.proposed_files {
                let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                if !phase.covers(path) {
                    let issue = Issue {
                        issue_key: String::new(),
                        severity: crate::model::Severity::Minor,
                        source: crate::model::IssueSource::Builder,
                        category: "scope_violation".into(),
                        message: format!("proposed file {path} is not covered by scope_paths"),
                        evidence_ref: None,
                    };
                    ws.issues.record_issue(phase_id.as_str(), phase.index, &issue, chrono::Utc::now());
                    return Err(AutopackError::ScopeViolation { phase_id: phase_id.clone(), path: path.clone() });
                }
            }

            ws.pending_patch.insert(phase_id.to_string(), result.patch.clone());
            branch
        };

        let mut applied = None;
        for mode in ApplyMode::LADDER {
            match self.git.apply_patch(&branch, &result.patch, mode).await {
                Ok(outcome) if outcome.ok => {
                    applied = Some(outcome);
                    break;
                }
                Ok(_) => continue,
                Err(AutopackError::Policy { detail }) => return Err(AutopackError::Policy { detail }),
                Err(_) => continue,
            }
        }

        let mut state = self.state.lock().await;
        let ws = state.runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))?;
        match applied {
            Some(outcome) => {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                phase.artifact_refs.extend(outcome.applied_files);
                self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, phase)?;
                Ok(())
            }
            None => {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                phase.state = PhaseState::Failed;
                phase.last_failure_reason = Some("patch apply exhausted the escalation ladder".into());
                self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, phase)?;
                Err(AutopackError::PatchApplyExhausted { phase_id: phase_id.clone(), detail: "all apply modes rejected".into() })
            }
        }
    }

    /// `RequestAuditorReview(run_id, phase_id) -> AuditorRequest`.
    pub async fn request_auditor_review(&self, run_id: &RunId, phase_id: &PhaseId) -> Result<AuditorRequest> {
        let state = self.state.lock().await;
        let ws = state.runs.get(run_id).ok_or_else(|| unknown_run(run_id))?;
        let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
        let patch = ws.pending_patch.get(phase_id.as_str()).cloned().unwrap_or_default();
        let defaults = ws
            .run
            .compiled_strategy_ref
            .category_policy
            .get(&phase.task_category)
            .ok_or_else(|| AutopackError::RulesetInvalid { reason: "phase category missing from compiled strategy".into() })?;

        let mut context: Vec<String> = ws
            .run
            .compiled_strategy_ref
            .learned_rules_snapshot
            .iter()
            .filter(|rule| rule.task_category == phase.task_category)
            .filter(|rule| match &rule.scope_pattern {
                Some(pattern) => phase.scope_paths.iter().any(|p| crate::model::glob_matches(pattern, p) || crate::model::glob_matches(p, pattern)),
                None => true,
            })
            .map(|rule| rule.constraint_text.clone())
            .collect();
        let run_hints = learned_rules::hints_for_phase(&ws.hints, phase.task_category, &phase.scope_paths, LEARNED_CONTEXT_CAP);
        context.extend(run_hints.into_iter().map(|h| h.hint_text.clone()));
        context.truncate(LEARNED_CONTEXT_CAP);

        Ok(AuditorRequest {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index: phase.builder_attempts,
            patch,
            scope_paths: phase.scope_paths.clone(),
            learned_rules_context: context,
            strictness: defaults.auditor_strictness,
        })
    }

    /// `SubmitAuditorResult(run_id, phase_id, AuditorResult) -> Ack`.
    ///
    /// Implements sub-loop steps 5-7 plus the Run/Tier progression that
    /// follows a clean Gate: CI invocation, hint recording for resolved
    /// issues, and scheduling the next Phase or finishing the Run.
    pub async fn submit_auditor_result(&self, run_id: &RunId, phase_id: &PhaseId, result: AuditorResult) -> Result<()> {
        let ci_plan = {
            let mut state = self.state.lock().await;
            let SupervisorState { projects, runs } = &mut *state;
            let ws = runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))?;
            let tier_id = {
                let phase = ws.phases.get(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                phase.tier_id.clone()
            };

            {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                phase.auditor_attempts += 1;
                if phase.auditor_attempts > phase.phase_budgets.max_auditor_attempts {
                    phase.state = PhaseState::Failed;
                    phase.last_failure_reason = Some("auditor attempts exhausted".into());
                    return Err(AutopackError::AttemptsExhausted { phase_id: phase_id.clone(), which: "auditor" });
                }
            }

            charge_phase(ws, &tier_id, phase_id, result.tokens_used, result.elapsed_ms, 1)?;

            let phase_index = ws.phases.get(phase_id).map(|p| p.index).unwrap_or(0);
            let prior_keys: Vec<(IssueKey, String)> = ws
                .issues
                .phase_issues(phase_id.as_str())
                .iter()
                .map(|issue| (issue.issue_key.clone(), issue.category.clone()))
                .collect();

            let now = chrono::Utc::now();
            for found in &result.found_issues {
                ws.issues.record_issue(phase_id.as_str(), phase_index, found, now);
            }
            let final_keys: Vec<IssueKey> = result
                .found_issues
                .iter()
                .map(|issue| issue_tracker::issue_key_for(&issue.category, &issue.message))
                .collect();

            // An issue seen in an earlier submission for this phase and absent
            // from this one is resolved, regardless of this submission's verdict.
            let resolved: Vec<(IssueKey, String)> =
                prior_keys.into_iter().filter(|(key, _)| !final_keys.contains(key)).collect();
            for (key, _) in &resolved {
                ws.issues.mark_resolved(key);
            }

            let defaults = ws
                .run
                .compiled_strategy_ref
                .category_policy
                .get(&ws.phases[phase_id].task_category)
                .cloned();
            let minor_tolerance = defaults.map(|d| d.minor_issue_tolerance).unwrap_or(0);
            let clears = result.clears_gate(minor_tolerance);

            if clears {
                let (task_category, scope_paths) = {
                    let phase = &ws.phases[phase_id];
                    (phase.task_category, phase.scope_paths.clone())
                };
                for (source_key, category) in resolved {
                    let hint = learned_rules::record_run_hint(
                        HintId::new(uuid::Uuid::new_v4().to_string()),
                        phase_id.as_str(),
                        task_category,
                        scope_paths.clone(),
                        vec![source_key],
                        &category,
                        now,
                    );
                    ws.hints.push(hint);
                }

                {
                    let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                    phase.state = PhaseState::Gate;
                }
                ws.run.advance(RunState::Gate, Some("phase gate cleared")).map_err(illegal(run_id))?;
                ws.run.advance(RunState::CiRunning, Some("ci required")).map_err(illegal(run_id))?;

                let branch = ws.run.integration_branch.clone();
                let ci_profile = defaults.map(|d| d.ci_profile).unwrap_or(CiProfile::Normal);
                self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, &ws.phases[phase_id])?;
                self.file_layout.write_run_summary(&ws.run)?;
                Some((branch, ci_profile, tier_id))
            } else {
                let phase_failed = {
                    let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                    let failed = phase.builder_attempts >= phase.phase_budgets.max_builder_attempts
                        && phase.auditor_attempts >= phase.phase_budgets.max_auditor_attempts;
                    if failed {
                        phase.state = PhaseState::Failed;
                        phase.last_failure_reason = Some("rejected after exhausting builder/auditor attempts".into());
                    }
                    failed
                };
                self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, &ws.phases[phase_id])?;
                if phase_failed {
                    self.advance_after_phase_terminal(ws, run_id, projects)?;
                }
                None
            }
        };

        let Some((branch, ci_profile, tier_id)) = ci_plan else { return Ok(()) };
        let outcome = self.ci.run(&branch, ci_profile, DEFAULT_CI_TIMEOUT).await?;

        let mut state = self.state.lock().await;
        let SupervisorState { projects, runs } = &mut *state;
        let ws = runs.get_mut(run_id).ok_or_else(|| unknown_run(run_id))?;
        ws.last_ci_verdict = Some(outcome.verdict);
        let now = chrono::Utc::now();
        let phase_index = ws.phases.get(phase_id).map(|p| p.index).unwrap_or(0);
        for issue in &outcome.issues {
            ws.issues.record_issue(phase_id.as_str(), phase_index, issue, now);
        }

        if outcome.verdict == Verdict::Green {
            let commit = self.git.tag_commit(&branch, phase_id.as_str(), "phase gate: ci green").await?;
            ws.commits.push(commit);
            {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                tracing::info!(phase_id = %phase_id, "phase complete: ci green");
                phase.state = PhaseState::Complete;
            }
            ws.budget.complete_phase();
            ws.run.tokens_used = ws.budget.run_tokens_used();
            ws.run.phases_used = ws.budget.run_phases_used();
            if let Some(tier) = ws.tiers.get_mut(&tier_id) {
                tier.state = TierState::InProgress;
            }
            ws.run.advance(RunState::PhaseQueueing, Some("ci green")).map_err(illegal(run_id))?;
            self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, &ws.phases[phase_id])?;
            self.advance_after_phase_terminal(ws, run_id, projects)?;
        } else {
            {
                let phase = ws.phases.get_mut(phase_id).ok_or_else(|| unknown_phase(phase_id))?;
                tracing::warn!(phase_id = %phase_id, verdict = ?outcome.verdict, "phase failed: ci red");
                phase.state = PhaseState::Failed;
                phase.last_failure_reason = Some(format!("ci verdict {:?}", outcome.verdict));
            }
            ws.run.advance(RunState::DoneFailedCi, Some("ci red after retries")).map_err(illegal(run_id))?;
            self.file_layout.write_phase(ws.run.project_id.as_str(), run_id, &ws.phases[phase_id])?;
            self.file_layout.write_run_summary(&ws.run)?;
        }
        Ok(())
    }

    /// `GetIntegrationStatus(run_id) -> {branch, commits, ci_profile,
    /// last_ci_verdict?}`.
    pub async fn get_integration_status(&self, run_id: &RunId) -> Result<IntegrationStatus> {
        let state = self.state.lock().await;
        let ws = state.runs.get(run_id).ok_or_else(|| unknown_run(run_id))?;
        let ci_profile = ws
            .phases
            .values()
            .find(|p| !p.state.is_terminal())
            .and_then(|p| ws.run.compiled_strategy_ref.category_policy.get(&p.task_category))
            .map(|d| d.ci_profile)
            .unwrap_or(CiProfile::Normal);
        Ok(IntegrationStatus {
            branch: ws.run.integration_branch.clone(),
            commits: ws.commits.clone(),
            ci_profile,
            last_ci_verdict: ws.last_ci_verdict,
        })
    }

    /// Called once a Phase reaches a terminal state: schedules the next
    /// Phase/Tier, or finishes the Run (OnRunComplete aging + promotion)
    /// when none remain.
    fn advance_after_phase_terminal(
        &self,
        ws: &mut RunWorkspace,
        run_id: &RunId,
        projects: &mut HashMap<String, ProjectState>,
    ) -> Result<()> {
        let tier_id = ws.run.tier_ids_in_order.get(ws.run.active_tier_index).cloned();
        let Some(tier_id) = tier_id else { return Ok(()) };
        let tier_phase_ids = ws.tiers[&tier_id].phase_ids_in_order.clone();

        let tier_has_failure = tier_phase_ids.iter().any(|id| ws.phases[id].state == PhaseState::Failed);
        if tier_has_failure {
            if let Some(tier) = ws.tiers.get_mut(&tier_id) {
                tier.state = TierState::Failed;
            }
            ws.run.advance(RunState::DoneFailedPolicy, Some("tier failed: unrecovered phase")).map_err(illegal(run_id))?;
            self.file_layout.write_run_summary(&ws.run)?;
            return Ok(());
        }

        let tier_done = tier_phase_ids.iter().all(|id| ws.phases[id].state.is_terminal());
        if !tier_done {
            return Ok(());
        }
        if let Some(tier) = ws.tiers.get_mut(&tier_id) {
            tier.state = TierState::Complete;
        }
        ws.run.active_tier_index += 1;

        if ws.run.active_tier_index >= ws.run.tier_ids_in_order.len() {
            self.finish_run(ws, run_id, projects)?;
        }
        Ok(())
    }

    /// `OnRunComplete(run_id)` folded into the terminal transition: ages
    /// the project backlog and promotes/deprecates learned rules. `run_tick`
    /// is the project's monotonic completed-run counter, incremented here —
    /// the single authoritative source for rule promotion/staleness math.
    fn finish_run(&self, ws: &mut RunWorkspace, run_id: &RunId, projects: &mut HashMap<String, ProjectState>) -> Result<()> {
        ws.run.advance(RunState::SnapshotCreated, Some("all tiers complete")).map_err(illegal(run_id))?;
        ws.run.advance(RunState::DoneSuccess, Some("run complete")).map_err(illegal(run_id))?;

        let project_id = ws.run.project_id.clone();
        let mut backlog = self.file_layout.read_project_backlog(project_id.as_str())?;
        issue_tracker::on_run_complete(
            &mut backlog,
            run_id.as_str(),
            ws.issues.run_issue_index(),
            ws.run.safety_profile,
            ws.run.compiled_strategy_ref.aging_threshold,
        );
        self.file_layout.write_project_backlog(project_id.as_str(), &backlog)?;

        let run_tick = match projects.get_mut(project_id.as_str()) {
            Some(project) => {
                project.run_tick += 1;
                project.run_tick
            }
            None => 1,
        };

        let mut rules = self.file_layout.read_project_learned_rules(project_id.as_str())?;
        learned_rules::promote_hints_to_rules(&ws.hints, &mut rules, ws.run.compiled_strategy_ref.promotion_threshold, run_tick, chrono::Utc::now(), || {
            RuleId::new(uuid::Uuid::new_v4().to_string())
        });
        learned_rules::deprecate_stale_rules(&mut rules, run_tick, ws.run.compiled_strategy_ref.aging_threshold);
        self.file_layout.write_project_learned_rules(project_id.as_str(), &rules)?;

        self.file_layout.write_run_issue_index(project_id.as_str(), run_id, ws.issues.run_issue_index())?;
        self.file_layout.write_run_rule_hints(project_id.as_str(), run_id, &ws.hints)?;
        self.file_layout.write_run_summary(&ws.run)?;
        Ok(())
    }

    pub async fn project_backlog(&self, project_id: &ProjectId) -> Result<ProjectIssueBacklog> {
        self.file_layout.read_project_backlog(project_id.as_str())
    }

    /// Ids of every Run currently held in memory, in no particular order.
    /// Backs the `GET /metrics/runs` surface, which has no `run_id` filter.
    pub async fn list_run_ids(&self) -> Vec<RunId> {
        let state = self.state.lock().await;
        state.runs.keys().cloned().collect()
    }
}

fn illegal(run_id: &RunId) -> impl Fn((RunState, RunState)) -> AutopackError + '_ {
    move |(from, to)| AutopackError::IllegalTransition { run_id: run_id.clone(), from: from.to_string(), to: to.to_string() }
}

fn charge_phase(ws: &mut RunWorkspace, tier_id: &TierId, phase_id: &PhaseId, tokens: u64, wallclock_delta_ms: u64, attempts_delta: u32) -> Result<()> {
    let charge = Charge { tokens, wallclock_delta_ms, attempts_delta };
    match ws.budget.charge(tier_id, phase_id, charge) {
        Ok(()) => {
            if let Some(phase) = ws.phases.get_mut(phase_id) {
                phase.tokens_used += tokens;
            }
            if let Some(tier) = ws.tiers.get_mut(tier_id) {
                tier.tokens_used += tokens;
            }
            ws.run.tokens_used = ws.budget.run_tokens_used();
            Ok(())
        }
        Err(err) => {
            ws.run.tokens_used = ws.budget.run_tokens_used();
            if matches!(err, AutopackError::BudgetExceeded { scope: "run", .. }) {
                let _ = ws.run.advance(RunState::DoneFailedBudget, Some("run budget exceeded"));
            } else if let Some(phase) = ws.phases.get_mut(phase_id) {
                phase.state = PhaseState::Failed;
                phase.last_failure_reason = Some(err.to_string());
            }
            Err(err)
        }
    }
}

fn unknown_run(run_id: &RunId) -> AutopackError {
    AutopackError::Unknown { kind: "run", id: run_id.to_string() }
}

fn unknown_phase(phase_id: &PhaseId) -> AutopackError {
    AutopackError::Unknown { kind: "phase", id: phase_id.to_string() }
}

/// `QUEUED -> EXECUTING -> (GATE) -> (CI_RUNNING) -> COMPLETE/FAILED/SKIPPED`.
fn is_legal_phase_transition(from: PhaseState, to: PhaseState) -> bool {
    use PhaseState::*;
    if from.is_terminal() {
        return false;
    }
    if to == Failed {
        return true;
    }
    matches!(
        (from, to),
        (Queued, Executing)
            | (Queued, Skipped)
            | (Executing, Gate)
            | (Executing, Skipped)
            | (Gate, CiRunning)
            | (Gate, Complete)
            | (CiRunning, Complete)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci_gate::FixedVerdictCIGate;
    use crate::contracts::{AuditorVerdict, ProbeResult};
    use crate::git_adapter::NullGitAdapter;
    use crate::model::{AuditorStrictness, CategoryDefaults};
    use std::collections::HashMap as StdHashMap;

    fn sample_ruleset() -> ProjectRuleset {
        let mut categories = StdHashMap::new();
        for category in TaskCategory::ALL {
            categories.insert(
                *category,
                CategoryDefaults {
                    phase_token_cap_low: 100_000,
                    phase_token_cap_medium: 200_000,
                    phase_token_cap_high: 400_000,
                    max_builder_attempts: 3,
                    max_auditor_attempts: 3,
                    ci_profile: CiProfile::Normal,
                    auditor_strictness: AuditorStrictness::Standard,
                    minor_issue_tolerance: 2,
                },
            );
        }
        ProjectRuleset {
            project_id: "alpha".into(),
            categories,
            run_token_cap_ceiling: 5_000_000,
            aging_threshold_normal: 5,
            aging_threshold_safety_critical: 2,
            promotion_threshold: 2,
            rule_staleness_runs: 10,
        }
    }

    fn sample_request() -> StartRunRequest {
        StartRunRequest {
            project_id: ProjectId::from("alpha"),
            stack_profile: "rust service".into(),
            safety_profile: SafetyProfile::Normal,
            requested_token_cap: 1_000_000,
            requested_max_phases: 10,
            tiers: vec![TierSpec {
                name: "foundation".into(),
                phases: vec![PhaseSpec {
                    name: "scaffold".into(),
                    task_category: TaskCategory::FeatureScaffolding,
                    complexity: Complexity::Low,
                    builder_mode: BuilderMode::Compose,
                    scope_paths: vec!["src/**".into()],
                    read_only_context_paths: vec![],
                    acceptance_criteria: vec!["compiles".into()],
                }],
            }],
        }
    }

    async fn new_supervisor(dir: &std::path::Path) -> Supervisor<NullGitAdapter, FixedVerdictCIGate> {
        let supervisor = Supervisor::new(Arc::new(NullGitAdapter::new()), Arc::new(FixedVerdictCIGate::green()), FileLayout::new(dir));
        supervisor.register_project(sample_ruleset()).await;
        supervisor
    }

    fn builder_result(run_id: &RunId, phase_id: &PhaseId, file: &str) -> BuilderResult {
        BuilderResult {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index: 1,
            patch: format!("diff --git a/{file} b/{file}\n+++ b/{file}\n@@ -0,0 +1 @@\n+hi\n").into_bytes(),
            proposed_files: vec![file.to_string()],
            tokens_used: 10_000,
            probe_results: vec![ProbeResult { probe_id: "compile".into(), passed: true, detail: None }],
            suggested_issues: vec![],
            model_label: "builder-v1".into(),
            elapsed_ms: 500,
        }
    }

    fn auditor_accept(run_id: &RunId, phase_id: &PhaseId) -> AuditorResult {
        AuditorResult {
            run_id: run_id.to_string(),
            phase_id: phase_id.to_string(),
            attempt_index: 1,
            verdict: AuditorVerdict::Accept,
            review_notes: "looks good".into(),
            found_issues: vec![],
            suggested_patch: None,
            tokens_used: 2_000,
            elapsed_ms: 100,
        }
    }

    #[tokio::test]
    async fn start_run_materializes_phase_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        let run_id = supervisor.start_run(sample_request()).await.unwrap();
        let view = supervisor.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.state, RunState::PhaseQueueing);
        assert_eq!(view.phases.len(), 1);
        assert_eq!(view.phases[0].state, PhaseState::Queued);
    }

    #[tokio::test]
    async fn happy_path_single_phase_run_reaches_done_success() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        let run_id = supervisor.start_run(sample_request()).await.unwrap();
        let view = supervisor.get_run(&run_id).await.unwrap();
        let phase_id = view.phases[0].phase_id.clone();

        supervisor.submit_builder_result(&run_id, &phase_id, builder_result(&run_id, &phase_id, "src/lib.rs")).await.unwrap();
        let _request = supervisor.request_auditor_review(&run_id, &phase_id).await.unwrap();
        supervisor.submit_auditor_result(&run_id, &phase_id, auditor_accept(&run_id, &phase_id)).await.unwrap();

        let view = supervisor.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.state, RunState::DoneSuccess);
        assert_eq!(view.phases[0].state, PhaseState::Complete);
    }

    #[tokio::test]
    async fn scope_violation_is_rejected_without_failing_the_phase() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        let run_id = supervisor.start_run(sample_request()).await.unwrap();
        let view = supervisor.get_run(&run_id).await.unwrap();
        let phase_id = view.phases[0].phase_id.clone();

        let err = supervisor
            .submit_builder_result(&run_id, &phase_id, builder_result(&run_id, &phase_id, "docs/out_of_scope.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, AutopackError::ScopeViolation { .. }));

        let view = supervisor.get_run(&run_id).await.unwrap();
        assert_ne!(view.phases[0].state, PhaseState::Failed);
    }

    #[tokio::test]
    async fn ci_red_sinks_run_to_done_failed_ci() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(Arc::new(NullGitAdapter::new()), Arc::new(FixedVerdictCIGate::red(vec![])), FileLayout::new(dir.path()));
        supervisor.register_project(sample_ruleset()).await;
        let run_id = supervisor.start_run(sample_request()).await.unwrap();
        let view = supervisor.get_run(&run_id).await.unwrap();
        let phase_id = view.phases[0].phase_id.clone();

        supervisor.submit_builder_result(&run_id, &phase_id, builder_result(&run_id, &phase_id, "src/lib.rs")).await.unwrap();
        supervisor.submit_auditor_result(&run_id, &phase_id, auditor_accept(&run_id, &phase_id)).await.unwrap();

        let view = supervisor.get_run(&run_id).await.unwrap();
        assert_eq!(view.run.state, RunState::DoneFailedCi);
    }

    #[tokio::test]
    async fn attempts_exhausted_fails_phase_and_tier() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = new_supervisor(dir.path()).await;
        let run_id = supervisor.start_run(sample_request()).await.unwrap();
        let view = supervisor.get_run(&run_id).await.unwrap();
        let phase_id = view.phases[0].phase_id.clone();

        let reject = AuditorResult {
            verdict: AuditorVerdict::Reject,
            ..auditor_accept(&run_id, &phase_id)
        };

        for _ in 0..3 {
            supervisor.submit_builder_result(&run_id, &phase_id, builder_result(&run_id, &phase_id, "src/lib.rs")).await.unwrap();
            let _ = supervisor.submit_auditor_result(&run_id, &phase_id, reject.clone()).await;
        }

        let view = supervisor.get_run(&run_id).await.unwrap();
        assert_eq!(view.phases[0].state, PhaseState::Failed);
        assert_eq!(view.run.state, RunState::DoneFailedPolicy);
    }

    #[test]
    fn phase_transition_table_matches_sub_loop_shape() {
        use PhaseState::*;
        assert!(is_legal_phase_transition(Queued, Executing));
        assert!(is_legal_phase_transition(Executing, Gate));
        assert!(is_legal_phase_transition(Gate, CiRunning));
        assert!(is_legal_phase_transition(CiRunning, Complete));
        assert!(!is_legal_phase_transition(Queued, Complete));
        assert!(is_legal_phase_transition(Executing, Failed));
        assert!(!is_legal_phase_transition(Complete, Executing));
    }
}
