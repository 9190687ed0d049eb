//! ControlPlane — the thin request/response layer over the Supervisor
//! (§4.8). Owns no business logic: every operation here validates a typed
//! request (`serde`, `deny_unknown_fields`) and forwards to the matching
//! `Supervisor` method, then projects the result into a response DTO that
//! implements `schemars::JsonSchema` for the same documentation purpose the
//! pack's specialist-response structs use `schemars` for.
//!
//! This mirrors the pack's control-plane/API-layer split: the Supervisor is
//! the engine, ControlPlane is the closed set of operations a caller is
//! allowed to invoke, one method per §6.2 entry.

use crate::ci_gate::{CIGate, Verdict};
use crate::contracts::{AuditorRequest, AuditorResult, BuilderResult};
use crate::error::Result;
use crate::git_adapter::GitAdapter;
use crate::issue_tracker;
use crate::model::{
    BacklogSnapshot, BuilderMode, CiProfile, Complexity, IssueSource, Phase, PhaseId, PhaseState,
    ProjectId, ProjectRuleset, Run, RunId, RunState, SafetyProfile, Severity, TaskCategory, Tier,
    TierState,
};
use crate::supervisor::{IntegrationStatus, PhaseSpec, PhaseStatusUpdate, StartRunRequest, Supervisor, TierSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `POST /runs/start` body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StartRunBody {
    pub project_id: String,
    pub stack_profile: String,
    pub safety_profile: SafetyProfile,
    pub requested_token_cap: u64,
    pub requested_max_phases: u32,
    pub tiers: Vec<TierBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TierBody {
    pub name: String,
    pub phases: Vec<PhaseBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PhaseBody {
    pub name: String,
    pub task_category: TaskCategory,
    pub complexity: Complexity,
    pub builder_mode: BuilderMode,
    pub scope_paths: Vec<String>,
    #[serde(default)]
    pub read_only_context_paths: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl From<StartRunBody> for StartRunRequest {
    fn from(body: StartRunBody) -> Self {
        StartRunRequest {
            project_id: ProjectId::from(body.project_id),
            stack_profile: body.stack_profile,
            safety_profile: body.safety_profile,
            requested_token_cap: body.requested_token_cap,
            requested_max_phases: body.requested_max_phases,
            tiers: body.tiers.into_iter().map(TierSpec::from).collect(),
        }
    }
}

impl From<TierBody> for TierSpec {
    fn from(body: TierBody) -> Self {
        TierSpec { name: body.name, phases: body.phases.into_iter().map(PhaseSpec::from).collect() }
    }
}

impl From<PhaseBody> for PhaseSpec {
    fn from(body: PhaseBody) -> Self {
        PhaseSpec {
            name: body.name,
            task_category: body.task_category,
            complexity: body.complexity,
            builder_mode: body.builder_mode,
            scope_paths: body.scope_paths,
            read_only_context_paths: body.read_only_context_paths,
            acceptance_criteria: body.acceptance_criteria,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRunResponse {
    pub run_id: String,
}

/// `GET /runs/{run_id}` response: the full state view (§3.3 `RunView`
/// ownership note — a serializable snapshot, never a handle into the live
/// stores).
#[derive(Debug, Clone, Serialize)]
pub struct RunDetailResponse {
    pub run: Run,
    pub tiers: Vec<Tier>,
    pub phases: Vec<Phase>,
}

/// `POST /runs/{run_id}/phases/{phase_id}/update_status` body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdatePhaseStatusBody {
    pub state: PhaseState,
    #[serde(default)]
    pub tokens_delta: Option<u64>,
    #[serde(default)]
    pub evidence: Option<String>,
}

impl From<UpdatePhaseStatusBody> for PhaseStatusUpdate {
    fn from(body: UpdatePhaseStatusBody) -> Self {
        PhaseStatusUpdate { state: body.state, tokens_delta: body.tokens_delta, evidence: body.evidence }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

/// `GET /runs/{run_id}/integration_status` response. `Verdict` (from
/// `ci_gate`) carries no serde impl since it is a pure in-process enum, so
/// this projects it to the lowercase strings the wire contract uses
/// elsewhere (`"green" | "red" | "flaky"`).
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStatusResponse {
    pub branch: String,
    pub commits: Vec<String>,
    pub ci_profile: CiProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ci_verdict: Option<String>,
}

impl From<IntegrationStatus> for IntegrationStatusResponse {
    fn from(status: IntegrationStatus) -> Self {
        Self {
            branch: status.branch,
            commits: status.commits,
            ci_profile: status.ci_profile,
            last_ci_verdict: status.last_ci_verdict.map(verdict_label),
        }
    }
}

fn verdict_label(verdict: Verdict) -> String {
    match verdict {
        Verdict::Green => "green",
        Verdict::Red => "red",
        Verdict::Flaky => "flaky",
    }
    .to_string()
}

/// `GET /project/{project_id}/issues/backlog` response.
pub type ProjectBacklogResponse = BacklogSnapshot;

/// §6.4 per-run metrics shape: `{state, tokens_used/run_token_cap,
/// phases_used, ci_runs, issue_counts_by_severity}`.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub state: RunState,
    pub tokens_used: u64,
    pub run_token_cap: u64,
    pub phases_used: u32,
    pub ci_runs: u32,
    pub issue_counts_by_severity: IssueCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueCounts {
    pub minor: u32,
    pub major: u32,
}

/// §6.4 per-tier metrics shape: `{state, phase_state_histogram,
/// budget_utilization}`.
#[derive(Debug, Clone, Serialize)]
pub struct TierMetrics {
    pub tier_id: String,
    pub name: String,
    pub state: TierState,
    pub phase_state_histogram: PhaseStateHistogram,
    pub budget_utilization: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStateHistogram {
    pub queued: u32,
    pub executing: u32,
    pub gate: u32,
    pub ci_running: u32,
    pub complete: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// `GET /reports/run_summary/{run_id}` response: a flattened human/operator
/// report, distinct from the raw `RunDetailResponse` state dump.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummaryReport {
    pub run_id: String,
    pub project_id: String,
    pub state: RunState,
    pub tiers_total: u32,
    pub tiers_complete: u32,
    pub phases_total: u32,
    pub phases_complete: u32,
    pub phases_failed: u32,
    pub metrics: RunMetrics,
}

/// The closed set of operations over one `Supervisor`. Holds no state of its
/// own beyond the `Supervisor` it wraps — every field here is a capability
/// the process wires once at startup (see `main.rs`).
pub struct ControlPlane<G: GitAdapter, C: CIGate> {
    supervisor: Supervisor<G, C>,
}

impl<G: GitAdapter, C: CIGate> ControlPlane<G, C> {
    pub fn new(supervisor: Supervisor<G, C>) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor<G, C> {
        &self.supervisor
    }

    /// Ambient wiring, not itself a §6.2 operation: registers a project's
    /// compiled ruleset before any run for that project starts.
    pub async fn register_project(&self, ruleset: ProjectRuleset) {
        self.supervisor.register_project(ruleset).await;
    }

    /// `POST /runs/start`.
    pub async fn start_run(&self, body: StartRunBody) -> Result<StartRunResponse> {
        let run_id = self.supervisor.start_run(body.into()).await?;
        tracing::info!(run_id = %run_id, "control plane: run started");
        Ok(StartRunResponse { run_id: run_id.to_string() })
    }

    /// `GET /runs/{run_id}`.
    pub async fn get_run(&self, run_id: &str) -> Result<RunDetailResponse> {
        let view = self.supervisor.get_run(&RunId::from(run_id)).await?;
        Ok(RunDetailResponse { run: view.run, tiers: view.tiers, phases: view.phases })
    }

    /// `POST /runs/{run_id}/phases/{phase_id}/update_status`.
    pub async fn update_phase_status(&self, run_id: &str, phase_id: &str, body: UpdatePhaseStatusBody) -> Result<AckResponse> {
        self.supervisor
            .update_phase_status(&RunId::from(run_id), &PhaseId::from(phase_id), body.into())
            .await?;
        Ok(AckResponse { ok: true })
    }

    /// `POST /runs/{run_id}/phases/{phase_id}/builder_result`.
    pub async fn builder_result(&self, run_id: &str, phase_id: &str, body: BuilderResult) -> Result<AckResponse> {
        self.supervisor.submit_builder_result(&RunId::from(run_id), &PhaseId::from(phase_id), body).await?;
        Ok(AckResponse { ok: true })
    }

    /// `POST /runs/{run_id}/phases/{phase_id}/auditor_request`.
    pub async fn auditor_request(&self, run_id: &str, phase_id: &str) -> Result<AuditorRequest> {
        self.supervisor.request_auditor_review(&RunId::from(run_id), &PhaseId::from(phase_id)).await
    }

    /// `POST /runs/{run_id}/phases/{phase_id}/auditor_result`.
    pub async fn auditor_result(&self, run_id: &str, phase_id: &str, body: AuditorResult) -> Result<AckResponse> {
        self.supervisor.submit_auditor_result(&RunId::from(run_id), &PhaseId::from(phase_id), body).await?;
        Ok(AckResponse { ok: true })
    }

    /// `GET /runs/{run_id}/integration_status`.
    pub async fn get_integration_status(&self, run_id: &str) -> Result<IntegrationStatusResponse> {
        let status = self.supervisor.get_integration_status(&RunId::from(run_id)).await?;
        Ok(status.into())
    }

    /// `GET /project/{project_id}/issues/backlog`.
    pub async fn get_project_backlog(&self, project_id: &str) -> Result<ProjectBacklogResponse> {
        let backlog = self.supervisor.project_backlog(&ProjectId::from(project_id)).await?;
        Ok(issue_tracker::project_backlog_snapshot(project_id, &backlog))
    }

    /// `GET /metrics/runs` — computed on demand from the live Run/Phase
    /// stores for every run currently held in memory; no separate metrics
    /// pipeline, per the non-goal on telemetry shippers.
    pub async fn metrics_runs(&self) -> Result<Vec<RunMetrics>> {
        let mut out = Vec::new();
        for run_id in self.supervisor.list_run_ids().await {
            out.push(self.run_metrics(&run_id).await?);
        }
        Ok(out)
    }

    /// `GET /metrics/tiers/{run_id}`.
    pub async fn metrics_tiers(&self, run_id: &str) -> Result<Vec<TierMetrics>> {
        let view = self.supervisor.get_run(&RunId::from(run_id)).await?;
        Ok(view
            .tiers
            .into_iter()
            .map(|tier| {
                let histogram = phase_state_histogram(&view.phases, &tier.tier_id);
                let budget_utilization = if tier.tier_budgets.token_cap == 0 {
                    0.0
                } else {
                    tier.tokens_used as f64 / tier.tier_budgets.token_cap as f64
                };
                TierMetrics {
                    tier_id: tier.tier_id.to_string(),
                    name: tier.name,
                    state: tier.state,
                    phase_state_histogram: histogram,
                    budget_utilization,
                }
            })
            .collect())
    }

    /// `GET /reports/run_summary/{run_id}`.
    pub async fn report_run_summary(&self, run_id: &str) -> Result<RunSummaryReport> {
        let view = self.supervisor.get_run(&RunId::from(run_id)).await?;
        let metrics = self.run_metrics(&RunId::from(run_id)).await?;
        let tiers_complete = view.tiers.iter().filter(|t| t.state == TierState::Complete).count() as u32;
        let phases_complete = view.phases.iter().filter(|p| p.state == PhaseState::Complete).count() as u32;
        let phases_failed = view.phases.iter().filter(|p| p.state == PhaseState::Failed).count() as u32;
        Ok(RunSummaryReport {
            run_id: run_id.to_string(),
            project_id: view.run.project_id.to_string(),
            state: view.run.state,
            tiers_total: view.tiers.len() as u32,
            tiers_complete,
            phases_total: view.phases.len() as u32,
            phases_complete,
            phases_failed,
            metrics,
        })
    }

    async fn run_metrics(&self, run_id: &RunId) -> Result<RunMetrics> {
        let view = self.supervisor.get_run(run_id).await?;
        let mut issue_counts = IssueCounts::default();
        for phase in &view.phases {
            for issue in &phase.issues {
                match issue.severity {
                    Severity::Minor => issue_counts.minor += 1,
                    Severity::Major => issue_counts.major += 1,
                }
            }
        }
        let ci_runs = view
            .phases
            .iter()
            .filter(|p| matches!(p.state, PhaseState::Complete | PhaseState::Failed))
            .filter(|p| p.issues.iter().any(|i| i.source == IssueSource::Ci) || p.state == PhaseState::Complete)
            .count() as u32;
        Ok(RunMetrics {
            run_id: run_id.to_string(),
            state: view.run.state,
            tokens_used: view.run.tokens_used,
            run_token_cap: view.run.budgets_snapshot.run_token_cap,
            phases_used: view.run.phases_used,
            ci_runs,
            issue_counts_by_severity: issue_counts,
        })
    }
}

fn phase_state_histogram(phases: &[Phase], tier_id: &crate::model::TierId) -> PhaseStateHistogram {
    let mut histogram = PhaseStateHistogram::default();
    for phase in phases.iter().filter(|p| &p.tier_id == tier_id) {
        match phase.state {
            PhaseState::Queued => histogram.queued += 1,
            PhaseState::Executing => histogram.executing += 1,
            PhaseState::Gate => histogram.gate += 1,
            PhaseState::CiRunning => histogram.ci_running += 1,
            PhaseState::Complete => histogram.complete += 1,
            PhaseState::Failed => histogram.failed += 1,
            PhaseState::Skipped => histogram.skipped += 1,
        }
    }
    histogram
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci_gate::FixedVerdictCIGate;
    use crate::file_layout::FileLayout;
    use crate::git_adapter::NullGitAdapter;
    use crate::model::{AuditorStrictness, CategoryDefaults};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ruleset() -> ProjectRuleset {
        let mut categories = HashMap::new();
        for category in TaskCategory::ALL {
            categories.insert(
                *category,
                CategoryDefaults {
                    phase_token_cap_low: 10_000,
                    phase_token_cap_medium: 20_000,
                    phase_token_cap_high: 40_000,
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
            run_token_cap_ceiling: 1_000_000,
            aging_threshold_normal: 5,
            aging_threshold_safety_critical: 2,
            promotion_threshold: 2,
            rule_staleness_runs: 5,
        }
    }

    fn start_body() -> StartRunBody {
        StartRunBody {
            project_id: "alpha".into(),
            stack_profile: "rust-service".into(),
            safety_profile: SafetyProfile::Normal,
            requested_token_cap: 500_000,
            requested_max_phases: 3,
            tiers: vec![TierBody {
                name: "foundation".into(),
                phases: vec![PhaseBody {
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

    async fn control_plane() -> (ControlPlane<NullGitAdapter, FixedVerdictCIGate>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            Arc::new(NullGitAdapter::new()),
            Arc::new(FixedVerdictCIGate::green()),
            FileLayout::new(dir.path()),
        );
        let cp = ControlPlane::new(supervisor);
        cp.register_project(ruleset()).await;
        (cp, dir)
    }

    #[tokio::test]
    async fn start_run_rejects_unknown_fields_at_the_json_boundary() {
        let json = r#"{"project_id":"alpha","stack_profile":"x","safety_profile":"normal","requested_token_cap":1,"requested_max_phases":1,"tiers":[],"bogus":true}"#;
        let parsed: std::result::Result<StartRunBody, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn start_and_get_run_round_trips_through_the_control_plane() {
        let (cp, _dir) = control_plane().await;
        let started = cp.start_run(start_body()).await.unwrap();
        let detail = cp.get_run(&started.run_id).await.unwrap();
        assert_eq!(detail.run.state, RunState::PhaseQueueing);
        assert_eq!(detail.tiers.len(), 1);
        assert_eq!(detail.phases.len(), 1);
    }

    #[tokio::test]
    async fn full_phase_loop_drives_metrics_and_summary_report() {
        let (cp, _dir) = control_plane().await;
        let started = cp.start_run(start_body()).await.unwrap();
        let detail = cp.get_run(&started.run_id).await.unwrap();
        let phase_id = detail.phases[0].phase_id.to_string();

        let builder = BuilderResult {
            run_id: started.run_id.clone(),
            phase_id: phase_id.clone(),
            attempt_index: 1,
            patch: b"diff --git a/src/lib.rs b/src/lib.rs\n+++ b/src/lib.rs\n@@ -0,0 +1 @@\n+fn x() {}\n".to_vec(),
            proposed_files: vec!["src/lib.rs".into()],
            tokens_used: 100,
            probe_results: vec![],
            suggested_issues: vec![],
            model_label: "builder-v1".into(),
            elapsed_ms: 10,
        };
        cp.builder_result(&started.run_id, &phase_id, builder).await.unwrap();

        let auditor = AuditorResult {
            run_id: started.run_id.clone(),
            phase_id: phase_id.clone(),
            attempt_index: 1,
            verdict: crate::contracts::AuditorVerdict::Accept,
            review_notes: "looks good".into(),
            found_issues: vec![],
            suggested_patch: None,
            tokens_used: 50,
            elapsed_ms: 5,
        };
        cp.auditor_result(&started.run_id, &phase_id, auditor).await.unwrap();

        let report = cp.report_run_summary(&started.run_id).await.unwrap();
        assert_eq!(report.state, RunState::DoneSuccess);
        assert_eq!(report.phases_complete, 1);
        assert_eq!(report.metrics.phases_used, 1);

        let tier_metrics = cp.metrics_tiers(&started.run_id).await.unwrap();
        assert_eq!(tier_metrics[0].phase_state_histogram.complete, 1);

        let run_metrics = cp.metrics_runs().await.unwrap();
        assert_eq!(run_metrics.len(), 1);
        assert_eq!(run_metrics[0].state, RunState::DoneSuccess);
    }

    #[tokio::test]
    async fn project_backlog_is_empty_for_a_fresh_project() {
        let (cp, _dir) = control_plane().await;
        let backlog = cp.get_project_backlog("alpha").await.unwrap();
        assert!(backlog.entries.is_empty());
        assert_eq!(backlog.project_id, "alpha");
    }
}
