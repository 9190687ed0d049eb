//! End-to-end scenario: a run's token budget is exhausted mid-run, on the
//! second of two phases. Exercises the Supervisor through the same public
//! surface a real Builder/Auditor loop would use.

use autopack_core::ci_gate::FixedVerdictCIGate;
use autopack_core::contracts::{AuditorResult, AuditorVerdict, BuilderResult, ProbeResult};
use autopack_core::file_layout::FileLayout;
use autopack_core::git_adapter::NullGitAdapter;
use autopack_core::model::{
    AuditorStrictness, BuilderMode, CategoryDefaults, CiProfile, Complexity, ProjectId,
    ProjectRuleset, RunState, SafetyProfile, TaskCategory,
};
use autopack_core::supervisor::{PhaseSpec, StartRunRequest, Supervisor, TierSpec};
use std::collections::HashMap;
use std::sync::Arc;

fn ruleset() -> ProjectRuleset {
    let mut categories = HashMap::new();
    for category in TaskCategory::ALL {
        categories.insert(
            *category,
            CategoryDefaults {
                phase_token_cap_low: 100_000,
                phase_token_cap_medium: 200_000,
                phase_token_cap_high: 400_000,
                max_builder_attempts: 2,
                max_auditor_attempts: 2,
                ci_profile: CiProfile::Normal,
                auditor_strictness: AuditorStrictness::Standard,
                minor_issue_tolerance: 0,
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

fn builder_result(run_id: &str, phase_id: &str, file: &str, tokens_used: u64) -> BuilderResult {
    BuilderResult {
        run_id: run_id.to_string(),
        phase_id: phase_id.to_string(),
        attempt_index: 1,
        patch: format!("diff --git a/{file} b/{file}\n+++ b/{file}\n@@ -0,0 +1 @@\n+hi\n").into_bytes(),
        proposed_files: vec![file.to_string()],
        tokens_used,
        probe_results: vec![ProbeResult { probe_id: "compile".into(), passed: true, detail: None }],
        suggested_issues: vec![],
        model_label: "builder-v1".into(),
        elapsed_ms: 500,
    }
}

fn auditor_accept(run_id: &str, phase_id: &str) -> AuditorResult {
    AuditorResult {
        run_id: run_id.to_string(),
        phase_id: phase_id.to_string(),
        attempt_index: 1,
        verdict: AuditorVerdict::Accept,
        review_notes: "looks good".into(),
        found_issues: vec![],
        suggested_patch: None,
        tokens_used: 0,
        elapsed_ms: 100,
    }
}

/// Scenario 4: `run_token_cap=300000`, 2 Phases. Phase 1 completes using
/// 250000 tokens. Phase 2's Builder submission reports `tokens_used=80000`.
/// The run-level charge is refused, but the overage is still recorded:
/// `tokens_used` on the Run ends up at 330000, and the Run sinks to
/// `DONE_FAILED_BUDGET`.
#[tokio::test]
async fn budget_exceeded_mid_run_sinks_run_and_records_the_overage() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        Arc::new(NullGitAdapter::new()),
        Arc::new(FixedVerdictCIGate::green()),
        FileLayout::new(dir.path()),
    );
    supervisor.register_project(ruleset()).await;

    let request = StartRunRequest {
        project_id: ProjectId::from("alpha"),
        stack_profile: "rust service".into(),
        safety_profile: SafetyProfile::Normal,
        requested_token_cap: 300_000,
        requested_max_phases: 10,
        tiers: vec![TierSpec {
            name: "foundation".into(),
            phases: vec![
                PhaseSpec {
                    name: "scaffold".into(),
                    task_category: TaskCategory::FeatureScaffolding,
                    complexity: Complexity::High,
                    builder_mode: BuilderMode::Compose,
                    scope_paths: vec!["src/**".into()],
                    read_only_context_paths: vec![],
                    acceptance_criteria: vec![],
                },
                PhaseSpec {
                    name: "polish".into(),
                    task_category: TaskCategory::FeatureEnhancement,
                    complexity: Complexity::Low,
                    builder_mode: BuilderMode::Extend,
                    scope_paths: vec!["src/**".into()],
                    read_only_context_paths: vec![],
                    acceptance_criteria: vec![],
                },
            ],
        }],
    };

    let run_id = supervisor.start_run(request).await.unwrap();
    let view = supervisor.get_run(&run_id).await.unwrap();
    let phase_1 = view.phases[0].phase_id.clone();
    let phase_2 = view.phases[1].phase_id.clone();

    supervisor
        .submit_builder_result(&run_id, &phase_1, builder_result(run_id.as_str(), phase_1.as_str(), "src/lib.rs", 250_000))
        .await
        .unwrap();
    supervisor.submit_auditor_result(&run_id, &phase_1, auditor_accept(run_id.as_str(), phase_1.as_str())).await.unwrap();

    let view = supervisor.get_run(&run_id).await.unwrap();
    assert_eq!(view.run.tokens_used, 250_000);

    let err = supervisor
        .submit_builder_result(&run_id, &phase_2, builder_result(run_id.as_str(), phase_2.as_str(), "src/extra.rs", 80_000))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        autopack_core::AutopackError::BudgetExceeded { scope: "run", .. }
    ));

    let view = supervisor.get_run(&run_id).await.unwrap();
    assert_eq!(view.run.state, RunState::DoneFailedBudget);
    assert_eq!(view.run.tokens_used, 330_000);
}
