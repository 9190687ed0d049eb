//! `OnRunComplete` must not double-count aging when folded into the same
//! project backlog twice for the same `run_id`.

use autopack_core::issue_tracker;
use autopack_core::model::{
    AggregatedIssue, IssueKey, ProjectIssueBacklog, RunIssueIndex, SafetyProfile,
};

#[test]
fn folding_the_same_run_twice_does_not_double_count_age() {
    let mut backlog = ProjectIssueBacklog::default();
    let mut index = RunIssueIndex::default();
    index.entries.insert(
        "key-1".into(),
        AggregatedIssue {
            issue_key: IssueKey::new("key-1"),
            severity: autopack_core::model::Severity::Major,
            category: "security_hardening".into(),
            occurrence_count: 1,
            first_phase_seen: "phase-1".into(),
            is_resolved: false,
        },
    );

    issue_tracker::on_run_complete(&mut backlog, "run-1", &index, SafetyProfile::Normal, 5);
    let age_after_first = backlog.entries["key-1"].age_in_runs;
    let occurrences_after_first = backlog.entries["key-1"].occurrence_count_across_runs;

    issue_tracker::on_run_complete(&mut backlog, "run-1", &index, SafetyProfile::Normal, 5);

    assert_eq!(backlog.entries["key-1"].age_in_runs, age_after_first);
    assert_eq!(backlog.entries["key-1"].occurrence_count_across_runs, occurrences_after_first);
}
