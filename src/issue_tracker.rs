//! Three-level dedup-and-age ledger: Phase -> Run -> Project.
//!
//! `IssueTracker` owns no persistence itself (that's `FileLayout`'s job);
//! it holds the in-memory indices the Supervisor reads and writes during
//! a Run, plus the `issue_key` fingerprinting algorithm.

use crate::model::{
    AggregatedIssue, BacklogEntry, BacklogSnapshot, Issue, IssueKey, IssueSource, PhaseIssue,
    ProjectIssueBacklog, RunIssueIndex, SafetyProfile, Severity,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static PATH_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/|\b[\w.-]+/)[\w./-]*\.\w+").unwrap());
static HEX_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[0-9a-f]{6,}\b").unwrap());
static INTEGER_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").unwrap());

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Normalize a raw issue message so that two textually different failures
/// with the same root cause produce the same string: strip ANSI, lowercase,
/// replace path-like segments with `<path>`, hex runs with `<hex>`, and bare
/// integers with `<n>`, then collapse whitespace.
///
/// Order matters: paths are masked before the generic hex/integer passes so
/// that path components (line numbers, hex-looking directory names) aren't
/// independently substituted first and fragment the path pattern.
pub fn normalize_message(raw: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, "");
    let lowered = stripped.to_lowercase();
    let paths_masked = PATH_SEGMENT.replace_all(&lowered, "<path>");
    let hex_masked = HEX_RUN.replace_all(&paths_masked, "<hex>");
    let ints_masked = INTEGER_RUN.replace_all(&hex_masked, "<n>");
    WHITESPACE_RUN.replace_all(ints_masked.trim(), " ").into_owned()
}

/// Deterministic fingerprint of `(category, normalized_message)`. Uses a
/// fixed-seed FNV-1a rather than `DefaultHasher`, whose output is explicitly
/// not guaranteed stable across process restarts or compiler versions —
/// unacceptable for a key that must collapse identically across runs.
pub fn issue_key_for(category: &str, message: &str) -> IssueKey {
    let normalized = normalize_message(message);
    let input = format!("{category}\0{normalized}");
    IssueKey::new(format!("{:016x}", fnv1a(input.as_bytes())))
}

#[derive(Debug, Default)]
pub struct RunIssueTracker {
    /// Append-only per-phase issue lists, keyed by phase_id string.
    phase_issues: HashMap<String, Vec<PhaseIssue>>,
    run_index: RunIssueIndex,
}

impl RunIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue for a phase. Exact duplicates by `issue_key` within
    /// the phase collapse by incrementing `occurrence_count`.
    pub fn record_issue(
        &mut self,
        phase_id: &str,
        phase_index: u32,
        issue: &Issue,
        now: chrono::DateTime<chrono::Utc>,
    ) -> IssueKey {
        let key = issue_key_for(&issue.category, &issue.message);

        let list = self.phase_issues.entry(phase_id.to_string()).or_default();
        match list.iter_mut().find(|p| p.issue_key == key) {
            Some(existing) => {
                existing.record_recurrence(now);
                tracing::debug!(phase_id, phase_index, issue_key = %key, occurrence_count = existing.occurrence_count, "issue recurrence");
            }
            None => {
                tracing::info!(phase_id, phase_index, issue_key = %key, category = %issue.category, severity = ?issue.severity, "issue recorded");
                list.push(PhaseIssue::from_issue(issue, key.clone(), now));
            }
        }

        let entry = self
            .run_index
            .entries
            .entry(key.as_str().to_string())
            .or_insert_with(|| AggregatedIssue {
                issue_key: key.clone(),
                severity: issue.severity,
                category: issue.category.clone(),
                occurrence_count: 0,
                first_phase_seen: phase_id.to_string(),
                is_resolved: false,
            });
        entry.occurrence_count += 1;
        key
    }

    pub fn phase_issues(&self, phase_id: &str) -> &[PhaseIssue] {
        self.phase_issues.get(phase_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn run_issue_index(&self) -> &RunIssueIndex {
        &self.run_index
    }

    /// Mark `issue_key` resolved. Callers compute resolution by diffing an
    /// earlier phase's recorded issue keys against a later Auditor
    /// submission's issue keys: a key present earlier and absent now is
    /// resolved.
    pub fn mark_resolved(&mut self, issue_key: &IssueKey) {
        if let Some(entry) = self.run_index.entries.get_mut(issue_key.as_str()) {
            entry.is_resolved = true;
        }
    }

    /// Severity classes the aging/backlog queries treat as unresolved work.
    pub fn unresolved_keys(&self) -> impl Iterator<Item = &AggregatedIssue> {
        self.run_index.entries.values().filter(|i| !i.is_resolved)
    }
}

/// Fold a finished run's `RunIssueIndex` into the project's cross-run
/// `ProjectIssueBacklog`. Idempotent: calling twice for the same `run_id`
/// does not double-count, because it's keyed by `runs_seen` membership.
pub fn on_run_complete(
    backlog: &mut ProjectIssueBacklog,
    run_id: &str,
    run_index: &RunIssueIndex,
    safety_profile: SafetyProfile,
    aging_threshold: u32,
) {
    for (key, aggregated) in &run_index.entries {
        let entry = backlog.entries.entry(key.clone()).or_insert_with(|| BacklogEntry {
            issue_key: aggregated.issue_key.clone(),
            occurrence_count_across_runs: 0,
            runs_seen: Vec::new(),
            age_in_runs: 0,
            needs_cleanup: false,
        });

        if entry.runs_seen.contains(&run_id.to_string()) {
            continue;
        }
        entry.runs_seen.push(run_id.to_string());
        entry.occurrence_count_across_runs += 1;

        if aggregated.is_resolved {
            entry.age_in_runs = 0;
        } else {
            entry.age_in_runs += 1;
        }
        let _ = safety_profile;
        entry.needs_cleanup = entry.age_in_runs >= aging_threshold;
    }
}

pub fn project_backlog_snapshot(project_id: &str, backlog: &ProjectIssueBacklog) -> BacklogSnapshot {
    let mut entries: Vec<BacklogEntry> = backlog.entries.values().cloned().collect();
    entries.sort_by(|a, b| b.age_in_runs.cmp(&a.age_in_runs));
    BacklogSnapshot {
        project_id: project_id.to_string(),
        entries,
    }
}

pub fn severity_from_str(s: &str) -> Severity {
    match s {
        "major" => Severity::Major,
        _ => Severity::Minor,
    }
}

pub fn source_from_str(s: &str) -> IssueSource {
    match s {
        "auditor" => IssueSource::Auditor,
        "ci" => IssueSource::Ci,
        "tests" => IssueSource::Tests,
        _ => IssueSource::Builder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into()
    }

    fn issue(category: &str, message: &str) -> Issue {
        Issue {
            issue_key: String::new(),
            severity: Severity::Minor,
            source: IssueSource::Builder,
            category: category.to_string(),
            message: message.to_string(),
            evidence_ref: None,
        }
    }

    #[test]
    fn same_root_cause_collapses_despite_noise() {
        let a = issue_key_for("type_mismatch", "expected String, found i32 at /src/main.rs:42");
        let b = issue_key_for("type_mismatch", "Expected String, found i32 at /src/lib.rs:108");
        assert_eq!(a, b);
    }

    #[test]
    fn different_root_causes_do_not_collapse() {
        let a = issue_key_for("type_mismatch", "expected String, found i32");
        let b = issue_key_for("borrow_checker", "cannot borrow as mutable");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_runs_are_normalized() {
        let a = issue_key_for("panic", "thread panicked at abcdef123456");
        let b = issue_key_for("panic", "thread panicked at fedcba654321");
        assert_eq!(a, b);
    }

    #[test]
    fn exact_duplicates_within_phase_increment_occurrence_count() {
        let mut tracker = RunIssueTracker::new();
        let issue = issue("scope_violation", "file src/core.py not in scope_paths");
        tracker.record_issue("phase-1", 0, &issue, now());
        tracker.record_issue("phase-1", 0, &issue, now());
        let issues = tracker.phase_issues("phase-1");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].occurrence_count, 2);
    }

    #[test]
    fn on_run_complete_is_idempotent() {
        let mut tracker = RunIssueTracker::new();
        let issue = issue("missing_type_hints", "parameter x is missing a type hint");
        tracker.record_issue("phase-1", 0, &issue, now());

        let mut backlog = ProjectIssueBacklog::default();
        on_run_complete(&mut backlog, "run-1", tracker.run_issue_index(), SafetyProfile::Normal, 5);
        on_run_complete(&mut backlog, "run-1", tracker.run_issue_index(), SafetyProfile::Normal, 5);

        let entry = backlog.entries.values().next().unwrap();
        assert_eq!(entry.occurrence_count_across_runs, 1);
        assert_eq!(entry.age_in_runs, 1);
    }

    #[test]
    fn resolved_issue_resets_age_to_zero() {
        let mut backlog = ProjectIssueBacklog::default();
        let mut index = RunIssueIndex::default();
        index.entries.insert(
            "key-1".into(),
            AggregatedIssue {
                issue_key: IssueKey::new("key-1"),
                severity: Severity::Major,
                category: "scope_violation".into(),
                occurrence_count: 1,
                first_phase_seen: "phase-1".into(),
                is_resolved: true,
            },
        );
        on_run_complete(&mut backlog, "run-1", &index, SafetyProfile::Normal, 5);
        assert_eq!(backlog.entries["key-1"].age_in_runs, 0);
    }

    #[test]
    fn needs_cleanup_flips_once_age_exceeds_threshold() {
        let mut backlog = ProjectIssueBacklog::default();
        for run_n in 0..3 {
            let mut index = RunIssueIndex::default();
            index.entries.insert(
                "key-1".into(),
                AggregatedIssue {
                    issue_key: IssueKey::new("key-1"),
                    severity: Severity::Major,
                    category: "scope_violation".into(),
                    occurrence_count: 1,
                    first_phase_seen: "phase-1".into(),
                    is_resolved: false,
                },
            );
            on_run_complete(&mut backlog, &format!("run-{run_n}"), &index, SafetyProfile::Normal, 2);
        }
        assert!(backlog.entries["key-1"].needs_cleanup);
    }
}
