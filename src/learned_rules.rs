//! Two-level learning loop: within-run `RunRuleHint`s, promoted at run end
//! into persistent project-level `LearnedRule`s.
//!
//! Hint generation is template-based and deterministic — no external model
//! call — matching the source design note that promotion must stay
//! reproducible across runs.

use crate::model::{
    HintId, IssueKey, LearnedRule, RuleId, RuleStatus, RunRuleHint, TaskCategory,
};
use std::collections::HashMap;

/// Bound from the public contract: hint text is capped at 256 chars.
const MAX_HINT_LEN: usize = 256;

/// Deterministic hint templates, keyed by the `issue_key` "class" (its
/// category string — the part of the fingerprint stable across phases).
fn hint_template(issue_key_class: &str, scope_paths: &[String]) -> String {
    let scope_sample: Vec<&str> = scope_paths.iter().take(3).map(String::as_str).collect();
    let scope_text = if scope_sample.is_empty() {
        "the affected files".to_string()
    } else {
        scope_sample.join(", ")
    };
    let text = match issue_key_class {
        "scope_violation" => format!("Only modify files under {scope_text}; prior attempts wrote outside scope."),
        "missing_type_hints" => format!("Add explicit type hints for new symbols touching {scope_text}."),
        "budget_exceeded" => format!("Keep patches to {scope_text} smaller; prior attempts exceeded the phase token cap."),
        other => format!("Recurring {other} issue observed in {scope_text}; address the root cause before resubmitting."),
    };
    truncate_hint(&text)
}

fn truncate_hint(text: &str) -> String {
    if text.len() <= MAX_HINT_LEN {
        text.to_string()
    } else {
        text.chars().take(MAX_HINT_LEN).collect()
    }
}

/// Generate a hint for a phase from a resolved issue pattern. Called by the
/// Supervisor at Phase `COMPLETE` for issue_keys present earlier in the
/// phase and absent from the final Auditor result.
pub fn record_run_hint(
    hint_id: HintId,
    phase_id: &str,
    task_category: TaskCategory,
    scope_paths: Vec<String>,
    source_issue_keys: Vec<IssueKey>,
    issue_key_class: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> RunRuleHint {
    RunRuleHint {
        hint_id,
        phase_id: phase_id.to_string(),
        task_category,
        scope_paths: scope_paths.clone(),
        source_issue_keys,
        issue_key_class: issue_key_class.to_string(),
        hint_text: hint_template(issue_key_class, &scope_paths),
        created_at: now,
    }
}

/// Hints recorded within one Run, filtered by `task_category` and
/// intersecting `scope_paths`, capped to the top N by recency.
pub fn hints_for_phase<'a>(
    all_hints: &'a [RunRuleHint],
    task_category: TaskCategory,
    scope_paths: &[String],
    cap: usize,
) -> Vec<&'a RunRuleHint> {
    let mut matching: Vec<&RunRuleHint> = all_hints
        .iter()
        .filter(|hint| hint.task_category == task_category)
        .filter(|hint| scope_intersects(&hint.scope_paths, scope_paths))
        .collect();
    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    matching.truncate(cap);
    matching
}

fn scope_intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|glob_a| {
        b.iter().any(|glob_b| {
            glob_a == glob_b
                || crate::model::glob_matches(glob_a, glob_b)
                || crate::model::glob_matches(glob_b, glob_a)
        })
    })
}

/// Longest common path prefix across a group's scope_paths, used as the
/// `scope_pattern` recorded on a promoted `LearnedRule`.
fn common_scope_prefix(scope_paths: &[&str]) -> Option<String> {
    let first = scope_paths.first()?;
    let mut prefix_segments: Vec<&str> = first.split('/').collect();
    for path in &scope_paths[1..] {
        let segments: Vec<&str> = path.split('/').collect();
        let shared = prefix_segments
            .iter()
            .zip(segments.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix_segments.truncate(shared);
        if prefix_segments.is_empty() {
            return None;
        }
    }
    Some(format!("{}/**", prefix_segments.join("/")))
}

/// Group hints by `(issue_key_class, task_category, scope_prefix)` and
/// promote groups of size >= `promotion_threshold` into `LearnedRule`s.
/// Deduplicates against `existing_rules` by `(task_category, scope_pattern,
/// constraint_text)`, incrementing `promotion_count` and `last_seen` on a
/// match instead of creating a duplicate rule.
pub fn promote_hints_to_rules(
    hints: &[RunRuleHint],
    existing_rules: &mut Vec<LearnedRule>,
    promotion_threshold: u32,
    run_tick: u64,
    now: chrono::DateTime<chrono::Utc>,
    mut next_rule_id: impl FnMut() -> RuleId,
) {
    let mut groups: HashMap<(String, TaskCategory), Vec<&RunRuleHint>> = HashMap::new();
    for hint in hints {
        groups.entry((hint.issue_key_class.clone(), hint.task_category)).or_default().push(hint);
    }

    for ((issue_key_class, task_category), group) in groups {
        if (group.len() as u32) < promotion_threshold {
            continue;
        }
        let scope_paths: Vec<&str> = group.iter().flat_map(|h| h.scope_paths.iter().map(String::as_str)).collect();
        let scope_pattern = common_scope_prefix(&scope_paths);
        let constraint_text = hint_template(&issue_key_class, &group[0].scope_paths);
        let source_hint_ids: Vec<HintId> = group.iter().map(|h| h.hint_id.clone()).collect();

        match existing_rules.iter_mut().find(|rule| {
            rule.task_category == task_category
                && rule.scope_pattern == scope_pattern
                && rule.constraint_text == constraint_text
        }) {
            Some(rule) => {
                rule.promotion_count += 1;
                rule.last_seen = now;
                rule.last_reinforced_run_tick = run_tick;
                for id in source_hint_ids {
                    if !rule.source_hint_ids.contains(&id) {
                        rule.source_hint_ids.push(id);
                    }
                }
                if rule.status == RuleStatus::Deprecated {
                    rule.status = RuleStatus::Active;
                }
            }
            None => existing_rules.push(LearnedRule {
                rule_id: next_rule_id(),
                task_category,
                scope_pattern,
                constraint_text,
                source_hint_ids,
                promotion_count: 1,
                first_seen: now,
                last_seen: now,
                status: RuleStatus::Active,
                last_reinforced_run_tick: run_tick,
            }),
        }
    }
}

/// Deprecate rules untouched (neither promoted nor reinforced) for more
/// than `staleness_runs` since `last_reinforced_run_tick`.
pub fn deprecate_stale_rules(rules: &mut [LearnedRule], current_run_tick: u64, staleness_runs: u32) {
    for rule in rules.iter_mut() {
        if rule.status == RuleStatus::Active
            && current_run_tick.saturating_sub(rule.last_reinforced_run_tick) > staleness_runs as u64
        {
            rule.status = RuleStatus::Deprecated;
        }
    }
}
