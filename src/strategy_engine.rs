//! Compiles a `ProjectRuleset` + learned-rules snapshot + run spec into a
//! frozen `RunStrategy`. Pure function of its inputs — no I/O, no clock
//! reads beyond what the caller hands in.

use crate::error::{AutopackError, Result};
use crate::model::{
    CategoryDefaults, Complexity, LearnedRule, ProjectRuleset, RunStrategy, SafetyProfile,
    TaskCategory,
};
use std::collections::HashMap;

/// Per-category phase token floor below which a ruleset entry is considered
/// a misconfiguration rather than an aggressive cap.
const MIN_PHASE_TOKEN_CAP: u64 = 1;

/// The run-level request handed to `Compile`. Distinct from the persisted
/// `Run` entity: this is the caller's spec, before budgets are resolved.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub project_id: String,
    pub safety_profile: SafetyProfile,
    pub requested_token_cap: u64,
    pub requested_max_phases: u32,
    /// Every `task_category` this run's declared phases will use; `Compile`
    /// fails fast if any of these is missing from the ruleset.
    pub task_categories_in_use: Vec<TaskCategory>,
}

/// Compile `ruleset + learned_rules` into an immutable `RunStrategy`.
///
/// `dry_run` only affects the caller's persistence decision; `Compile`
/// itself never performs I/O either way, so the flag is accepted for
/// documentation parity with the public contract and passed straight
/// through to the result's hash input (identical either way).
pub fn compile(
    ruleset: &ProjectRuleset,
    learned_rules: &[LearnedRule],
    spec: &RunSpec,
) -> Result<RunStrategy> {
    for category in TaskCategory::ALL {
        if spec.task_categories_in_use.contains(category) && !ruleset.categories.contains_key(category) {
            return Err(AutopackError::RulesetInvalid {
                reason: format!("no CategoryDefaults mapped for task_category={category}"),
            });
        }
    }

    let mut category_policy: HashMap<TaskCategory, CategoryDefaults> = HashMap::new();
    for category in &spec.task_categories_in_use {
        let defaults = ruleset.categories.get(category).ok_or_else(|| AutopackError::RulesetInvalid {
            reason: format!("no CategoryDefaults mapped for task_category={category}"),
        })?;
        validate_category_defaults(*category, defaults)?;
        category_policy.insert(*category, apply_overrides(*category, *defaults, spec.safety_profile));
    }

    let run_token_cap = spec.requested_token_cap.min(ruleset.run_token_cap_ceiling);
    if run_token_cap == 0 {
        return Err(AutopackError::RulesetInvalid {
            reason: "run_token_cap resolves to 0 after clamping to ruleset ceiling".into(),
        });
    }

    let max_phases_per_tier = match spec.safety_profile {
        SafetyProfile::SafetyCritical => Some(small_steps_phase_cap(spec.requested_max_phases)),
        SafetyProfile::Normal => None,
    };

    let promotion_threshold = ruleset.promotion_threshold.max(2);
    let aging_threshold = ruleset.aging_threshold(spec.safety_profile);

    let mut strategy = RunStrategy {
        safety_profile: spec.safety_profile,
        category_policy,
        run_token_cap,
        run_max_phases: spec.requested_max_phases,
        learned_rules_snapshot: learned_rules.to_vec(),
        max_phases_per_tier,
        promotion_threshold,
        aging_threshold,
        strategy_hash: String::new(),
    };
    strategy.strategy_hash = hash_strategy(&strategy);
    Ok(strategy)
}

/// Per-tier cap = 3x sum(phase caps in tier); called by the Supervisor once
/// it knows a tier's phase list, not by `Compile` itself (phases aren't
/// known at strategy-compile time — only category defaults are).
pub fn tier_token_cap(phase_caps: impl IntoIterator<Item = u64>) -> u64 {
    phase_caps.into_iter().sum::<u64>() * 3
}

fn validate_category_defaults(category: TaskCategory, defaults: &CategoryDefaults) -> Result<()> {
    for cap in [
        defaults.phase_token_cap_low,
        defaults.phase_token_cap_medium,
        defaults.phase_token_cap_high,
    ] {
        if cap < MIN_PHASE_TOKEN_CAP {
            return Err(AutopackError::RulesetInvalid {
                reason: format!(
                    "phase token cap for task_category={category} underflows the minimum floor"
                ),
            });
        }
    }
    if defaults.phase_token_cap_low > defaults.phase_token_cap_medium
        || defaults.phase_token_cap_medium > defaults.phase_token_cap_high
    {
        return Err(AutopackError::RulesetInvalid {
            reason: format!(
                "phase token caps for task_category={category} are not monotonic by complexity"
            ),
        });
    }
    Ok(())
}

/// HIGH_RISK categories force `ci_profile=strict`, tighter attempt caps, and
/// Auditor-preferred review; `safety_critical` additionally zeroes out minor
/// issue tolerance.
fn apply_overrides(
    category: TaskCategory,
    mut defaults: CategoryDefaults,
    safety_profile: SafetyProfile,
) -> CategoryDefaults {
    if category.is_high_risk() {
        defaults.ci_profile = crate::model::CiProfile::Strict;
        defaults.max_builder_attempts = defaults.max_builder_attempts.min(2);
        defaults.max_auditor_attempts = defaults.max_auditor_attempts.max(2);
        defaults.auditor_strictness = crate::model::AuditorStrictness::Strict;
    }
    if safety_profile == SafetyProfile::SafetyCritical {
        defaults.minor_issue_tolerance = 0;
    }
    defaults
}

fn small_steps_phase_cap(requested_max_phases: u32) -> u32 {
    requested_max_phases.min(3).max(1)
}

/// Deterministic hash over the fields that define a strategy's behavior
/// (explicitly excludes the hash field itself). Uses `serde_json`'s
/// stable key ordering via a `BTreeMap`-style canonicalization so that
/// repeated `Compile` calls on identical inputs are byte-identical.
fn hash_strategy(strategy: &RunStrategy) -> String {
    use std::collections::BTreeMap;
    use std::fmt::Write as _;

    let mut canon: BTreeMap<String, String> = BTreeMap::new();
    canon.insert("safety_profile".into(), format!("{:?}", strategy.safety_profile));
    canon.insert("run_token_cap".into(), strategy.run_token_cap.to_string());
    canon.insert("run_max_phases".into(), strategy.run_max_phases.to_string());
    canon.insert("promotion_threshold".into(), strategy.promotion_threshold.to_string());
    canon.insert("aging_threshold".into(), strategy.aging_threshold.to_string());
    canon.insert("max_phases_per_tier".into(), format!("{:?}", strategy.max_phases_per_tier));

    let mut categories: Vec<_> = strategy.category_policy.iter().collect();
    categories.sort_by_key(|(category, _)| category.to_string());
    for (category, defaults) in categories {
        canon.insert(
            format!("category::{category}"),
            format!(
                "{}:{}:{}:{}:{}:{:?}:{:?}:{}",
                defaults.phase_token_cap_low,
                defaults.phase_token_cap_medium,
                defaults.phase_token_cap_high,
                defaults.max_builder_attempts,
                defaults.max_auditor_attempts,
                defaults.ci_profile,
                defaults.auditor_strictness,
                defaults.minor_issue_tolerance,
            ),
        );
    }

    let mut rule_ids: Vec<&str> = strategy
        .learned_rules_snapshot
        .iter()
        .map(|r| r.rule_id.as_str())
        .collect();
    rule_ids.sort_unstable();
    canon.insert("learned_rules".into(), rule_ids.join(","));

    let mut acc = String::new();
    for (key, value) in &canon {
        let _ = write!(acc, "{key}={value};");
    }

    format!("{:016x}", fnv1a(acc.as_bytes()))
}

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

fn complexity_cap(defaults: &CategoryDefaults, complexity: Complexity) -> u64 {
    defaults.token_cap_for(complexity)
}
