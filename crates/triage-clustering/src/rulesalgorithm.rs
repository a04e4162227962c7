use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use triage_core::Failure;
use triage_rules::Ruleset;

pub const RULES_ALGORITHM_NAME: &str = "rules-v2";
pub const RULES_ALGORITHM_VERSION: i64 = 2;

/// Matches `failure` against the rules of `ruleset` updated after `since`,
/// starting from `baseline`, the rule IDs it matched as of `since`.
///
/// Only updated rules are evaluated: each is added on a match and removed
/// otherwise. Pass the starting epoch and an empty baseline to match
/// against every active rule. Removing baseline IDs of rules that are no
/// longer active is the caller's job.
pub fn match_rules(
    ruleset: &Ruleset,
    since: DateTime<Utc>,
    mut baseline: BTreeSet<String>,
    failure: &Failure,
) -> BTreeSet<String> {
    for rule in ruleset.active_rules_updated_since(since) {
        if rule.predicate.evaluate(failure) {
            baseline.insert(rule.rule_id.clone());
        } else {
            baseline.remove(&rule.rule_id);
        }
    }
    baseline
}
