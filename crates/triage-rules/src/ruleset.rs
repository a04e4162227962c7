use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use triage_core::{RuleRecord, starting_epoch};

use crate::lang::Predicate;

/// An active rule with its compiled predicate.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub rule_id: String,
    pub last_updated: DateTime<Utc>,
    pub predicate: Predicate,
}

impl CachedRule {
    fn compile(rule: &RuleRecord) -> Option<Self> {
        let last_updated = rule.last_updated?;
        match Predicate::parse(&rule.definition) {
            Ok(predicate) => Some(Self {
                rule_id: rule.rule_id.clone(),
                last_updated,
                predicate,
            }),
            Err(err) => {
                tracing::warn!(
                    project = %rule.project,
                    rule_id = %rule.rule_id,
                    error = %err,
                    "skipping rule with invalid definition"
                );
                None
            }
        }
    }
}

/// An immutable snapshot of the active rules of a project. Refreshing a
/// ruleset always produces a new value.
#[derive(Debug, Clone)]
pub struct Ruleset {
    project: String,
    /// Ordered by `last_updated`, most recent first.
    active_rules: Vec<Arc<CachedRule>>,
    active_rule_ids: HashSet<String>,
    version: DateTime<Utc>,
    loaded_at: DateTime<Utc>,
}

impl Ruleset {
    /// A project without rules.
    pub fn empty(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            active_rules: Vec::new(),
            active_rule_ids: HashSet::new(),
            version: starting_epoch(),
            loaded_at: starting_epoch(),
        }
    }

    /// Builds a ruleset from `rules`. Inactive rules and rules whose
    /// definition does not parse are left out. `version` is raised to the
    /// latest `last_updated` of any rule given.
    pub fn new(
        project: impl Into<String>,
        rules: &[RuleRecord],
        version: DateTime<Utc>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let version = rules
            .iter()
            .filter_map(|rule| rule.last_updated)
            .fold(version, |latest, updated| latest.max(updated));
        let compiled: Vec<_> = rules
            .iter()
            .filter(|rule| rule.is_active)
            .filter_map(CachedRule::compile)
            .map(Arc::new)
            .collect();
        Self::from_compiled(project.into(), compiled, version, loaded_at)
    }

    fn from_compiled(
        project: String,
        mut active_rules: Vec<Arc<CachedRule>>,
        version: DateTime<Utc>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        active_rules.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
        });
        let active_rule_ids = active_rules
            .iter()
            .map(|rule| rule.rule_id.clone())
            .collect();
        Self {
            project,
            active_rules,
            active_rule_ids,
            version,
            loaded_at,
        }
    }

    /// A new ruleset with `delta` (rules written since this ruleset's
    /// version, active or not) applied. Compiled rules are shared with
    /// `self` where unchanged.
    pub fn apply_delta(&self, delta: &[RuleRecord], loaded_at: DateTime<Utc>) -> Self {
        let mut by_id: HashMap<String, Arc<CachedRule>> = self
            .active_rules
            .iter()
            .map(|rule| (rule.rule_id.clone(), Arc::clone(rule)))
            .collect();
        let mut version = self.version;

        for rule in delta {
            if let Some(last_updated) = rule.last_updated {
                version = version.max(last_updated);
            }
            by_id.remove(&rule.rule_id);
            if rule.is_active {
                if let Some(compiled) = CachedRule::compile(rule) {
                    by_id.insert(rule.rule_id.clone(), Arc::new(compiled));
                }
            }
        }

        Self::from_compiled(
            self.project.clone(),
            by_id.into_values().collect(),
            version,
            loaded_at,
        )
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// The last-updated time of the most recent rule change reflected in
    /// this snapshot, including deactivations.
    pub fn version(&self) -> DateTime<Utc> {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn len(&self) -> usize {
        self.active_rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active_rules.is_empty()
    }

    /// Active rules with `last_updated > since`, most recent first.
    pub fn active_rules_updated_since(&self, since: DateTime<Utc>) -> &[Arc<CachedRule>] {
        let end = self
            .active_rules
            .partition_point(|rule| rule.last_updated > since);
        &self.active_rules[..end]
    }

    pub fn is_rule_active(&self, rule_id: &str) -> bool {
        self.active_rule_ids.contains(rule_id)
    }
}
