use chrono::{DateTime, Utc};
use thiserror::Error;
use triage_core::RuleRecord;
use triage_store::{RuleStore, StoreError};

mod cache;
pub mod lang;
mod ruleset;

pub use cache::RulesCache;
pub use lang::{Predicate, escape_like, like_to_regex};
pub use ruleset::{CachedRule, Ruleset};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("syntax error at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rules of project {project} are at {available}, older than requested {minimum}")]
    StaleRuleset {
        project: String,
        minimum: DateTime<Utc>,
        available: DateTime<Utc>,
    },
    #[error("rules cache lock poisoned")]
    Poisoned,
}

/// A new random rule ID: 128 bits as 32 lowercase hexadecimal characters.
pub fn generate_rule_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Checks that the rule's definition parses, then stores it.
pub fn save_rule(store: &dyn RuleStore, rule: &RuleRecord) -> Result<RuleRecord, RuleError> {
    Predicate::parse(&rule.definition)?;
    Ok(store.upsert_rule(rule)?)
}
