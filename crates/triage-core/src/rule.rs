use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClusterId, is_lower_hex};

/// 1900-01-01T00:00:00Z as seconds since the Unix epoch.
const STARTING_EPOCH_SECS: i64 = -2_208_988_800;

/// The rules version of a project that has never had a rule. Distinct
/// from any "timestamp not populated" value.
pub fn starting_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(STARTING_EPOCH_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A failure association rule as stored. The definition is uncompiled
/// text; see `triage_rules::lang` for its grammar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub project: String,
    /// 32 lowercase hexadecimal characters.
    pub rule_id: String,
    pub definition: String,
    pub is_active: bool,
    /// Set by the store on creation. Output only.
    pub creation_time: Option<DateTime<Utc>>,
    /// Set by the store on every write. Output only.
    pub last_updated: Option<DateTime<Utc>>,
    /// The suggested cluster the rule was created from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_cluster: Option<ClusterId>,
}

pub fn is_valid_rule_id(rule_id: &str) -> bool {
    is_lower_hex(rule_id, 32)
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    #[test]
    fn starting_epoch_is_start_of_1900() {
        let epoch = starting_epoch();
        assert_eq!(epoch.year(), 1900);
        assert_eq!(epoch.month(), 1);
        assert_eq!(epoch.day(), 1);
        assert_eq!(epoch.hour(), 0);
    }

    #[test]
    fn rule_ids_are_32_lowercase_hex_characters() {
        assert!(is_valid_rule_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_rule_id("0123456789ABCDEF0123456789ABCDEF"));
        assert!(!is_valid_rule_id("0123"));
    }
}
