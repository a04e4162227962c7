use std::sync::LazyLock;

use regex::Regex;
use triage_core::{ClusterId, Failure};
use triage_rules::escape_like;

use crate::hash_cluster_key;

pub const FAILURE_REASON_ALGORITHM_NAME: &str = "reason-v3";
pub const FAILURE_REASON_ALGORITHM_VERSION: i64 = 3;

/// Variable parts of error messages: base64 runs, long hex or UUID runs,
/// hex constants and decimal numbers.
static VARIABLE_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[/+0-9a-zA-Z]{10,}=+|[\-0-9a-fA-F \t]{16,}|[0-9a-fA-Fx]{8,}|[0-9]+")
        .expect("variable parts regex is valid")
});

/// Clusters failures by their primary error message with variable parts
/// masked out. Failures without an error message are not clustered.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureReasonAlgorithm;

impl FailureReasonAlgorithm {
    pub fn cluster(&self, failure: &Failure) -> Option<ClusterId> {
        let like = self.cluster_like(failure)?;
        Some(ClusterId::new(
            FAILURE_REASON_ALGORITHM_NAME,
            hash_cluster_key(&like),
        ))
    }

    /// The LIKE expression on primary error messages that defines the
    /// failure's cluster.
    pub fn cluster_like(&self, failure: &Failure) -> Option<String> {
        let message = failure.primary_error_message();
        if message.is_empty() {
            return None;
        }
        let escaped = escape_like(message);
        Some(VARIABLE_PARTS.replace_all(&escaped, "%").into_owned())
    }
}
