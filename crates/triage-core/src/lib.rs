mod clock;
mod cluster;
mod control;
mod rule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster::{
    ALGORITHM_NAME_MAX_LEN, BuildEdge, ClusterId, ClusterResults, Failure, FailureReason,
    is_valid_algorithm_name, is_valid_chunk_id, sort_clusters,
};
pub use control::{
    BuildResult, Entry, LUCI_CV_SYSTEM, PresubmitResult, PresubmitRunId, ValidationError,
    is_valid_project, validate_entry,
};
pub use rule::{RuleRecord, is_valid_rule_id, starting_epoch};

pub(crate) fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
