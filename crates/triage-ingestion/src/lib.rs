use thiserror::Error;
use triage_store::StoreError;

mod join;
mod stats;

pub use join::{JoinOutcome, control_build_id, join_build_result, join_presubmit_results};
pub use stats::{
    JoinStatistics, MAX_JOIN_STATS_HOURS, PRESUBMIT_JOIN_STATS_HOURS, read_presubmit_join_statistics,
};

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("build {build_id}: {message}")]
    Conflict { build_id: String, message: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
