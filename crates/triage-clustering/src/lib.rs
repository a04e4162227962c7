use sha2::{Digest, Sha256};
use thiserror::Error;

mod engine;
pub mod failurereason;
mod registry;
pub mod rulesalgorithm;
pub mod testname;

pub use engine::cluster;
pub use failurereason::{FAILURE_REASON_ALGORITHM_NAME, FailureReasonAlgorithm};
pub use registry::{ALGORITHMS_VERSION_OVERHEAD, AlgorithmRegistry, SuggestedAlgorithm};
pub use rulesalgorithm::{RULES_ALGORITHM_NAME, match_rules};
pub use testname::{TEST_NAME_ALGORITHM_NAME, TestNameAlgorithm, TestNameRule};

/// Bytes of the SHA-256 digest kept in a suggested cluster ID.
const CLUSTER_ID_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum ClusteringError {
    #[error("test name rule {name:?}: {message}")]
    InvalidTestNameRule { name: String, message: String },
}

/// The ID of the suggested cluster keyed by `key`.
pub fn hash_cluster_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..CLUSTER_ID_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_keys_hash_to_truncated_sha256() {
        // SHA-256("t1") = 628b49d96dcde97a430dd4f597705899e09a968f793491e4b704cae33a40dc02
        assert_eq!(hash_cluster_key("t1"), "628b49d96dcde97a430dd4f597705899");
        assert_ne!(hash_cluster_key("t1"), hash_cluster_key("t2"));
    }
}
