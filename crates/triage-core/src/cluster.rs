use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::is_lower_hex;

pub const ALGORITHM_NAME_MAX_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FailureReason {
    pub primary_error_message: String,
}

/// A dependency edge reported by build-failure variants, e.g. a failed
/// compile step and the target that required it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEdge {
    pub from: String,
    pub to: String,
}

/// One test result failure. Immutable once produced by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Failure {
    pub test_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variant: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_edges: Option<Vec<BuildEdge>>,
}

impl Failure {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, primary_error_message: impl Into<String>) -> Self {
        self.reason = Some(FailureReason {
            primary_error_message: primary_error_message.into(),
        });
        self
    }

    /// The primary error message, or the empty string if there is none.
    pub fn primary_error_message(&self) -> &str {
        self.reason
            .as_ref()
            .map(|reason| reason.primary_error_message.as_str())
            .unwrap_or("")
    }
}

/// Identifies a cluster. Ordering is by algorithm name, then ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId {
    pub algorithm: String,
    pub id: String,
}

impl ClusterId {
    pub fn new(algorithm: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            id: id.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.algorithm.is_empty() && self.id.is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_algorithm_name(&self.algorithm) {
            return Err(format!("algorithm {:?} is not valid", self.algorithm));
        }
        if self.id.is_empty() || self.id.len() > 32 {
            return Err(format!("ID {:?} is not valid", self.id));
        }
        Ok(())
    }
}

/// The clusters of every failure in a batch, and the versions of the
/// algorithms and rules that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterResults {
    /// Version of the set of algorithms used. Zero if never clustered.
    pub algorithms_version: i64,
    /// Most recent rule state incorporated. `None` if rules were never
    /// matched.
    #[serde(default, with = "chrono::serde::ts_microseconds_option")]
    pub rules_version: Option<DateTime<Utc>>,
    /// Algorithms represented in `clusters`.
    pub algorithms: BTreeSet<String>,
    /// One sorted list of clusters per failure, aligned with the batch.
    pub clusters: Vec<Vec<ClusterId>>,
}

impl ClusterResults {
    /// Results for a batch of `len` failures that has never been clustered.
    pub fn never_clustered(len: usize) -> Self {
        Self {
            clusters: vec![Vec::new(); len],
            ..Self::default()
        }
    }

    /// Checks that every cluster belongs to an algorithm listed in
    /// `algorithms`.
    pub fn validate(&self) -> Result<(), String> {
        for algorithm in &self.algorithms {
            if !is_valid_algorithm_name(algorithm) {
                return Err(format!("algorithm {algorithm:?} is not valid"));
            }
        }
        for (index, clusters) in self.clusters.iter().enumerate() {
            for cluster in clusters {
                cluster
                    .validate()
                    .map_err(|err| format!("failure {index}: {err}"))?;
                if !self.algorithms.contains(&cluster.algorithm) {
                    return Err(format!(
                        "failure {index}: cluster algorithm {:?} is not listed in algorithms",
                        cluster.algorithm
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn sort_clusters(clusters: &mut [ClusterId]) {
    clusters.sort();
}

/// Algorithm names are lowercase words joined by `-`, e.g. `testname-v4`.
pub fn is_valid_algorithm_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= ALGORITHM_NAME_MAX_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

pub fn is_valid_chunk_id(chunk_id: &str) -> bool {
    is_lower_hex(chunk_id, 32)
}
