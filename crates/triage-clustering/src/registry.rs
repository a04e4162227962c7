use std::collections::BTreeSet;

use triage_config::TestNameRuleConfig;
use triage_core::{ClusterId, Failure};

use crate::ClusteringError;
use crate::failurereason::{
    FAILURE_REASON_ALGORITHM_NAME, FAILURE_REASON_ALGORITHM_VERSION, FailureReasonAlgorithm,
};
use crate::rulesalgorithm::{RULES_ALGORITHM_NAME, RULES_ALGORITHM_VERSION};
use crate::testname::{TEST_NAME_ALGORITHM_NAME, TEST_NAME_ALGORITHM_VERSION, TestNameAlgorithm};

/// Added to the sum of algorithm versions. Bump it when the engine itself
/// changes in a way that requires every chunk to be re-clustered.
pub const ALGORITHMS_VERSION_OVERHEAD: i64 = 1;

/// A rule-free clustering algorithm.
#[derive(Debug, Clone)]
pub enum SuggestedAlgorithm {
    TestName(TestNameAlgorithm),
    FailureReason(FailureReasonAlgorithm),
}

impl SuggestedAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            SuggestedAlgorithm::TestName(_) => TEST_NAME_ALGORITHM_NAME,
            SuggestedAlgorithm::FailureReason(_) => FAILURE_REASON_ALGORITHM_NAME,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            SuggestedAlgorithm::TestName(_) => TEST_NAME_ALGORITHM_VERSION,
            SuggestedAlgorithm::FailureReason(_) => FAILURE_REASON_ALGORITHM_VERSION,
        }
    }

    pub fn cluster(&self, failure: &Failure) -> Option<ClusterId> {
        match self {
            SuggestedAlgorithm::TestName(algorithm) => Some(algorithm.cluster(failure)),
            SuggestedAlgorithm::FailureReason(algorithm) => algorithm.cluster(failure),
        }
    }

    /// The LIKE expression that defines the failure's cluster, if any.
    pub fn cluster_like(&self, failure: &Failure) -> Option<String> {
        match self {
            SuggestedAlgorithm::TestName(algorithm) => Some(algorithm.cluster_like(failure)),
            SuggestedAlgorithm::FailureReason(algorithm) => algorithm.cluster_like(failure),
        }
    }
}

/// The algorithms a process clusters with, and the version that identifies
/// them. Built once at startup and passed to the engine.
#[derive(Debug, Clone)]
pub struct AlgorithmRegistry {
    suggested: Vec<SuggestedAlgorithm>,
    algorithms_version: i64,
}

impl AlgorithmRegistry {
    /// The standard algorithm set.
    pub fn new(test_name_rules: &[TestNameRuleConfig]) -> Result<Self, ClusteringError> {
        Ok(Self::with_algorithms(vec![
            SuggestedAlgorithm::FailureReason(FailureReasonAlgorithm),
            SuggestedAlgorithm::TestName(TestNameAlgorithm::new(test_name_rules)?),
        ]))
    }

    pub fn with_algorithms(suggested: Vec<SuggestedAlgorithm>) -> Self {
        let algorithms_version = ALGORITHMS_VERSION_OVERHEAD
            + RULES_ALGORITHM_VERSION
            + suggested.iter().map(SuggestedAlgorithm::version).sum::<i64>();
        Self {
            suggested,
            algorithms_version,
        }
    }

    pub fn algorithms_version(&self) -> i64 {
        self.algorithms_version
    }

    pub fn suggested(&self) -> &[SuggestedAlgorithm] {
        &self.suggested
    }

    pub fn suggested_algorithm(&self, name: &str) -> Option<&SuggestedAlgorithm> {
        self.suggested.iter().find(|algorithm| algorithm.name() == name)
    }

    /// Every algorithm name, including the rules algorithm.
    pub fn algorithm_names(&self) -> BTreeSet<String> {
        self.suggested
            .iter()
            .map(|algorithm| algorithm.name().to_owned())
            .chain(std::iter::once(RULES_ALGORITHM_NAME.to_owned()))
            .collect()
    }
}
