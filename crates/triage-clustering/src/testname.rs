use std::sync::LazyLock;

use regex::Regex;
use triage_config::TestNameRuleConfig;
use triage_core::{ClusterId, Failure};
use triage_rules::{escape_like, like_to_regex};

use crate::{ClusteringError, hash_cluster_key};

pub const TEST_NAME_ALGORITHM_NAME: &str = "testname-v4";
pub const TEST_NAME_ALGORITHM_VERSION: i64 = 4;

/// `${name}` inserts a capture group, `$$` a literal `$`. A lone `$` is an
/// error.
static SUBSTITUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{(\w+?)\}|\$\$?").expect("substitution regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(usize),
}

/// A compiled test name clustering rule.
#[derive(Debug, Clone)]
pub struct TestNameRule {
    name: String,
    pattern: Regex,
    segments: Vec<Segment>,
}

impl TestNameRule {
    pub fn compile(config: &TestNameRuleConfig) -> Result<Self, ClusteringError> {
        let invalid = |message: String| ClusteringError::InvalidTestNameRule {
            name: config.name.clone(),
            message,
        };

        let pattern =
            Regex::new(&config.pattern).map_err(|err| invalid(format!("parsing pattern: {err}")))?;

        let template = &config.like_template;
        let mut segments = Vec::new();
        let mut last_index = 0;
        for captures in SUBSTITUTION.captures_iter(template) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            if whole.start() > last_index {
                let literal = &template[last_index..whole.start()];
                like_to_regex(literal).map_err(|err| {
                    invalid(format!("{literal:?} is not a valid standalone LIKE expression: {err}"))
                })?;
                segments.push(Segment::Literal(literal.to_owned()));
            }
            last_index = whole.end();

            match (whole.as_str(), captures.get(1)) {
                ("$$", _) => segments.push(Segment::Literal("$".to_owned())),
                (_, Some(group)) => {
                    let index = pattern
                        .capture_names()
                        .position(|name| name == Some(group.as_str()))
                        .ok_or_else(|| {
                            invalid(format!(
                                "like template refers to unknown capture group {:?}",
                                group.as_str()
                            ))
                        })?;
                    segments.push(Segment::Capture(index));
                }
                _ => {
                    return Err(invalid(format!(
                        "invalid use of '$' at position {} in {template:?}; use '$$' for a literal '$'",
                        whole.start()
                    )));
                }
            }
        }
        if last_index < template.len() {
            let literal = &template[last_index..];
            like_to_regex(literal).map_err(|err| {
                invalid(format!("{literal:?} is not a valid standalone LIKE expression: {err}"))
            })?;
            segments.push(Segment::Literal(literal.to_owned()));
        }

        Ok(Self {
            name: config.name.clone(),
            pattern,
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The LIKE expression of the cluster `test_id` belongs to under this
    /// rule, if the rule applies to it.
    pub fn evaluate(&self, test_id: &str) -> Option<String> {
        let captures = self.pattern.captures(test_id)?;
        let mut like = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => like.push_str(text),
                Segment::Capture(index) => {
                    if let Some(value) = captures.get(*index) {
                        like.push_str(&escape_like(value.as_str()));
                    }
                }
            }
        }
        Some(like)
    }
}

/// Clusters failures by test name. Test names matched by a configured rule
/// are clustered by the rule's LIKE expression; others by the exact name.
#[derive(Debug, Clone, Default)]
pub struct TestNameAlgorithm {
    rules: Vec<TestNameRule>,
}

impl TestNameAlgorithm {
    pub fn new(configs: &[TestNameRuleConfig]) -> Result<Self, ClusteringError> {
        let rules = configs
            .iter()
            .map(TestNameRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    fn cluster_key(&self, failure: &Failure) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.evaluate(&failure.test_id))
            .unwrap_or_else(|| failure.test_id.clone())
    }

    pub fn cluster(&self, failure: &Failure) -> ClusterId {
        ClusterId::new(
            TEST_NAME_ALGORITHM_NAME,
            hash_cluster_key(&self.cluster_key(failure)),
        )
    }

    /// The LIKE expression on test IDs that defines the failure's cluster.
    pub fn cluster_like(&self, failure: &Failure) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.evaluate(&failure.test_id))
            .unwrap_or_else(|| escape_like(&failure.test_id))
    }
}
