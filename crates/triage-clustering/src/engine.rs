use std::collections::BTreeSet;

use triage_core::{ClusterId, ClusterResults, Failure, sort_clusters, starting_epoch};
use triage_rules::Ruleset;

use crate::registry::AlgorithmRegistry;
use crate::rulesalgorithm::{RULES_ALGORITHM_NAME, match_rules};

/// Brings `existing`, the clustering of `failures`, up to date with the
/// algorithms of `registry` and the rules of `ruleset`.
///
/// Only work that is out of date is redone: suggested algorithms already
/// recorded in `existing` are carried forward, and rules are re-matched
/// only where they changed after `existing.rules_version`. Results written
/// by a newer algorithms version are returned unchanged. Missing cluster
/// lists in `existing` are treated as empty.
pub fn cluster(
    registry: &AlgorithmRegistry,
    ruleset: &Ruleset,
    existing: &ClusterResults,
    failures: &[Failure],
) -> ClusterResults {
    if existing.algorithms_version > registry.algorithms_version() {
        tracing::debug!(
            existing_version = existing.algorithms_version,
            current_version = registry.algorithms_version(),
            "clustering written by newer algorithms, leaving unchanged"
        );
        return existing.clone();
    }

    let configured: BTreeSet<&str> = registry
        .suggested()
        .iter()
        .map(|algorithm| algorithm.name())
        .collect();
    let to_run: Vec<_> = registry
        .suggested()
        .iter()
        .filter(|algorithm| !existing.algorithms.contains(algorithm.name()))
        .collect();

    let previous_rules_version = existing
        .rules_version
        .filter(|_| existing.algorithms.contains(RULES_ALGORITHM_NAME));
    let since = previous_rules_version.unwrap_or_else(starting_epoch);
    let stale_ruleset = previous_rules_version.is_some_and(|version| ruleset.version() < version);
    if stale_ruleset {
        tracing::debug!(
            project = ruleset.project(),
            ruleset_version = %ruleset.version(),
            existing_version = %since,
            "ruleset older than existing clustering, carrying rule clusters forward"
        );
    }

    let clusters = failures
        .iter()
        .enumerate()
        .map(|(index, failure)| {
            let previous = existing.clusters.get(index).map(Vec::as_slice).unwrap_or(&[]);

            let mut ids = Vec::new();
            let mut baseline = BTreeSet::new();
            for id in previous {
                if id.algorithm == RULES_ALGORITHM_NAME {
                    if previous_rules_version.is_some() {
                        baseline.insert(id.id.clone());
                    }
                } else if configured.contains(id.algorithm.as_str())
                    && existing.algorithms.contains(&id.algorithm)
                {
                    ids.push(id.clone());
                }
            }

            ids.extend(to_run.iter().filter_map(|algorithm| algorithm.cluster(failure)));

            let rule_ids = if stale_ruleset {
                baseline
            } else {
                baseline.retain(|rule_id| ruleset.is_rule_active(rule_id));
                match_rules(ruleset, since, baseline, failure)
            };
            ids.extend(
                rule_ids
                    .into_iter()
                    .map(|rule_id| ClusterId::new(RULES_ALGORITHM_NAME, rule_id)),
            );

            sort_clusters(&mut ids);
            ids.dedup();
            ids
        })
        .collect();

    let rules_version = match existing.rules_version {
        Some(existing_version) => existing_version.max(ruleset.version()),
        None => ruleset.version(),
    };

    ClusterResults {
        algorithms_version: registry.algorithms_version(),
        rules_version: Some(rules_version),
        algorithms: registry.algorithm_names(),
        clusters,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use triage_core::RuleRecord;

    use super::*;
    use crate::failurereason::FAILURE_REASON_ALGORITHM_NAME;
    use crate::hash_cluster_key;
    use crate::registry::{SuggestedAlgorithm, ALGORITHMS_VERSION_OVERHEAD};
    use crate::testname::{TEST_NAME_ALGORITHM_NAME, TestNameAlgorithm};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0)
            .single()
            .expect("valid time")
            + Duration::minutes(minutes)
    }

    fn rule(id_digit: char, definition: &str, last_updated: DateTime<Utc>) -> RuleRecord {
        RuleRecord {
            project: "testproject".to_owned(),
            rule_id: id_digit.to_string().repeat(32),
            definition: definition.to_owned(),
            is_active: true,
            creation_time: Some(last_updated),
            last_updated: Some(last_updated),
            source_cluster: None,
        }
    }

    fn registry() -> AlgorithmRegistry {
        AlgorithmRegistry::new(&[]).expect("registry")
    }

    fn testname(test_id: &str) -> ClusterId {
        ClusterId::new(TEST_NAME_ALGORITHM_NAME, hash_cluster_key(test_id))
    }

    #[test]
    fn clusters_by_test_name_without_rules() {
        let results = cluster(
            &registry(),
            &Ruleset::empty("testproject"),
            &ClusterResults::default(),
            &[Failure::new("t1")],
        );
        assert_eq!(results.clusters, vec![vec![testname("t1")]]);
        assert_eq!(results.algorithms_version, registry().algorithms_version());
        assert_eq!(results.rules_version, Some(starting_epoch()));
        assert_eq!(results.algorithms, registry().algorithm_names());
        results.validate().expect("valid results");
    }

    #[test]
    fn cold_start_matches_rules_and_rerun_is_identical() {
        let ruleset = Ruleset::new(
            "testproject",
            &[rule('1', r#"test = "t2""#, t(1))],
            starting_epoch(),
            t(2),
        );
        let failures = [Failure::new("t2")];

        let first = cluster(
            &registry(),
            &ruleset,
            &ClusterResults::never_clustered(1),
            &failures,
        );
        let mut expected = vec![
            ClusterId::new(RULES_ALGORITHM_NAME, "1".repeat(32)),
            testname("t2"),
        ];
        sort_clusters(&mut expected);
        assert_eq!(first.clusters, vec![expected]);
        assert_eq!(first.rules_version, Some(t(1)));

        let second = cluster(&registry(), &ruleset, &first, &failures);
        assert_eq!(second, first);
    }

    #[test]
    fn deleted_rules_are_dropped() {
        let with_rule = Ruleset::new(
            "testproject",
            &[rule('1', r#"test = "t2""#, t(1))],
            starting_epoch(),
            t(2),
        );
        let failures = [Failure::new("t2")];
        let before = cluster(&registry(), &with_rule, &ClusterResults::default(), &failures);

        let mut deleted = rule('1', r#"test = "t2""#, t(5));
        deleted.is_active = false;
        let without_rule = with_rule.apply_delta(&[deleted], t(6));

        let after = cluster(&registry(), &without_rule, &before, &failures);
        assert_eq!(after.clusters, vec![vec![testname("t2")]]);
        assert_eq!(after.rules_version, Some(t(5)));
    }

    #[test]
    fn newer_algorithms_version_is_left_untouched() {
        let mut existing = ClusterResults::never_clustered(1);
        existing.algorithms_version = registry().algorithms_version() + 1;
        existing.algorithms.insert("testname-v9".to_owned());
        existing.clusters[0].push(ClusterId::new("testname-v9", "abcd"));

        let results = cluster(
            &registry(),
            &Ruleset::empty("testproject"),
            &existing,
            &[Failure::new("t1")],
        );
        assert_eq!(results, existing);
    }

    #[test]
    fn stale_ruleset_does_not_regress_rules_version() {
        let current = Ruleset::new(
            "testproject",
            &[rule('1', "TRUE", t(1)), rule('2', "TRUE", t(10))],
            starting_epoch(),
            t(11),
        );
        let failures = [Failure::new("t")];
        let existing = cluster(&registry(), &current, &ClusterResults::default(), &failures);
        assert_eq!(existing.rules_version, Some(t(10)));

        let stale = Ruleset::new("testproject", &[rule('1', "TRUE", t(1))], starting_epoch(), t(2));
        let results = cluster(&registry(), &stale, &existing, &failures);
        assert_eq!(results.rules_version, Some(t(10)));
        assert_eq!(results.clusters, existing.clusters);
    }

    #[test]
    fn only_missing_algorithms_are_run() {
        // A previous run recorded an ID under the test name algorithm that
        // it would not produce today; it must be carried forward verbatim.
        let carried = ClusterId::new(TEST_NAME_ALGORITHM_NAME, "feedface");
        let mut existing = ClusterResults::never_clustered(1);
        existing.algorithms_version = 1;
        existing.algorithms.insert(TEST_NAME_ALGORITHM_NAME.to_owned());
        existing.clusters[0].push(carried.clone());

        let failure = Failure::new("t").with_reason("boom");
        let results = cluster(
            &registry(),
            &Ruleset::empty("testproject"),
            &existing,
            &[failure.clone()],
        );

        let reason = registry()
            .suggested_algorithm(FAILURE_REASON_ALGORITHM_NAME)
            .and_then(|algorithm| algorithm.cluster(&failure))
            .expect("reason cluster");
        let mut expected = vec![carried, reason];
        sort_clusters(&mut expected);
        assert_eq!(results.clusters, vec![expected]);
    }

    #[test]
    fn clusters_of_retired_algorithms_are_dropped() {
        let mut existing = ClusterResults::never_clustered(1);
        existing.algorithms_version = 1;
        existing.algorithms.insert("testname-v3".to_owned());
        existing.clusters[0].push(ClusterId::new("testname-v3", "0123"));

        let only_test_name = AlgorithmRegistry::with_algorithms(vec![SuggestedAlgorithm::TestName(
            TestNameAlgorithm::default(),
        )]);
        assert_eq!(
            only_test_name.algorithms_version(),
            ALGORITHMS_VERSION_OVERHEAD + 2 + 4
        );
        let results = cluster(
            &only_test_name,
            &Ruleset::empty("testproject"),
            &existing,
            &[Failure::new("t")],
        );
        assert_eq!(results.clusters, vec![vec![testname("t")]]);
        results.validate().expect("valid results");
    }

    #[test]
    fn missing_existing_cluster_lists_are_treated_as_empty() {
        let mut existing = ClusterResults::default();
        existing.algorithms_version = 1;
        existing.algorithms = registry().algorithm_names();
        existing.rules_version = Some(starting_epoch());

        let results = cluster(
            &registry(),
            &Ruleset::empty("testproject"),
            &existing,
            &[Failure::new("t1"), Failure::new("t2")],
        );
        assert_eq!(results.clusters, vec![Vec::new(), Vec::new()]);
    }
}
