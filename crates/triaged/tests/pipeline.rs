//! Join, ingest and re-cluster one presubmit build end to end.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::tempdir;
use triage_clustering::{AlgorithmRegistry, RULES_ALGORITHM_NAME, TEST_NAME_ALGORITHM_NAME};
use triage_config::TestNameRuleConfig;
use triage_core::{
    BuildResult, Failure, LUCI_CV_SYSTEM, ManualClock, PresubmitResult, PresubmitRunId, RuleRecord,
};
use triage_ingestion::{JoinOutcome, control_build_id, join_build_result, join_presubmit_results};
use triage_rules::{RulesCache, generate_rule_id, save_rule};
use triage_store::{ClusteringStateStore, SqliteStore};
use triaged::ingest::ingest_ready_build;
use triaged::recluster::recluster_project;

const PROJECT: &str = "chromium";

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 5, 16, 0, 0)
        .single()
        .expect("valid time")
}

fn parameterized_tests() -> TestNameRuleConfig {
    TestNameRuleConfig {
        name: "Google Test (Value-parameterized)".to_owned(),
        pattern: r"^ninja://(?P<target>[\w/]+:\w+)/(\w+/)?(?P<suite>\w+)\.(?P<case>\w+)/\w+$"
            .to_owned(),
        like_template: "ninja://${target}/%${suite}.${case}%".to_owned(),
    }
}

fn failures() -> Vec<Failure> {
    vec![
        Failure::new("ninja://chrome/test:browser_tests/Prefix/Suite.Case/0")
            .with_reason("Check failed: timeout after 30000 ms"),
        Failure::new("ninja://chrome/test:browser_tests/Prefix/Suite.Case/1")
            .with_reason("Check failed: timeout after 45000 ms"),
        Failure::new("ninja://chrome/test:unit_tests/Other.Case"),
    ]
}

#[test]
fn presubmit_build_is_joined_ingested_and_reclustered() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(SqliteStore::open_with_clock(
        temp.path().join("triage.sqlite"),
        clock.clone(),
    )?);
    let registry = AlgorithmRegistry::new(&[parameterized_tests()])?;
    let rules = RulesCache::new(store.clone(), clock.clone(), Duration::seconds(30));

    let build_id = control_build_id("cr-buildbucket.appspot.com", 8_812_345);
    let build = BuildResult {
        host: "cr-buildbucket.appspot.com".to_owned(),
        id: 8_812_345,
        creation_time: Some(start_time()),
        project: PROJECT.to_owned(),
    };
    let outcome = join_build_result(store.as_ref(), PROJECT, &build_id, true, build)?;
    assert_eq!(outcome, JoinOutcome::Pending);

    let err = ingest_ready_build(
        store.as_ref(),
        &registry,
        &rules,
        PROJECT,
        &build_id,
        failures(),
        2,
    )
    .expect_err("build is not ready");
    assert!(err.to_string().contains("awaiting presubmit result"), "{err}");

    let presubmit = PresubmitResult {
        presubmit_run_id: Some(PresubmitRunId {
            system: LUCI_CV_SYSTEM.to_owned(),
            id: "chromium/4242-1-abcdef".to_owned(),
        }),
        status: "FAILED".to_owned(),
        owner: "user".to_owned(),
        critical: true,
        creation_time: Some(start_time()),
    };
    let outcomes = join_presubmit_results(store.as_ref(), PROJECT, vec![(build_id.clone(), presubmit)])?;
    assert!(matches!(outcomes.as_slice(), [JoinOutcome::Ready(_)]));

    let summary = ingest_ready_build(
        store.as_ref(),
        &registry,
        &rules,
        PROJECT,
        &build_id,
        failures(),
        2,
    )?;
    assert_eq!(summary.created_chunks.len(), 2);

    let first = store
        .read_state(PROJECT, &summary.created_chunks[0])?
        .expect("first chunk");
    assert_eq!(first.partition_time, start_time());
    let test_name_cluster = |index: usize| {
        first.clustering.clusters[index]
            .iter()
            .find(|id| id.algorithm == TEST_NAME_ALGORITHM_NAME)
            .cloned()
    };
    // Both instances of the parameterized test share a test name cluster.
    assert!(test_name_cluster(0).is_some());
    assert_eq!(test_name_cluster(0), test_name_cluster(1));

    clock.advance(Duration::minutes(1));
    let rule = save_rule(
        store.as_ref(),
        &RuleRecord {
            project: PROJECT.to_owned(),
            rule_id: generate_rule_id(),
            definition: r#"reason LIKE "Check failed: timeout%""#.to_owned(),
            is_active: true,
            creation_time: None,
            last_updated: None,
            source_cluster: None,
        },
    )?;
    clock.advance(Duration::minutes(1));

    let reclustered = recluster_project(store.as_ref(), &registry, &rules, PROJECT, 10)?;
    assert_eq!(reclustered.scanned, 2);
    assert_eq!(reclustered.updated, 2);

    let first = store
        .read_state(PROJECT, &summary.created_chunks[0])?
        .expect("first chunk");
    assert_eq!(first.clustering.rules_version, rule.last_updated);
    for clusters in &first.clustering.clusters {
        assert!(
            clusters
                .iter()
                .any(|id| id.algorithm == RULES_ALGORITHM_NAME && id.id == rule.rule_id)
        );
    }
    let second = store
        .read_state(PROJECT, &summary.created_chunks[1])?
        .expect("second chunk");
    assert!(
        second.clustering.clusters[0]
            .iter()
            .all(|id| id.algorithm != RULES_ALGORITHM_NAME)
    );
    Ok(())
}
