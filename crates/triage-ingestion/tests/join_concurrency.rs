//! Concurrent build and presubmit notifications against one database.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;
use tempfile::tempdir;
use triage_core::{BuildResult, LUCI_CV_SYSTEM, PresubmitResult, PresubmitRunId};
use triage_ingestion::{JoinOutcome, control_build_id, join_build_result, join_presubmit_results};
use triage_store::{SqliteStore, Transactor};

const BUILDS: i64 = 25;
const PROJECT: &str = "testproject";

fn build_result(id: i64) -> BuildResult {
    BuildResult {
        host: "buildbucket".to_owned(),
        id,
        creation_time: Some(Utc::now()),
        project: PROJECT.to_owned(),
    }
}

fn presubmit_result(id: i64) -> PresubmitResult {
    PresubmitResult {
        presubmit_run_id: Some(PresubmitRunId {
            system: LUCI_CV_SYSTEM.to_owned(),
            id: format!("{PROJECT}/{id}-1-abc"),
        }),
        status: "SUCCEEDED".to_owned(),
        owner: "automation".to_owned(),
        critical: false,
        creation_time: Some(Utc::now()),
    }
}

fn spawn_notifier(
    path: &Path,
    barrier: Arc<Barrier>,
    presubmit: bool,
) -> thread::JoinHandle<Vec<JoinOutcome>> {
    let path = path.to_path_buf();
    thread::spawn(move || {
        // Each notifier has its own connection, like separate processes.
        let store = SqliteStore::open(&path).expect("open store");
        barrier.wait();
        (1..=BUILDS)
            .map(|id| {
                let build_id = control_build_id("buildbucket", id);
                if presubmit {
                    join_presubmit_results(&store, PROJECT, vec![(build_id, presubmit_result(id))])
                        .expect("join presubmit")
                        .remove(0)
                } else {
                    join_build_result(&store, PROJECT, &build_id, true, build_result(id))
                        .expect("join build")
                }
            })
            .collect()
    })
}

#[test]
fn concurrent_notifications_join_exactly_once() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("control.sqlite");
    SqliteStore::open(&path).expect("create schema");

    let barrier = Arc::new(Barrier::new(2));
    let builds = spawn_notifier(&path, Arc::clone(&barrier), false);
    let presubmits = spawn_notifier(&path, barrier, true);
    let builds = builds.join().expect("build notifier");
    let presubmits = presubmits.join().expect("presubmit notifier");

    for (index, (build, presubmit)) in builds.iter().zip(&presubmits).enumerate() {
        let ready = [build, presubmit]
            .iter()
            .filter(|outcome| matches!(outcome, JoinOutcome::Ready(_)))
            .count();
        assert_eq!(ready, 1, "build {} joined {ready} times", index + 1);
        assert!(!matches!(build, JoinOutcome::Duplicate));
        assert!(!matches!(presubmit, JoinOutcome::Duplicate));
    }

    let store = SqliteStore::open(&path).expect("reopen store");
    let build_ids: Vec<String> = (1..=BUILDS)
        .map(|id| control_build_id("buildbucket", id))
        .collect();
    let entries = store.read(PROJECT, &build_ids).expect("read");
    for entry in entries {
        let entry = entry.expect("entry exists");
        assert!(entry.is_ready(), "{} is not ready", entry.build_id);
        assert!(entry.build_result.is_some());
        assert!(entry.presubmit_result.is_some());
    }
}
