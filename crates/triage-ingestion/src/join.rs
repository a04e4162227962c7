use triage_core::{BuildResult, Entry, PresubmitResult};
use triage_store::{ControlTransaction, Transactor};

use crate::IngestionError;

/// What a join notification did to its build's control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The result was recorded; its partner has not arrived yet.
    Pending,
    /// This notification completed the join. Ingestion of the build should
    /// start now. Returned by exactly one notification per build.
    Ready(Entry),
    /// The result had already been recorded. Nothing was written.
    Duplicate,
}

/// `{buildbucket host}/{build id}`, the control record key of a build.
pub fn control_build_id(host: &str, id: i64) -> String {
    format!("{host}/{id}")
}

fn read_one(
    tx: &dyn ControlTransaction,
    project: &str,
    build_id: &str,
) -> Result<Option<Entry>, IngestionError> {
    let mut entries = tx.read(project, &[build_id.to_owned()])?;
    Ok(entries.pop().flatten())
}

fn write(tx: &mut dyn ControlTransaction, entry: Entry) -> Result<JoinOutcome, IngestionError> {
    tx.insert_or_update(&entry)?;
    if !entry.is_ready() {
        return Ok(JoinOutcome::Pending);
    }
    let mut written = entry;
    written.last_updated = Some(tx.commit_time());
    written.creation_time = written.creation_time.or(written.last_updated);
    Ok(JoinOutcome::Ready(written))
}

/// Records the completion of a build. `is_presubmit` says whether the build
/// is part of a presubmit run, in which case ingestion also waits for the
/// run's result.
pub fn join_build_result(
    store: &impl Transactor,
    project: &str,
    build_id: &str,
    is_presubmit: bool,
    build_result: BuildResult,
) -> Result<JoinOutcome, IngestionError> {
    let outcome = store.read_then_write(|tx| {
        let entry = match read_one(tx, project, build_id)? {
            Some(existing) if existing.build_result.is_some() => {
                return Ok(JoinOutcome::Duplicate);
            }
            Some(existing) if existing.is_presubmit != is_presubmit => {
                return Err(IngestionError::Conflict {
                    build_id: build_id.to_owned(),
                    message: format!(
                        "build reports is_presubmit = {is_presubmit}, but a presubmit result \
                         was already recorded"
                    ),
                });
            }
            Some(mut existing) => {
                existing.build_result = Some(build_result);
                existing
            }
            None => {
                let mut entry = Entry::new(project, build_id);
                entry.is_presubmit = is_presubmit;
                entry.build_result = Some(build_result);
                entry
            }
        };
        write(tx, entry)
    })?;

    log_outcome(project, build_id, "build", &outcome);
    Ok(outcome)
}

/// Records the completion of presubmit runs for each of their builds.
/// All builds are updated in one transaction. Outcomes are returned in
/// input order.
pub fn join_presubmit_results(
    store: &impl Transactor,
    project: &str,
    results: Vec<(String, PresubmitResult)>,
) -> Result<Vec<JoinOutcome>, IngestionError> {
    let build_ids: Vec<String> = results.iter().map(|(id, _)| id.clone()).collect();

    let outcomes = store.read_then_write(|tx| {
        let existing = tx.read(project, &build_ids)?;
        let mut outcomes = Vec::with_capacity(results.len());

        for ((build_id, presubmit_result), existing) in results.into_iter().zip(existing) {
            let entry = match existing {
                Some(entry) if entry.presubmit_result.is_some() => {
                    outcomes.push(JoinOutcome::Duplicate);
                    continue;
                }
                Some(entry) if !entry.is_presubmit => {
                    return Err(IngestionError::Conflict {
                        build_id,
                        message: "presubmit result received for a build that is not part of \
                                  a presubmit run"
                            .to_owned(),
                    });
                }
                Some(mut entry) => {
                    entry.presubmit_result = Some(presubmit_result);
                    entry
                }
                None => {
                    let mut entry = Entry::new(project, build_id);
                    entry.is_presubmit = true;
                    entry.presubmit_result = Some(presubmit_result);
                    entry
                }
            };
            outcomes.push(write(tx, entry)?);
        }
        Ok(outcomes)
    })?;

    for (build_id, outcome) in build_ids.iter().zip(&outcomes) {
        log_outcome(project, build_id, "presubmit", outcome);
    }
    Ok(outcomes)
}

fn log_outcome(project: &str, build_id: &str, source: &str, outcome: &JoinOutcome) {
    match outcome {
        JoinOutcome::Pending => {
            tracing::info!(project, build_id, source, "recorded result, awaiting join");
        }
        JoinOutcome::Ready(_) => {
            tracing::info!(project, build_id, source, "join complete, build ready for ingestion");
        }
        JoinOutcome::Duplicate => {
            tracing::warn!(project, build_id, source, "duplicate notification ignored");
        }
    }
}
