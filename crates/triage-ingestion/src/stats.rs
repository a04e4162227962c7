use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use triage_store::ControlStatsSource;

use crate::IngestionError;

/// Hours of history reported by default.
pub const PRESUBMIT_JOIN_STATS_HOURS: usize = 24;

/// Longest window that can be requested, one week.
pub const MAX_JOIN_STATS_HOURS: usize = 24 * 7;

/// Presubmit join progress of one project. Index `i` of each vector counts
/// builds whose control record was created between `i` and `i + 1` hours
/// ago.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinStatistics {
    pub total_by_hour: Vec<i64>,
    pub awaiting_build_by_hour: Vec<i64>,
    pub awaiting_presubmit_result_by_hour: Vec<i64>,
}

impl JoinStatistics {
    fn zeroed(hours: usize) -> Self {
        Self {
            total_by_hour: vec![0; hours],
            awaiting_build_by_hour: vec![0; hours],
            awaiting_presubmit_result_by_hour: vec![0; hours],
        }
    }
}

/// Reads join statistics for presubmit builds created in the last `hours`
/// hours before `now`, by project.
pub fn read_presubmit_join_statistics(
    source: &dyn ControlStatsSource,
    now: DateTime<Utc>,
    hours: usize,
) -> Result<BTreeMap<String, JoinStatistics>, IngestionError> {
    let out_of_range = || {
        IngestionError::InvalidInput(format!(
            "{hours} hours is out of range 1..={MAX_JOIN_STATS_HOURS}"
        ))
    };
    if hours == 0 || hours > MAX_JOIN_STATS_HOURS {
        return Err(out_of_range());
    }
    let since = i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(out_of_range)?;
    let entries = source.presubmit_entries_created_since(since)?;

    let mut by_project: BTreeMap<String, JoinStatistics> = BTreeMap::new();
    for entry in entries {
        let Some(created) = entry.creation_time else {
            continue;
        };
        let age = now - created;
        if age < Duration::zero() {
            continue;
        }
        let Ok(hour) = usize::try_from(age.num_hours()) else {
            continue;
        };
        if hour >= hours {
            continue;
        }

        let stats = by_project
            .entry(entry.project.clone())
            .or_insert_with(|| JoinStatistics::zeroed(hours));
        stats.total_by_hour[hour] += 1;
        if entry.awaiting_build_result() {
            stats.awaiting_build_by_hour[hour] += 1;
        }
        if entry.awaiting_presubmit_result() {
            stats.awaiting_presubmit_result_by_hour[hour] += 1;
        }
    }

    Ok(by_project)
}
