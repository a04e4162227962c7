use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use triage_core::Clock;
use triage_store::RuleStore;

use crate::RuleError;
use crate::ruleset::Ruleset;

/// Per-project cache of ruleset snapshots. Snapshots are handed out as
/// `Arc`s and never modified; a refresh swaps in a new snapshot.
pub struct RulesCache {
    store: Arc<dyn RuleStore + Send + Sync>,
    clock: Arc<dyn Clock>,
    refresh_interval: Duration,
    snapshots: Mutex<HashMap<String, Arc<Ruleset>>>,
}

impl RulesCache {
    pub fn new(
        store: Arc<dyn RuleStore + Send + Sync>,
        clock: Arc<dyn Clock>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            refresh_interval,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// The ruleset of `project`. The cached snapshot is returned if it was
    /// loaded within the refresh interval and is at least
    /// `minimum_version`; otherwise the snapshot is refreshed first.
    pub fn ruleset(
        &self,
        project: &str,
        minimum_version: Option<DateTime<Utc>>,
    ) -> Result<Arc<Ruleset>, RuleError> {
        let mut snapshots = self.snapshots.lock().map_err(|_| RuleError::Poisoned)?;
        let now = self.clock.now();
        let cached = snapshots.get(project).cloned();

        if let Some(ruleset) = &cached {
            let fresh = now - ruleset.loaded_at() < self.refresh_interval;
            let recent_enough = minimum_version.is_none_or(|minimum| ruleset.version() >= minimum);
            if fresh && recent_enough {
                return Ok(Arc::clone(ruleset));
            }
        }

        let refreshed = match cached {
            Some(ruleset) => {
                let delta = self.store.read_delta(project, ruleset.version())?;
                tracing::debug!(
                    project,
                    changed = delta.len(),
                    since = %ruleset.version(),
                    "refreshing ruleset incrementally"
                );
                ruleset.apply_delta(&delta, now)
            }
            None => {
                let version = self.store.read_last_updated(project)?;
                let active = self.store.read_active(project)?;
                tracing::debug!(project, active = active.len(), "loading ruleset");
                Ruleset::new(project, &active, version, now)
            }
        };

        if let Some(minimum) = minimum_version {
            if refreshed.version() < minimum {
                return Err(RuleError::StaleRuleset {
                    project: project.to_owned(),
                    minimum,
                    available: refreshed.version(),
                });
            }
        }

        let refreshed = Arc::new(refreshed);
        snapshots.insert(project.to_owned(), Arc::clone(&refreshed));
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;
    use triage_core::{ManualClock, RuleRecord, starting_epoch};
    use triage_store::SqliteStore;

    use super::*;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0)
            .single()
            .expect("valid time")
    }

    fn rule(id_digit: char, definition: &str) -> RuleRecord {
        RuleRecord {
            project: "testproject".to_owned(),
            rule_id: id_digit.to_string().repeat(32),
            definition: definition.to_owned(),
            is_active: true,
            creation_time: None,
            last_updated: None,
            source_cluster: None,
        }
    }

    fn setup(temp: &tempfile::TempDir) -> (Arc<SqliteStore>, Arc<ManualClock>, RulesCache) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(
            SqliteStore::open_with_clock(temp.path().join("rules.sqlite"), clock.clone())
                .expect("open store"),
        );
        let cache = RulesCache::new(store.clone(), clock.clone(), Duration::seconds(120));
        (store, clock, cache)
    }

    #[test]
    fn empty_project_yields_starting_epoch_ruleset() {
        let temp = tempdir().expect("tempdir");
        let (_store, _clock, cache) = setup(&temp);

        let ruleset = cache.ruleset("testproject", None).expect("ruleset");
        assert!(ruleset.is_empty());
        assert_eq!(ruleset.version(), starting_epoch());
    }

    #[test]
    fn cached_snapshot_is_reused_within_refresh_interval() {
        let temp = tempdir().expect("tempdir");
        let (store, clock, cache) = setup(&temp);

        store.upsert_rule(&rule('a', "TRUE")).expect("rule a");
        let first = cache.ruleset("testproject", None).expect("first");
        assert_eq!(first.len(), 1);

        clock.advance(Duration::seconds(10));
        store.upsert_rule(&rule('b', "TRUE")).expect("rule b");
        let second = cache.ruleset("testproject", None).expect("second");
        assert!(Arc::ptr_eq(&first, &second));

        clock.advance(Duration::seconds(120));
        let third = cache.ruleset("testproject", None).expect("third");
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.len(), 2);
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn minimum_version_forces_refresh() {
        let temp = tempdir().expect("tempdir");
        let (store, clock, cache) = setup(&temp);

        let initial = cache.ruleset("testproject", None).expect("initial");
        clock.advance(Duration::seconds(1));
        let written = store.upsert_rule(&rule('a', "TRUE")).expect("rule a");
        let version = written.last_updated.expect("version");

        let refreshed = cache
            .ruleset("testproject", Some(version))
            .expect("refreshed");
        assert!(!Arc::ptr_eq(&initial, &refreshed));
        assert_eq!(refreshed.version(), version);
        assert!(refreshed.is_rule_active(&written.rule_id));
    }

    #[test]
    fn minimum_version_beyond_store_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let (_store, _clock, cache) = setup(&temp);

        let err = cache
            .ruleset("testproject", Some(start_time() + Duration::days(1)))
            .expect_err("no such version");
        assert!(matches!(err, RuleError::StaleRuleset { .. }));
    }

    #[test]
    fn incremental_refresh_applies_deactivations() {
        let temp = tempdir().expect("tempdir");
        let (store, clock, cache) = setup(&temp);

        store.upsert_rule(&rule('a', "TRUE")).expect("rule a");
        store.upsert_rule(&rule('b', "TRUE")).expect("rule b");
        let before = cache.ruleset("testproject", None).expect("before");
        assert_eq!(before.len(), 2);

        clock.advance(Duration::minutes(5));
        let mut deactivated = rule('a', "TRUE");
        deactivated.is_active = false;
        let written = store.upsert_rule(&deactivated).expect("deactivate");

        let after = cache.ruleset("testproject", None).expect("after");
        assert_eq!(after.len(), 1);
        assert!(!after.is_rule_active(&written.rule_id));
        assert_eq!(after.version(), written.last_updated.expect("version"));
        assert!(before.is_rule_active(&written.rule_id));
    }
}
