use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use triage_core::{ClusterId, RuleRecord, is_valid_project, is_valid_rule_id, starting_epoch};

use crate::{SqliteStore, StoreError, from_micros, to_micros};

/// Persistence of failure association rules. Rules are never deleted;
/// they are deactivated.
pub trait RuleStore {
    /// All active rules of a project, ordered by rule ID.
    fn read_active(&self, project: &str) -> Result<Vec<RuleRecord>, StoreError>;

    /// Rules, active or not, with `last_updated > since`. `since` must not
    /// be earlier than the starting epoch.
    fn read_delta(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RuleRecord>, StoreError>;

    /// The latest `last_updated` over all rules of the project, or the
    /// starting epoch if it has none.
    fn read_last_updated(&self, project: &str) -> Result<DateTime<Utc>, StoreError>;

    fn read_rule(&self, project: &str, rule_id: &str) -> Result<Option<RuleRecord>, StoreError>;

    /// All rules of a project, active or not, ordered by rule ID.
    fn read_all(&self, project: &str) -> Result<Vec<RuleRecord>, StoreError>;

    /// Inserts or updates a rule and returns it as stored.
    fn upsert_rule(&self, rule: &RuleRecord) -> Result<RuleRecord, StoreError>;
}

const RULE_COLUMNS: &str = "project, rule_id, definition, is_active, creation_time, last_updated, \
                            source_cluster_algorithm, source_cluster_id";

struct RawRule {
    project: String,
    rule_id: String,
    definition: String,
    is_active: bool,
    creation_time: i64,
    last_updated: i64,
    source_algorithm: Option<String>,
    source_id: Option<String>,
}

impl RawRule {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project: row.get(0)?,
            rule_id: row.get(1)?,
            definition: row.get(2)?,
            is_active: row.get(3)?,
            creation_time: row.get(4)?,
            last_updated: row.get(5)?,
            source_algorithm: row.get(6)?,
            source_id: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<RuleRecord, StoreError> {
        let source_cluster = match (self.source_algorithm, self.source_id) {
            (Some(algorithm), Some(id)) => Some(ClusterId { algorithm, id }),
            _ => None,
        };
        Ok(RuleRecord {
            project: self.project,
            rule_id: self.rule_id,
            definition: self.definition,
            is_active: self.is_active,
            creation_time: Some(from_micros(self.creation_time)?),
            last_updated: Some(from_micros(self.last_updated)?),
            source_cluster,
        })
    }
}

fn query_rules(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<RuleRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM failure_association_rules WHERE {filter} ORDER BY rule_id"
    ))?;
    let rows = stmt.query_map(params, RawRule::from_row)?;
    let raw = rows.collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawRule::into_record).collect()
}

fn validate_rule(rule: &RuleRecord) -> Result<(), StoreError> {
    if !is_valid_project(&rule.project) {
        return Err(StoreError::InvalidInput("project must be valid".to_owned()));
    }
    if !is_valid_rule_id(&rule.rule_id) {
        return Err(StoreError::InvalidInput(
            "rule ID must be 32 lowercase hexadecimal characters".to_owned(),
        ));
    }
    if rule.definition.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "rule definition must be specified".to_owned(),
        ));
    }
    if let Some(source) = &rule.source_cluster {
        source
            .validate()
            .map_err(|err| StoreError::InvalidInput(format!("source cluster: {err}")))?;
    }
    Ok(())
}

impl RuleStore for SqliteStore {
    fn read_active(&self, project: &str) -> Result<Vec<RuleRecord>, StoreError> {
        let conn = self.connection()?;
        query_rules(&conn, "project = ?1 AND is_active = 1", params![project])
    }

    fn read_delta(
        &self,
        project: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RuleRecord>, StoreError> {
        if since < starting_epoch() {
            return Err(StoreError::InvalidInput(
                "since must not be before the starting epoch".to_owned(),
            ));
        }
        let conn = self.connection()?;
        query_rules(
            &conn,
            "project = ?1 AND last_updated > ?2",
            params![project, to_micros(since)],
        )
    }

    fn read_last_updated(&self, project: &str) -> Result<DateTime<Utc>, StoreError> {
        let conn = self.connection()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(last_updated) FROM failure_association_rules WHERE project = ?1",
            params![project],
            |row| row.get(0),
        )?;
        match latest {
            Some(micros) => from_micros(micros),
            None => Ok(starting_epoch()),
        }
    }

    fn read_rule(&self, project: &str, rule_id: &str) -> Result<Option<RuleRecord>, StoreError> {
        let conn = self.connection()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM failure_association_rules \
                     WHERE project = ?1 AND rule_id = ?2"
                ),
                params![project, rule_id],
                RawRule::from_row,
            )
            .optional()?;
        raw.map(RawRule::into_record).transpose()
    }

    fn read_all(&self, project: &str) -> Result<Vec<RuleRecord>, StoreError> {
        let conn = self.connection()?;
        query_rules(&conn, "project = ?1", params![project])
    }

    fn upsert_rule(&self, rule: &RuleRecord) -> Result<RuleRecord, StoreError> {
        validate_rule(rule)?;

        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Rule versions must strictly increase per project so that a delta
        // read from the previous maximum never misses a write.
        let previous_max: Option<i64> = tx.query_row(
            "SELECT MAX(last_updated) FROM failure_association_rules WHERE project = ?1",
            params![rule.project],
            |row| row.get(0),
        )?;
        let mut last_updated = to_micros(self.now());
        if let Some(previous_max) = previous_max {
            last_updated = last_updated.max(previous_max + 1);
        }

        let (source_algorithm, source_id) = match &rule.source_cluster {
            Some(cluster) => (Some(cluster.algorithm.as_str()), Some(cluster.id.as_str())),
            None => (None, None),
        };

        tx.execute(
            r#"
            INSERT INTO failure_association_rules (
                project, rule_id, definition, is_active, creation_time, last_updated,
                source_cluster_algorithm, source_cluster_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7)
            ON CONFLICT(project, rule_id) DO UPDATE SET
                definition = excluded.definition,
                is_active = excluded.is_active,
                last_updated = excluded.last_updated,
                source_cluster_algorithm = excluded.source_cluster_algorithm,
                source_cluster_id = excluded.source_cluster_id
            "#,
            params![
                rule.project,
                rule.rule_id,
                rule.definition,
                rule.is_active,
                last_updated,
                source_algorithm,
                source_id,
            ],
        )?;

        let stored = tx
            .query_row(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM failure_association_rules \
                     WHERE project = ?1 AND rule_id = ?2"
                ),
                params![rule.project, rule.rule_id],
                RawRule::from_row,
            )?
            .into_record()?;
        tx.commit()?;

        tracing::debug!(
            project = %stored.project,
            rule_id = %stored.rule_id,
            is_active = stored.is_active,
            "stored failure association rule"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;
    use triage_core::ManualClock;

    use super::*;

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0)
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

    fn open(temp: &tempfile::TempDir) -> (SqliteStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = SqliteStore::open_with_clock(temp.path().join("rules.sqlite"), clock.clone())
            .expect("open store");
        (store, clock)
    }

    #[test]
    fn empty_project_reports_starting_epoch() {
        let temp = tempdir().expect("tempdir");
        let (store, _clock) = open(&temp);

        assert_eq!(
            store.read_last_updated("testproject").expect("last updated"),
            starting_epoch()
        );
        assert!(store.read_active("testproject").expect("active").is_empty());
        assert!(
            store
                .read_delta("testproject", starting_epoch())
                .expect("delta")
                .is_empty()
        );
    }

    #[test]
    fn upsert_sets_versions_and_preserves_creation_time() {
        let temp = tempdir().expect("tempdir");
        let (store, clock) = open(&temp);

        let mut r = rule('a', r#"test = "a""#);
        r.source_cluster = Some(ClusterId::new("testname-v4", "0123456789abcdef"));
        let created = store.upsert_rule(&r).expect("insert");
        assert_eq!(created.creation_time, Some(start_time()));
        assert_eq!(created.last_updated, Some(start_time()));
        assert_eq!(created.source_cluster, r.source_cluster);

        clock.advance(Duration::minutes(1));
        r.is_active = false;
        let updated = store.upsert_rule(&r).expect("update");
        assert_eq!(updated.creation_time, Some(start_time()));
        assert_eq!(updated.last_updated, Some(start_time() + Duration::minutes(1)));
        assert!(!updated.is_active);

        assert!(store.read_active("testproject").expect("active").is_empty());
        assert_eq!(store.read_all("testproject").expect("all").len(), 1);
        assert_eq!(
            store.read_last_updated("testproject").expect("last updated"),
            start_time() + Duration::minutes(1)
        );
    }

    #[test]
    fn versions_strictly_increase_when_clock_stands_still() {
        let temp = tempdir().expect("tempdir");
        let (store, _clock) = open(&temp);

        let first = store.upsert_rule(&rule('a', "TRUE")).expect("first");
        let second = store.upsert_rule(&rule('b', "TRUE")).expect("second");
        let first_version = first.last_updated.expect("set");
        let second_version = second.last_updated.expect("set");
        assert_eq!(second_version, first_version + Duration::microseconds(1));

        let delta = store
            .read_delta("testproject", first_version)
            .expect("delta");
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].rule_id, second.rule_id);
    }

    #[test]
    fn delta_includes_deactivated_rules() {
        let temp = tempdir().expect("tempdir");
        let (store, clock) = open(&temp);

        store.upsert_rule(&rule('a', "TRUE")).expect("a");
        store.upsert_rule(&rule('b', "TRUE")).expect("b");
        let checkpoint = store.read_last_updated("testproject").expect("version");

        clock.advance(Duration::seconds(10));
        let mut deactivated = rule('a', "TRUE");
        deactivated.is_active = false;
        store.upsert_rule(&deactivated).expect("deactivate");

        let delta = store.read_delta("testproject", checkpoint).expect("delta");
        assert_eq!(delta.len(), 1);
        assert!(!delta[0].is_active);
    }

    #[test]
    fn delta_rejects_times_before_starting_epoch() {
        let temp = tempdir().expect("tempdir");
        let (store, _clock) = open(&temp);

        let err = store
            .read_delta("testproject", starting_epoch() - Duration::seconds(1))
            .expect_err("before epoch");
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[test]
    fn upsert_rejects_invalid_rules() {
        let temp = tempdir().expect("tempdir");
        let (store, _clock) = open(&temp);

        let mut bad_id = rule('a', "TRUE");
        bad_id.rule_id = "ABC".to_owned();
        assert!(store.upsert_rule(&bad_id).is_err());

        let mut bad_project = rule('a', "TRUE");
        bad_project.project = "Bad Project".to_owned();
        assert!(store.upsert_rule(&bad_project).is_err());

        assert!(store.upsert_rule(&rule('a', "  ")).is_err());
        assert!(store.read_rule("testproject", &"a".repeat(32)).expect("read").is_none());
    }

    #[test]
    fn projects_are_isolated() {
        let temp = tempdir().expect("tempdir");
        let (store, _clock) = open(&temp);

        let mut other = rule('a', "TRUE");
        other.project = "otherproject".to_owned();
        store.upsert_rule(&other).expect("other");

        assert!(store.read_active("testproject").expect("active").is_empty());
        assert_eq!(
            store.read_last_updated("testproject").expect("version"),
            starting_epoch()
        );
        assert!(
            store
                .read_rule("otherproject", &"a".repeat(32))
                .expect("read")
                .is_some()
        );
    }
}
