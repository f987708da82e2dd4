//! Migration ledger - the `migrations` table
//!
//! Each migration name has at most one row. The row is created once with a
//! conditional insert and its status only moves through conditional updates
//! guarded by `status IN ('APPLYING','FAILED')`, so a row that reached
//! `APPLIED` can never be changed again:
//!
//! ```text
//! (none) --record_attempt--> APPLYING --success--> APPLIED
//!                               |                     ^
//!                               +----failure----> FAILED --retry succeeds
//! ```

use crate::cql::{CqlValue, Insert, Row, Select, Update};
use crate::migration::schema::MIGRATIONS_TABLE;
use crate::migration::Migration;
use crate::{CqlSession, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Status of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MigrationStatus {
    Applying,
    Applied,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Applying => "APPLYING",
            MigrationStatus::Applied => "APPLIED",
            MigrationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "APPLYING" => Ok(MigrationStatus::Applying),
            "APPLIED" => Ok(MigrationStatus::Applied),
            "FAILED" => Ok(MigrationStatus::Failed),
            other => Err(StoreError::Other(format!(
                "Unknown migration status '{other}'"
            ))),
        }
    }
}

/// A row of the `migrations` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    pub name: String,
    /// Set by the store when the row was first inserted
    pub created_at: Option<DateTime<Utc>>,
    pub status: MigrationStatus,
    /// Statement text of the first attempt
    pub statement: Option<String>,
    /// Failure message of the last failed attempt
    pub reason: Option<String>,
}

impl MigrationRecord {
    /// Build a record from a row with columns `name, created_at, status, statement, reason`
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if `name` or `status` is missing or the status is unknown.
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        let name = row
            .get_text(0)
            .ok_or_else(|| StoreError::Other("migration row without name".to_string()))?;
        let status = row
            .get_text(2)
            .ok_or_else(|| StoreError::Other(format!("migration '{name}' has no status")))?
            .parse()?;

        Ok(Self {
            name: name.to_string(),
            created_at: row.get(1).and_then(CqlValue::as_timestamp),
            status,
            statement: row.get_text(3).map(str::to_string),
            reason: row.get_text(4).map(str::to_string),
        })
    }
}

pub struct MigrationLedger<'a> {
    session: &'a dyn CqlSession,
    keyspace: &'a str,
}

impl<'a> MigrationLedger<'a> {
    pub fn new(session: &'a dyn CqlSession, keyspace: &'a str) -> Self {
        Self { session, keyspace }
    }

    /// Names of the migrations whose status is `APPLIED`, in lexical order
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the ledger cannot be read.
    pub fn applied_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let select = Select::columns(&["name", "status"]).from(self.keyspace, MIGRATIONS_TABLE);

        Ok(self
            .session
            .execute(&select.into())?
            .rows()
            .iter()
            .filter(|row| row.get_text(1) == Some(MigrationStatus::Applied.as_str()))
            .filter_map(|row| row.get_text(0).map(str::to_string))
            .collect())
    }

    /// Insert an `APPLYING` row for `migration` unless one already exists
    ///
    /// Returns whether a new row was created. An existing row keeps its
    /// first `created_at`, `statement` and its current status.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the conditional insert cannot be executed.
    pub fn record_attempt(&self, migration: &Migration) -> Result<bool, StoreError> {
        let insert = Insert::into(self.keyspace, MIGRATIONS_TABLE)
            .value("name", migration.name())
            .value("created_at", CqlValue::Now)
            .value("status", MigrationStatus::Applying.as_str())
            .value("statement", migration.statement())
            .value("reason", CqlValue::Null)
            .if_not_exists();

        let created = self.session.execute(&insert.into())?.was_applied();
        if !created {
            log::debug!("Ledger already has a row for {}", migration.name());
        }
        Ok(created)
    }

    /// Set the status and reason of `migration`'s row unless it is `APPLIED`
    ///
    /// Returns whether the update was applied; a row already at `APPLIED` (or
    /// a missing row) is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the conditional update cannot be executed.
    pub fn record_outcome(
        &self,
        migration: &Migration,
        status: MigrationStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let update = Update::table(self.keyspace, MIGRATIONS_TABLE)
            .set("status", status.as_str())
            .set("reason", reason)
            .where_eq("name", migration.name())
            .only_if_in(
                "status",
                [
                    MigrationStatus::Applying.as_str(),
                    MigrationStatus::Failed.as_str(),
                ],
            );

        let updated = self.session.execute(&update.into())?.was_applied();
        if !updated {
            log::warn!(
                "Refused to record {} for {}: row is missing or already APPLIED",
                status,
                migration.name()
            );
        }
        Ok(updated)
    }

    /// Every ledger row, ordered by name
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the ledger cannot be read or holds a malformed row.
    pub fn records(&self) -> Result<Vec<MigrationRecord>, StoreError> {
        let select = Select::columns(&["name", "created_at", "status", "statement", "reason"])
            .from(self.keyspace, MIGRATIONS_TABLE);

        let mut records = self
            .session
            .execute(&select.into())?
            .rows()
            .iter()
            .map(MigrationRecord::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// The ledger row for `name`, if any
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the ledger cannot be read or the row is malformed.
    pub fn record(&self, name: &str) -> Result<Option<MigrationRecord>, StoreError> {
        let select = Select::columns(&["name", "created_at", "status", "statement", "reason"])
            .from(self.keyspace, MIGRATIONS_TABLE)
            .where_eq("name", name);

        self.session
            .execute(&select.into())?
            .rows()
            .first()
            .map(MigrationRecord::from_row)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use crate::migration::schema::SchemaInitializer;
    use crate::Cluster;
    use std::sync::Arc;

    fn setup() -> (MemoryCluster, Arc<dyn CqlSession>) {
        let cluster = MemoryCluster::new();
        let session = cluster.connect().unwrap();
        SchemaInitializer::new(session.as_ref(), "test").init(None).unwrap();
        (cluster, session)
    }

    #[test]
    fn test_applied_names_ignores_failed_and_incomplete_rows() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        let applied = Migration::new("001_initial_migration.cql", "a");
        let failed = Migration::new("002_add_stuff.cql", "b");
        let applying = Migration::new("003_in_flight.cql", "c");
        let applied_too = Migration::new("000_bootstrap.cql", "d");

        for m in [&applied, &failed, &applying, &applied_too] {
            ledger.record_attempt(m).unwrap();
        }
        ledger.record_outcome(&applied, MigrationStatus::Applied, None).unwrap();
        ledger.record_outcome(&applied_too, MigrationStatus::Applied, None).unwrap();
        ledger.record_outcome(&failed, MigrationStatus::Failed, Some("boom")).unwrap();

        let names: Vec<_> = ledger.applied_names().unwrap().into_iter().collect();
        assert_eq!(names, ["000_bootstrap.cql", "001_initial_migration.cql"]);
    }

    #[test]
    fn test_attempt_then_success() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        let m = Migration::new("001_init.cql", "create table foo (id uuid primary key)");

        assert!(ledger.record_attempt(&m).unwrap());
        let record = ledger.record("001_init.cql").unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Applying);
        assert!(record.created_at.is_some());
        assert_eq!(record.statement.as_deref(), Some(m.statement()));
        assert_eq!(record.reason, None);

        assert!(ledger.record_outcome(&m, MigrationStatus::Applied, None).unwrap());
        assert_eq!(
            ledger.record("001_init.cql").unwrap().unwrap().status,
            MigrationStatus::Applied
        );
    }

    #[test]
    fn test_failure_captures_reason_and_can_be_retried() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        let m = Migration::new("001_init.cql", "invalid migration");

        ledger.record_attempt(&m).unwrap();
        ledger.record_outcome(&m, MigrationStatus::Failed, Some("unit test")).unwrap();
        let failed = ledger.record("001_init.cql").unwrap().unwrap();
        assert_eq!(failed.status, MigrationStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("unit test"));

        assert!(!ledger.record_attempt(&m).unwrap());
        assert!(ledger.record_outcome(&m, MigrationStatus::Applied, None).unwrap());
        let applied = ledger.record("001_init.cql").unwrap().unwrap();
        assert_eq!(applied.status, MigrationStatus::Applied);
        assert_eq!(applied.reason, None);
    }

    #[test]
    fn test_applied_is_terminal() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        let m = Migration::new("001_init.cql", "a");

        ledger.record_attempt(&m).unwrap();
        ledger.record_outcome(&m, MigrationStatus::Applied, None).unwrap();

        assert!(!ledger.record_outcome(&m, MigrationStatus::Failed, Some("late")).unwrap());
        assert!(!ledger.record_attempt(&m).unwrap());
        let record = ledger.record("001_init.cql").unwrap().unwrap();
        assert_eq!(record.status, MigrationStatus::Applied);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn test_second_attempt_keeps_first_row() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");

        ledger.record_attempt(&Migration::new("001_init.cql", "first")).unwrap();
        let before = ledger.record("001_init.cql").unwrap().unwrap();
        ledger
            .record_outcome(&Migration::new("001_init.cql", "first"), MigrationStatus::Failed, None)
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!ledger.record_attempt(&Migration::new("001_init.cql", "second")).unwrap());

        let after = ledger.record("001_init.cql").unwrap().unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.statement.as_deref(), Some("first"));
        assert_eq!(after.status, MigrationStatus::Failed);
    }

    #[test]
    fn test_outcome_for_unknown_migration_is_refused() {
        let (cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");

        assert!(!ledger
            .record_outcome(&Migration::new("404.cql", "x"), MigrationStatus::Applied, None)
            .unwrap());
        assert_eq!(cluster.row_count("test", MIGRATIONS_TABLE), 0);
    }

    #[test]
    fn test_ledger_statements() {
        let (cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        let m = Migration::new("001_initial_migration.cql", "create table foo (id uuid PRIMARY KEY)");

        ledger.record_attempt(&m).unwrap();
        ledger.record_outcome(&m, MigrationStatus::Applied, None).unwrap();

        let executed = cluster.executed();
        let n = executed.len();
        assert_eq!(
            executed[n - 2],
            "INSERT INTO test.migrations (name,created_at,status,statement,reason) \
             VALUES ('001_initial_migration.cql',toTimestamp(now()),'APPLYING',\
             'create table foo (id uuid PRIMARY KEY)',null) IF NOT EXISTS"
        );
        assert_eq!(
            executed[n - 1],
            "UPDATE test.migrations SET status='APPLIED',reason=null \
             WHERE name='001_initial_migration.cql' IF status IN ('APPLYING','FAILED')"
        );
    }

    #[test]
    fn test_records_are_sorted() {
        let (_cluster, session) = setup();
        let ledger = MigrationLedger::new(session.as_ref(), "test");
        for name in ["b", "c", "a"] {
            ledger.record_attempt(&Migration::new(name, "x")).unwrap();
        }
        let names: Vec<_> = ledger.records().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }
}
