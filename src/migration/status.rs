//! Migration status reporting

use crate::migration::{Migration, MigrationRecord, MigrationStatus};
use serde::Serialize;

/// Ledger state compared against a migration source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOverview {
    /// Ledger rows with status `APPLIED`
    pub applied: Vec<MigrationRecord>,

    /// Ledger rows with status `FAILED`
    pub failed: Vec<MigrationRecord>,

    /// Source migrations not yet `APPLIED`, in application order
    ///
    /// Failed migrations and migrations left `APPLYING` by a crashed run are
    /// pending too; the next run retries them.
    pub pending: Vec<String>,
}

impl MigrationOverview {
    /// Build an overview from ledger rows and the ordered source migrations
    #[must_use]
    pub fn new(records: Vec<MigrationRecord>, migrations: &[Migration]) -> Self {
        let (applied, rest): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.status == MigrationStatus::Applied);
        let failed = rest
            .into_iter()
            .filter(|r| r.status == MigrationStatus::Failed)
            .collect();
        let pending = migrations
            .iter()
            .filter(|m| !applied.iter().any(|r| r.name == m.name()))
            .map(|m| m.name().to_string())
            .collect();

        Self {
            applied,
            failed,
            pending,
        }
    }

    /// Check if every source migration is applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Name of the last applied migration in lexical order
    #[must_use]
    pub fn latest_applied(&self) -> Option<&str> {
        self.applied.iter().map(|r| r.name.as_str()).max()
    }

    #[must_use]
    pub fn next_pending(&self) -> Option<&str> {
        self.pending.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: MigrationStatus) -> MigrationRecord {
        MigrationRecord {
            name: name.to_string(),
            created_at: None,
            status,
            statement: None,
            reason: None,
        }
    }

    #[test]
    fn test_overview_splits_records() {
        let records = vec![
            record("001.cql", MigrationStatus::Applied),
            record("002.cql", MigrationStatus::Failed),
            record("003.cql", MigrationStatus::Applying),
        ];
        let migrations = [
            Migration::new("001.cql", "a"),
            Migration::new("002.cql", "b"),
            Migration::new("003.cql", "c"),
            Migration::new("004.cql", "d"),
        ];

        let overview = MigrationOverview::new(records, &migrations);
        assert_eq!(overview.applied.len(), 1);
        assert_eq!(overview.failed[0].name, "002.cql");
        assert_eq!(overview.pending, ["002.cql", "003.cql", "004.cql"]);
        assert_eq!(overview.latest_applied(), Some("001.cql"));
        assert_eq!(overview.next_pending(), Some("002.cql"));
        assert!(!overview.is_up_to_date());
    }

    #[test]
    fn test_overview_serializes_statuses() {
        let overview = MigrationOverview::new(
            vec![record("001.cql", MigrationStatus::Failed)],
            &[Migration::new("001.cql", "a")],
        );
        let json = serde_json::to_value(&overview).unwrap();
        assert_eq!(json["failed"][0]["status"], "FAILED");
        assert_eq!(json["failed"][0]["reason"], serde_json::Value::Null);
        assert_eq!(json["pending"][0], "001.cql");
    }

    #[test]
    fn test_up_to_date_when_nothing_pending() {
        let overview = MigrationOverview::new(
            vec![record("001.cql", MigrationStatus::Applied)],
            &[Migration::new("001.cql", "a")],
        );
        assert!(overview.is_up_to_date());
        assert_eq!(overview.next_pending(), None);
    }
}
