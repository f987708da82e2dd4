//! Per-run coordination client
//!
//! A [`MigrationClient`] bundles schema setup, the migration lease and the
//! ledger for one `(session, keyspace, owner)` triple. The [`Migrator`] builds
//! one per run through a [`ClientFactory`], which lets embedders and tests
//! substitute their own client.
//!
//! [`Migrator`]: crate::migration::Migrator

use crate::migration::lease::LeaseManager;
use crate::migration::ledger::{MigrationLedger, MigrationStatus};
use crate::migration::schema::SchemaInitializer;
use crate::migration::{Migration, MigrationError};
use crate::{CqlSession, Statement};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Coordination operations used by the migrator
pub trait MigrationClient {
    /// Create the keyspace and control tables if absent and select the keyspace
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Schema` or `MigrationError::InvalidKeyspace`.
    fn init(&self, replication_factor: Option<u32>) -> Result<(), MigrationError>;

    /// Try to take the migration lease; `Ok(false)` means another process holds it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the store cannot be reached.
    fn acquire_lock(&self) -> Result<bool, MigrationError>;

    /// Release the migration lease if this client's owner holds it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the store cannot be reached.
    fn release_lock(&self) -> Result<(), MigrationError>;

    /// Names of migrations recorded as `APPLIED`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the ledger cannot be read.
    fn applied_migrations(&self) -> Result<BTreeSet<String>, MigrationError>;

    /// Record the attempt, execute the statement and record the outcome
    ///
    /// Returns the recorded status: `Applied`, or `Failed` when the store
    /// accepted the statement but reported it as not applied.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ExecutionFailed` after marking the ledger row
    /// `FAILED`, or `MigrationError::Store` if the ledger itself cannot be
    /// written.
    fn run_migration(&self, migration: &Migration) -> Result<MigrationStatus, MigrationError>;
}

/// Builds the client for a run from its session, keyspace and owner id
pub type ClientFactory =
    Arc<dyn Fn(Arc<dyn CqlSession>, &str, &str) -> Box<dyn MigrationClient> + Send + Sync>;

/// Factory producing [`DefaultMigrationClient`]
pub fn default_factory() -> ClientFactory {
    Arc::new(
        |session: Arc<dyn CqlSession>, keyspace: &str, owner: &str| -> Box<dyn MigrationClient> {
            Box::new(DefaultMigrationClient::new(session, keyspace, owner))
        },
    )
}

/// Client backed by [`SchemaInitializer`], [`LeaseManager`] and [`MigrationLedger`]
pub struct DefaultMigrationClient {
    session: Arc<dyn CqlSession>,
    keyspace: String,
    owner: String,
}

impl DefaultMigrationClient {
    pub fn new(session: Arc<dyn CqlSession>, keyspace: &str, owner: &str) -> Self {
        Self {
            session,
            keyspace: keyspace.to_string(),
            owner: owner.to_string(),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn leases(&self) -> LeaseManager<'_> {
        LeaseManager::new(self.session.as_ref(), &self.keyspace)
    }

    fn ledger(&self) -> MigrationLedger<'_> {
        MigrationLedger::new(self.session.as_ref(), &self.keyspace)
    }

    fn record_failure(&self, migration: &Migration, reason: Option<&str>) {
        #[cfg(feature = "metrics")]
        METRICS.record_failed();

        if let Err(e) = self
            .ledger()
            .record_outcome(migration, MigrationStatus::Failed, reason)
        {
            log::error!(
                "Could not record FAILED status for {}: {}",
                migration.name(),
                e
            );
        }
    }
}

impl MigrationClient for DefaultMigrationClient {
    fn init(&self, replication_factor: Option<u32>) -> Result<(), MigrationError> {
        SchemaInitializer::new(self.session.as_ref(), &self.keyspace).init(replication_factor)
    }

    fn acquire_lock(&self) -> Result<bool, MigrationError> {
        let acquired = self.leases().acquire(&self.owner)?;

        #[cfg(feature = "metrics")]
        METRICS.record_lease_attempt(acquired);

        Ok(acquired)
    }

    fn release_lock(&self) -> Result<(), MigrationError> {
        Ok(self.leases().release(&self.owner)?)
    }

    fn applied_migrations(&self) -> Result<BTreeSet<String>, MigrationError> {
        Ok(self.ledger().applied_names()?)
    }

    fn run_migration(&self, migration: &Migration) -> Result<MigrationStatus, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_span(migration.name()).entered();

        self.ledger().record_attempt(migration)?;

        let start = Instant::now();
        match self.session.execute(&Statement::raw(migration.statement())) {
            Ok(result) if result.was_applied() => {
                self.ledger()
                    .record_outcome(migration, MigrationStatus::Applied, None)?;

                #[cfg(feature = "metrics")]
                METRICS.record_applied(start.elapsed());

                log::info!(
                    "Applied migration {} in {}ms",
                    migration.name(),
                    start.elapsed().as_millis()
                );
                Ok(MigrationStatus::Applied)
            }
            Ok(_) => {
                log::error!("Migration {} was not applied by the store", migration.name());
                self.record_failure(migration, None);
                Ok(MigrationStatus::Failed)
            }
            Err(error) => {
                log::error!("Migration {} failed: {}", migration.name(), error);
                let reason = Some(error.message()).filter(|m| !m.is_empty());
                self.record_failure(migration, reason);
                Err(MigrationError::ExecutionFailed {
                    name: migration.name().to_string(),
                    error,
                })
            }
        }
    }
}

/// Holds the migration lease until released or dropped
///
/// Prefer [`LeaseGuard::release`], which reports release failures; dropping
/// the guard releases too but can only log them.
pub struct LeaseGuard<'a> {
    client: &'a dyn MigrationClient,
    released: bool,
}

impl<'a> LeaseGuard<'a> {
    /// Acquire the lease through `client`; `Ok(None)` if another process holds it
    ///
    /// # Errors
    ///
    /// Returns the client's error if the acquire attempt fails.
    pub fn acquire(client: &'a dyn MigrationClient) -> Result<Option<Self>, MigrationError> {
        Ok(client.acquire_lock()?.then(|| Self {
            client,
            released: false,
        }))
    }

    /// Release the lease
    ///
    /// # Errors
    ///
    /// Returns the client's error if the release fails.
    pub fn release(mut self) -> Result<(), MigrationError> {
        self.released = true;
        self.client.release_lock()
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.client.release_lock() {
            log::warn!("Failed to release migration lease: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cql::ResultSet;
    use crate::memory::MemoryCluster;
    use crate::migration::ledger::MigrationLedger;
    use crate::{Cluster, StoreError};
    use std::sync::Mutex;

    fn client(cluster: &MemoryCluster, owner: &str) -> DefaultMigrationClient {
        let client = DefaultMigrationClient::new(cluster.connect().unwrap(), "test", owner);
        client.init(None).unwrap();
        client
    }

    /// Session that reports every raw statement as not applied
    struct Unapplied(Arc<dyn CqlSession>);

    impl CqlSession for Unapplied {
        fn execute(&self, statement: &Statement) -> Result<ResultSet, StoreError> {
            match statement {
                Statement::Raw(_) => Ok(ResultSet::not_applied(Vec::new())),
                other => self.0.execute(other),
            }
        }

        fn close(&self) {
            self.0.close();
        }
    }

    #[test]
    fn test_successful_migration_is_recorded_applied() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster, "host-a");
        let m = Migration::new("001_init.cql", "create table foo (id uuid primary key)");

        assert_eq!(client.run_migration(&m).unwrap(), MigrationStatus::Applied);

        assert_eq!(cluster.execution_count(m.statement()), 1);
        assert!(client.applied_migrations().unwrap().contains("001_init.cql"));
    }

    #[test]
    fn test_failed_migration_records_store_message() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster, "host-a");
        let m = Migration::new("001_init.cql", "invalid migration");
        cluster.fail_statement("invalid migration", "line 1:0 no viable alternative at input 'invalid'");

        let err = client.run_migration(&m).unwrap_err();
        assert!(matches!(err, MigrationError::ExecutionFailed { ref name, .. } if name == "001_init.cql"));

        let session = cluster.connect().unwrap();
        let record = MigrationLedger::new(session.as_ref(), "test")
            .record("001_init.cql")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(
            record.reason.as_deref(),
            Some("line 1:0 no viable alternative at input 'invalid'")
        );
    }

    #[test]
    fn test_empty_error_message_stores_no_reason() {
        let cluster = MemoryCluster::new();
        let client = client(&cluster, "host-a");
        cluster.fail_statement("boom", "");

        assert!(client.run_migration(&Migration::new("001.cql", "boom")).is_err());

        let session = cluster.connect().unwrap();
        let record = MigrationLedger::new(session.as_ref(), "test")
            .record("001.cql")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn test_not_applied_statement_is_recorded_failed() {
        let cluster = MemoryCluster::new();
        let session: Arc<dyn CqlSession> = Arc::new(Unapplied(cluster.connect().unwrap()));
        let client = DefaultMigrationClient::new(session, "test", "host-a");
        client.init(None).unwrap();

        let status = client
            .run_migration(&Migration::new("001.cql", "update foo set a = 1 where id = 1 if a = 0"))
            .unwrap();
        assert_eq!(status, MigrationStatus::Failed);
        assert!(client.applied_migrations().unwrap().is_empty());

        let session = cluster.connect().unwrap();
        let record = MigrationLedger::new(session.as_ref(), "test")
            .record("001.cql")
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MigrationStatus::Failed);
        assert_eq!(record.reason, None);
    }

    #[test]
    fn test_lease_is_per_owner() {
        let cluster = MemoryCluster::new();
        let a = client(&cluster, "host-a");
        let b = client(&cluster, "host-b");

        assert!(a.acquire_lock().unwrap());
        assert!(!b.acquire_lock().unwrap());
        b.release_lock().unwrap();
        assert!(!b.acquire_lock().unwrap());
        a.release_lock().unwrap();
        assert!(b.acquire_lock().unwrap());
    }

    #[derive(Default)]
    struct Recording {
        acquire: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MigrationClient for Recording {
        fn init(&self, _: Option<u32>) -> Result<(), MigrationError> {
            self.calls.lock().unwrap().push("init");
            Ok(())
        }

        fn acquire_lock(&self) -> Result<bool, MigrationError> {
            self.calls.lock().unwrap().push("acquire");
            Ok(self.acquire)
        }

        fn release_lock(&self) -> Result<(), MigrationError> {
            self.calls.lock().unwrap().push("release");
            Ok(())
        }

        fn applied_migrations(&self) -> Result<BTreeSet<String>, MigrationError> {
            Ok(BTreeSet::new())
        }

        fn run_migration(&self, _: &Migration) -> Result<MigrationStatus, MigrationError> {
            Ok(MigrationStatus::Applied)
        }
    }

    #[test]
    fn test_lease_guard_releases_on_drop() {
        let client = Recording {
            acquire: true,
            ..Recording::default()
        };
        {
            let _guard = LeaseGuard::acquire(&client).unwrap().unwrap();
        }
        assert_eq!(*client.calls.lock().unwrap(), ["acquire", "release"]);
    }

    #[test]
    fn test_lease_guard_releases_once() {
        let client = Recording {
            acquire: true,
            ..Recording::default()
        };
        LeaseGuard::acquire(&client).unwrap().unwrap().release().unwrap();
        assert_eq!(*client.calls.lock().unwrap(), ["acquire", "release"]);
    }

    #[test]
    fn test_lease_guard_without_lease_releases_nothing() {
        let client = Recording::default();
        assert!(LeaseGuard::acquire(&client).unwrap().is_none());
        assert_eq!(*client.calls.lock().unwrap(), ["acquire"]);
    }

    #[test]
    fn test_losing_client_keeps_same_owner_lease_intact() {
        let cluster = MemoryCluster::new();
        let winner = client(&cluster, "host-a");
        let loser = client(&cluster, "host-a");

        let held = LeaseGuard::acquire(&winner).unwrap().unwrap();
        assert!(LeaseGuard::acquire(&loser).unwrap().is_none());

        assert_eq!(cluster.row_count("test", "leases"), 1);
        assert!(cluster.executed().iter().all(|s| !s.starts_with("DELETE")));
        assert!(!client(&cluster, "host-b").acquire_lock().unwrap());

        held.release().unwrap();
        assert_eq!(cluster.row_count("test", "leases"), 0);
    }
}
