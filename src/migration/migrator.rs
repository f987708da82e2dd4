//! Migrator - lease-coordinated migration runs

use crate::migration::client::{default_factory, ClientFactory, LeaseGuard, MigrationClient};
use crate::migration::ledger::{MigrationLedger, MigrationStatus};
use crate::migration::schema::SchemaInitializer;
use crate::migration::source::{load_migrations, MigrationSource};
use crate::migration::status::MigrationOverview;
use crate::migration::{by_name, Migration, MigrationError, MigrationOrder};
use crate::{Cluster, SessionGuard};
use std::fs;
use uuid::Uuid;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Result of a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Another process holds the migration lease; nothing was done
    LeaseUnavailable,
    /// The lease was held and every pending migration was run
    Completed {
        /// Migrations executed by this run, in order
        applied: Vec<String>,
        /// Migrations the store accepted but reported as not applied, recorded `FAILED`
        failed: Vec<String>,
        /// Migrations skipped because the ledger already has them `APPLIED`
        skipped: Vec<String>,
    },
}

impl MigrationOutcome {
    /// Names applied by this run, empty when the lease was unavailable
    #[must_use]
    pub fn applied(&self) -> &[String] {
        match self {
            MigrationOutcome::LeaseUnavailable => &[],
            MigrationOutcome::Completed { applied, .. } => applied,
        }
    }

    /// Names this run recorded `FAILED` without an execution error
    #[must_use]
    pub fn failed(&self) -> &[String] {
        match self {
            MigrationOutcome::LeaseUnavailable => &[],
            MigrationOutcome::Completed { failed, .. } => failed,
        }
    }
}

/// Applies pending migrations while holding the cluster-wide migration lease
///
/// Each call to [`Migrator::execute`] opens its own session, creates the
/// keyspace and control tables if needed, and only proceeds if it wins the
/// lease. Starters that lose return [`MigrationOutcome::LeaseUnavailable`]
/// immediately; they neither wait nor retry.
///
/// # Example
///
/// ```rust
/// use harbormaster::memory::MemoryCluster;
/// use harbormaster::migration::{Migration, MigrationOutcome, Migrator};
///
/// let cluster = MemoryCluster::new();
/// let migrations = vec![
///     Migration::new("002_add_email.cql", "alter table users add email text"),
///     Migration::new("001_users.cql", "create table users (id uuid primary key)"),
/// ];
///
/// let outcome = Migrator::new().execute(&cluster, "app", &migrations).unwrap();
/// assert_eq!(outcome.applied(), ["001_users.cql", "002_add_email.cql"]);
///
/// // Already applied migrations are skipped on the next run
/// let outcome = Migrator::new().execute(&cluster, "app", &migrations).unwrap();
/// assert!(matches!(outcome, MigrationOutcome::Completed { applied, .. } if applied.is_empty()));
/// ```
pub struct Migrator {
    replication_factor: Option<u32>,
    factory: ClientFactory,
    order: MigrationOrder,
}

impl Default for Migrator {
    fn default() -> Self {
        Self {
            replication_factor: None,
            factory: default_factory(),
            order: by_name(),
        }
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replication factor used if the keyspace has to be created
    #[must_use]
    pub fn with_replication_factor(mut self, replication_factor: u32) -> Self {
        self.replication_factor = Some(replication_factor);
        self
    }

    /// Replace the client built for each run
    #[must_use]
    pub fn with_factory(mut self, factory: ClientFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Replace the order in which pending migrations are applied
    #[must_use]
    pub fn with_order(mut self, order: MigrationOrder) -> Self {
        self.order = order;
        self
    }

    /// Apply every migration from `source` that the ledger does not record as applied
    ///
    /// Migrations run in the configured order. The first execution error is
    /// recorded in the ledger, stops the batch and is returned; migrations
    /// after it are left for the next run. A statement the store accepts but
    /// reports as not applied is recorded `FAILED` and the batch continues. The lease is released on every path once it
    /// was acquired, and the session is always closed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the store is unreachable, the schema cannot
    /// be created, the source cannot be listed, a migration fails, or the lease
    /// cannot be released after an otherwise successful run.
    pub fn execute(
        &self,
        cluster: &dyn Cluster,
        keyspace: &str,
        source: &dyn MigrationSource,
    ) -> Result<MigrationOutcome, MigrationError> {
        let guard = SessionGuard::connect(cluster)?;
        let owner = unique_client_id();

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::run_span(keyspace, &owner).entered();

        let client = (self.factory)(guard.session(), keyspace, &owner);
        client.init(self.replication_factor)?;

        let Some(lease) = LeaseGuard::acquire(client.as_ref())? else {
            log::info!(
                "Migration lease for keyspace {} is held by another process, skipping migrations",
                keyspace
            );
            return Ok(MigrationOutcome::LeaseUnavailable);
        };
        log::debug!("Acquired migration lease for keyspace {} as {}", keyspace, owner);

        let result = self.apply_pending(client.as_ref(), source);

        match (result, lease.release()) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                log::error!(
                    "Failed to release migration lease after failed run: {}",
                    release_error
                );
                Err(e)
            }
        }
    }

    fn apply_pending(
        &self,
        client: &dyn MigrationClient,
        source: &dyn MigrationSource,
    ) -> Result<MigrationOutcome, MigrationError> {
        let already_applied = client.applied_migrations()?;
        let (done, pending): (Vec<Migration>, Vec<Migration>) = load_migrations(source, &self.order)?
            .into_iter()
            .partition(|m| already_applied.contains(m.name()));

        let skipped: Vec<String> = done.iter().map(|m| m.name().to_string()).collect();
        for name in &skipped {
            log::debug!("Skipping already applied migration {}", name);
        }

        let mut applied = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();
        for migration in &pending {
            match client.run_migration(migration)? {
                MigrationStatus::Applied => applied.push(migration.name().to_string()),
                _ => failed.push(migration.name().to_string()),
            }
        }

        if !failed.is_empty() {
            log::warn!("{} migration(s) were not applied by the store", failed.len());
        }
        if applied.is_empty() {
            log::info!("No pending migrations ({} already applied)", skipped.len());
        } else {
            log::info!(
                "Applied {} migration(s), {} already applied",
                applied.len(),
                skipped.len()
            );
        }
        Ok(MigrationOutcome::Completed {
            applied,
            failed,
            skipped,
        })
    }

    /// Compare `source` with the ledger without taking the lease
    ///
    /// Creates the keyspace and control tables if needed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the store is unreachable, the schema cannot
    /// be created, or the ledger or the source cannot be read.
    pub fn status(
        &self,
        cluster: &dyn Cluster,
        keyspace: &str,
        source: &dyn MigrationSource,
    ) -> Result<MigrationOverview, MigrationError> {
        let guard = SessionGuard::connect(cluster)?;
        let session = guard.session();

        SchemaInitializer::new(session.as_ref(), keyspace).init(self.replication_factor)?;
        let records = MigrationLedger::new(session.as_ref(), keyspace).records()?;
        let migrations = load_migrations(source, &self.order)?;

        Ok(MigrationOverview::new(records, &migrations))
    }
}

/// Lease owner id for this process
///
/// Tries the `HOSTNAME` environment variable, then the contents of
/// `/etc/hostname`, then falls back to a random UUID. Most shells set
/// `HOSTNAME` without exporting it and `/etc/hostname` exists only on Linux,
/// so outside containers the id is often the file contents or a UUID rather
/// than the resolved host name. Processes on one host that find a name share
/// it; acquiring the lease does not depend on the owner id, but releasing it
/// does.
pub fn unique_client_id() -> String {
    hostname().unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn hostname() -> Option<String> {
    let non_empty = |name: String| Some(name.trim().to_string()).filter(|n| !n.is_empty());

    std::env::var("HOSTNAME")
        .ok()
        .and_then(non_empty)
        .or_else(|| fs::read_to_string("/etc/hostname").ok().and_then(non_empty))
}
