//! In-process migration execution on application startup

use crate::config::MigratorConfig;
use crate::migration::{DirectorySource, MigrationError, MigrationOutcome, Migrator};
use crate::Cluster;

/// Run migrations on application startup
///
/// Scans `config.migrations_dir` for files matching `config.file_pattern` and
/// applies the pending ones to `config.keyspace`. Designed to be called by
/// every instance of a deployment: the first to win the lease migrates, the
/// others return [`MigrationOutcome::LeaseUnavailable`] and carry on starting.
///
/// # Errors
///
/// Returns `MigrationError` if the directory or pattern is invalid or the run
/// fails; callers should refuse to start in that case.
///
/// # Example
///
/// ```rust,no_run
/// use harbormaster::memory::MemoryCluster;
/// use harbormaster::migration::startup_migrations;
/// use harbormaster::MigratorConfig;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = MigratorConfig::load()?;
///     let cluster = MemoryCluster::new();
///
///     startup_migrations(&cluster, &config)?;
///
///     // Continue with application startup...
///     Ok(())
/// }
/// ```
pub fn startup_migrations(
    cluster: &dyn Cluster,
    config: &MigratorConfig,
) -> Result<MigrationOutcome, MigrationError> {
    let source = DirectorySource::with_pattern(&config.migrations_dir, &config.file_pattern)?;

    let mut migrator = Migrator::new();
    if let Some(replication_factor) = config.replication_factor {
        migrator = migrator.with_replication_factor(replication_factor);
    }

    let outcome = migrator.execute(cluster, &config.keyspace, &source)?;
    match &outcome {
        MigrationOutcome::LeaseUnavailable => {
            log::info!("Another instance is migrating {}, continuing startup", config.keyspace);
        }
        MigrationOutcome::Completed { applied, failed, .. } => {
            if !failed.is_empty() {
                log::warn!("Migrations not applied by the store on startup: {:?}", failed);
            }
            if applied.is_empty() {
                log::debug!("No pending migrations to apply");
            } else {
                log::info!("Applied {} migration(s) on startup", applied.len());
            }
        }
    }
    Ok(outcome)
}
