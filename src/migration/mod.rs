//! Lease-coordinated migrations
//!
//! This module applies ordered schema-change scripts to a keyspace, using two
//! control tables in that keyspace:
//!
//! - `leases` holds the cluster-wide migration lease, taken with a conditional
//!   insert and expiring after 180 seconds
//! - `migrations` is the ledger of attempts and outcomes, one row per migration
//!
//! # Example
//!
//! ```rust
//! use harbormaster::memory::MemoryCluster;
//! use harbormaster::migration::{DirectorySource, Migrator};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let dir = tempfile::tempdir()?;
//! # std::fs::write(dir.path().join("001_init.cql"), "create table foo (id uuid primary key)")?;
//! let cluster = MemoryCluster::new();
//! let source = DirectorySource::new(dir.path());
//!
//! let outcome = Migrator::new().execute(&cluster, "app", &source)?;
//! assert_eq!(outcome.applied(), ["001_init.cql"]);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod lease;
pub mod ledger;
pub mod migration;
pub mod migrator;
pub mod schema;
pub mod source;
pub mod startup;
pub mod status;

pub use client::{default_factory, ClientFactory, DefaultMigrationClient, LeaseGuard, MigrationClient};
pub use error::MigrationError;
pub use lease::{Lease, LeaseManager};
pub use ledger::{MigrationLedger, MigrationRecord, MigrationStatus};
pub use migration::{by_name, Migration, MigrationOrder};
pub use migrator::{unique_client_id, MigrationOutcome, Migrator};
pub use schema::SchemaInitializer;
pub use source::{load_migrations, DirectorySource, FileResource, MigrationResource, MigrationSource};
pub use startup::startup_migrations;
pub use status::MigrationOverview;
