//! # Harbormaster
//!
//! Lease-coordinated schema migrations for Cassandra-style stores.
//!
//! Any number of processes can start against the same keyspace at once. They
//! race for a single lease row with a conditional insert; the winner applies
//! the pending migrations in order and records each attempt in a ledger
//! table, the others return immediately. Coordination relies only on the
//! store's linearizable single-row conditional writes and row TTL.
//!
//! The store is reached through the [`Cluster`] and [`CqlSession`] traits.
//! [`memory::MemoryCluster`] implements them in-process (feature `memory`, on
//! by default). No CQL driver is bundled: to migrate a live cluster, the
//! embedder implements both traits over its driver, as shown in [`session`].
//!
//! ```rust
//! use harbormaster::memory::MemoryCluster;
//! use harbormaster::migration::{Migration, Migrator};
//!
//! let cluster = MemoryCluster::new();
//! let migrations = vec![Migration::new(
//!     "001_users.cql",
//!     "create table users (id uuid primary key, name text)",
//! )];
//!
//! let outcome = Migrator::new().execute(&cluster, "app", &migrations).unwrap();
//! assert_eq!(outcome.applied(), ["001_users.cql"]);
//! ```

pub mod config;
pub mod cql;
pub mod health;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
#[cfg(any(feature = "metrics", feature = "tracing"))]
pub mod metrics;
pub mod migration;
pub mod retry;
pub mod session;

pub use config::MigratorConfig;
pub use cql::{CqlValue, ResultSet, Row, Statement};
pub use health::{check_health, ClusterState, HealthReport, HealthStatus, HostState};
pub use migration::{
    startup_migrations, Migration, MigrationError, MigrationOutcome, MigrationSource, Migrator,
};
pub use retry::Retryer;
pub use session::{Cluster, CqlSession, SessionGuard, StoreError};
