//! Keyspace and control-table management

use crate::cql::{ColumnType, Statement, TableDef};
use crate::migration::MigrationError;
use crate::CqlSession;
use once_cell::sync::Lazy;
use regex::Regex;

/// Lease table name
pub const LEASES_TABLE: &str = "leases";

/// Ledger table name
pub const MIGRATIONS_TABLE: &str = "migrations";

/// Lifetime of a lease row in seconds
///
/// The store expires the row after this interval whether or not it was
/// released, so a crashed holder blocks other starters for at most this long.
pub const LEASE_TTL_SECONDS: u32 = 180;

/// Replication factor used when creating the keyspace without an explicit one
pub const DEFAULT_REPLICATION_FACTOR: u32 = 1;

static KEYSPACE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,47}$").expect("keyspace name pattern is valid")
});

/// Check that `keyspace` can be used unquoted in CQL
///
/// # Errors
///
/// Returns `MigrationError::InvalidKeyspace` for names the store would reject.
pub fn validate_keyspace(keyspace: &str) -> Result<(), MigrationError> {
    if KEYSPACE_NAME.is_match(keyspace) {
        Ok(())
    } else {
        Err(MigrationError::InvalidKeyspace(keyspace.to_string()))
    }
}

/// Definition of the `leases` table
pub fn leases_table(keyspace: &str) -> TableDef {
    TableDef::new(keyspace, LEASES_TABLE)
        .key("name", ColumnType::Text)
        .col("owner", ColumnType::Text)
        .col("value", ColumnType::Text)
        .default_ttl(LEASE_TTL_SECONDS)
}

/// Definition of the `migrations` ledger table
pub fn migrations_table(keyspace: &str) -> TableDef {
    TableDef::new(keyspace, MIGRATIONS_TABLE)
        .key("name", ColumnType::Text)
        .col("created_at", ColumnType::Timestamp)
        .col("status", ColumnType::Text)
        .col("statement", ColumnType::Text)
        .col("reason", ColumnType::Text)
}

/// Statements run by [`SchemaInitializer::init`], in order
pub fn schema_statements(keyspace: &str, replication_factor: Option<u32>) -> Vec<Statement> {
    vec![
        Statement::CreateKeyspace {
            keyspace: keyspace.to_string(),
            replication_factor: replication_factor.unwrap_or(DEFAULT_REPLICATION_FACTOR),
        },
        Statement::UseKeyspace(keyspace.to_string()),
        leases_table(keyspace).into(),
        migrations_table(keyspace).into(),
    ]
}

/// Creates the keyspace and the control tables
pub struct SchemaInitializer<'a> {
    session: &'a dyn CqlSession,
    keyspace: &'a str,
}

impl<'a> SchemaInitializer<'a> {
    pub fn new(session: &'a dyn CqlSession, keyspace: &'a str) -> Self {
        Self { session, keyspace }
    }

    /// Create the keyspace (SimpleStrategy) and both control tables if absent
    ///
    /// Every statement uses `IF NOT EXISTS`, so this is safe to call on each
    /// startup. The session is switched to the keyspace so that unqualified
    /// migration statements land in it. An existing keyspace keeps its
    /// replication settings.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidKeyspace` for a malformed name, or
    /// `MigrationError::Schema` if the store rejects any statement.
    pub fn init(&self, replication_factor: Option<u32>) -> Result<(), MigrationError> {
        validate_keyspace(self.keyspace)?;

        for statement in schema_statements(self.keyspace, replication_factor) {
            log::debug!("Executing schema statement: {}", statement);
            self.session
                .execute(&statement)
                .map_err(MigrationError::Schema)?;
        }
        Ok(())
    }
}
