//! Lease-based distributed mutual exclusion
//!
//! The lease is a single row in the `leases` table. Acquiring inserts the row
//! with `IF NOT EXISTS`; releasing deletes it with `IF owner = <owner>`. The
//! store's linearizable conditional write on that row is the only arbitration
//! between concurrent starters, and the table's default TTL is the only way a
//! lease left behind by a crashed holder is freed.

use crate::cql::{Delete, Insert, Select};
use crate::migration::schema::LEASES_TABLE;
use crate::{CqlSession, StoreError};

/// Lease row key used for migrations
pub const MIGRATION_LEASE_KEY: &str = "migration";

/// Current lease row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub owner: String,
    pub value: Option<String>,
}

pub struct LeaseManager<'a> {
    session: &'a dyn CqlSession,
    keyspace: &'a str,
}

impl<'a> LeaseManager<'a> {
    pub fn new(session: &'a dyn CqlSession, keyspace: &'a str) -> Self {
        Self { session, keyspace }
    }

    /// Try to take the migration lease for `owner`
    ///
    /// Returns `Ok(true)` if the lease row was inserted, `Ok(false)` if some
    /// owner (possibly `owner` itself from an earlier run) already holds it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the conditional insert cannot be executed.
    pub fn acquire(&self, owner: &str) -> Result<bool, StoreError> {
        log::debug!("Trying to acquire migration lease as {}", owner);
        let insert = Insert::into(self.keyspace, LEASES_TABLE)
            .value("name", MIGRATION_LEASE_KEY)
            .value("owner", owner)
            .if_not_exists();

        let acquired = self.session.execute(&insert.into())?.was_applied();
        log::debug!("Migration lease acquired: {}", acquired);
        Ok(acquired)
    }

    /// Release the lease if `owner` still holds it
    ///
    /// A lease that already expired, or that is now held by someone else, is
    /// left untouched and this still returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the conditional delete cannot be executed.
    pub fn release(&self, owner: &str) -> Result<(), StoreError> {
        log::debug!("Releasing migration lease held by {}", owner);
        let delete = Delete::from(self.keyspace, LEASES_TABLE)
            .where_eq("name", MIGRATION_LEASE_KEY)
            .only_if_eq("owner", owner);

        if !self.session.execute(&delete.into())?.was_applied() {
            log::debug!("Migration lease was no longer held by {}", owner);
        }
        Ok(())
    }

    /// Read the current lease, if any
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the lease table cannot be read.
    pub fn holder(&self) -> Result<Option<Lease>, StoreError> {
        let select = Select::columns(&["name", "owner", "value"])
            .from(self.keyspace, LEASES_TABLE)
            .where_eq("name", MIGRATION_LEASE_KEY);

        let rows = self.session.execute(&select.into())?.into_rows();
        Ok(rows.first().and_then(|row| {
            Some(Lease {
                name: row.get_text(0)?.to_string(),
                owner: row.get_text(1)?.to_string(),
                value: row.get_text(2).map(str::to_string),
            })
        }))
    }
}
