//! Store session abstraction
//!
//! Provides the `CqlSession` trait that abstracts statement execution against a
//! Cassandra-style store, and the `Cluster` trait that opens sessions.
//!
//! The coordination layer never emulates compare-and-set locally: every
//! conditional write is a [`Statement`] with a precondition, and the session
//! implementation is responsible for evaluating it with linearizable
//! consistency on the single row it targets.
//!
//! # Connecting a CQL driver
//!
//! No driver ships with this crate. To migrate a live cluster, implement
//! [`Cluster`] and [`CqlSession`] over your driver: send the statement's
//! `Display` text as a simple query, map the `[applied]` column of
//! conditional writes to [`ResultSet::was_applied`], and map the other
//! columns to [`Row`](crate::Row)s. Use a serial consistency of `SERIAL` for
//! the conditional writes.
//!
//! ```rust
//! use harbormaster::{CqlSession, CqlValue, ResultSet, Row, Statement, StoreError};
//!
//! /// Stand-in for a driver's synchronous query call
//! struct Driver;
//!
//! impl Driver {
//!     fn query(&self, cql: &str) -> Result<(Vec<String>, Vec<Vec<Option<String>>>), String> {
//!         if cql.ends_with("IF NOT EXISTS") {
//!             Ok((vec!["[applied]".to_string()], vec![vec![Some("true".to_string())]]))
//!         } else {
//!             Ok((Vec::new(), Vec::new()))
//!         }
//!     }
//! }
//!
//! struct DriverSession(Driver);
//!
//! impl CqlSession for DriverSession {
//!     fn execute(&self, statement: &Statement) -> Result<ResultSet, StoreError> {
//!         let (columns, rows) = self.0.query(&statement.to_string()).map_err(StoreError::Other)?;
//!         let rows: Vec<Row> = rows
//!             .into_iter()
//!             .map(|values| {
//!                 let values = values
//!                     .into_iter()
//!                     .map(|v| v.map_or(CqlValue::Null, CqlValue::Text))
//!                     .collect();
//!                 Row::new(columns.clone(), values)
//!             })
//!             .collect();
//!
//!         let applied = rows
//!             .first()
//!             .and_then(|row| row.get_by_name("[applied]"))
//!             .map(|v| *v == CqlValue::Text("true".to_string()));
//!         Ok(match applied {
//!             Some(false) => ResultSet::not_applied(rows),
//!             _ => ResultSet::with_rows(rows),
//!         })
//!     }
//!
//!     fn close(&self) {}
//! }
//!
//! let session = DriverSession(Driver);
//! let result = session.execute(&Statement::raw("INSERT INTO ks.t (k) VALUES ('a') IF NOT EXISTS"))?;
//! assert!(result.was_applied());
//! # Ok::<(), StoreError>(())
//! ```

use crate::cql::{ResultSet, Statement};
use std::fmt;
use std::sync::Arc;

/// Store error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No host could serve the request
    Unavailable(String),
    /// The store rejected the statement (syntax, unknown keyspace or table, ...)
    InvalidQuery(String),
    /// The statement was accepted but failed while executing
    Execution(String),
    /// Other store errors
    Other(String),
}

impl StoreError {
    /// The store's message without the error-kind prefix
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            StoreError::Unavailable(s)
            | StoreError::InvalidQuery(s)
            | StoreError::Execution(s)
            | StoreError::Other(s) => s,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(s) => write!(f, "No host available: {s}"),
            StoreError::InvalidQuery(s) => write!(f, "Invalid query: {s}"),
            StoreError::Execution(s) => write!(f, "Execution error: {s}"),
            StoreError::Other(s) => write!(f, "Store error: {s}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for executing statements against the store
///
/// Implementations must be safe to share between coroutines; the orchestrator
/// itself only ever uses a session sequentially.
pub trait CqlSession: Send + Sync {
    /// Execute a statement
    ///
    /// For conditional writes the returned [`ResultSet::was_applied`] reports
    /// whether the precondition held.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be reached or rejects the statement.
    fn execute(&self, statement: &Statement) -> Result<ResultSet, StoreError>;

    /// Close the session, releasing its connections
    ///
    /// Calling `close` more than once has no further effect.
    fn close(&self);
}

/// Opens sessions against a store cluster
pub trait Cluster {
    /// Open a new session
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if no session could be established.
    fn connect(&self) -> Result<Arc<dyn CqlSession>, StoreError>;
}

/// Session guard that closes the session when dropped
pub struct SessionGuard {
    session: Arc<dyn CqlSession>,
}

impl SessionGuard {
    pub fn new(session: Arc<dyn CqlSession>) -> Self {
        Self { session }
    }

    /// Open a session from `cluster` and guard it
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the cluster cannot open a session.
    pub fn connect(cluster: &dyn Cluster) -> Result<Self, StoreError> {
        cluster.connect().map(Self::new)
    }

    /// Shared handle to the guarded session
    #[must_use]
    pub fn session(&self) -> Arc<dyn CqlSession> {
        Arc::clone(&self.session)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        log::debug!("Closing store session");
        self.session.close();
    }
}
