//! Migration-specific error types

use crate::StoreError;

/// Migration-specific errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Keyspace or control-table creation failed
    Schema(StoreError),
    /// Keyspace name is not a valid CQL identifier
    InvalidKeyspace(String),
    /// Store failure while working with the lease or the ledger
    Store(StoreError),
    /// Migration statement failed during execution
    ExecutionFailed { name: String, error: StoreError },
    /// Migration directory not found
    FileNotFound(String),
    /// Invalid migration source configuration
    InvalidFormat(String),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Schema(e) => write!(f, "Schema initialization failed: {}", e),
            MigrationError::InvalidKeyspace(name) => {
                write!(
                    f,
                    "Invalid keyspace name '{}': expected a letter followed by up to 47 \
                     letters, digits or underscores",
                    name
                )
            }
            MigrationError::Store(e) => write!(f, "Store error: {}", e),
            MigrationError::ExecutionFailed { name, error } => {
                write!(f, "Migration '{}' failed during execution: {}", name, error)
            }
            MigrationError::FileNotFound(path) => write!(f, "Migration directory not found: {}", path),
            MigrationError::InvalidFormat(msg) => write!(f, "Invalid migration source: {}", msg),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Schema(e)
            | MigrationError::Store(e)
            | MigrationError::ExecutionFailed { error: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for MigrationError {
    fn from(error: StoreError) -> Self {
        MigrationError::Store(error)
    }
}
