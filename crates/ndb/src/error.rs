//! Error types for the network state database
//!
//! NIST 800-53 Rev5 [SI-11]: Error Handling - Structured error types with contextual information

use thiserror::Error;

/// Errors that can occur in ndb
#[derive(Debug, Error)]
pub enum NdbError {
    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store backend error (connection, query or unsupported backend)
    #[error("Store error: {0}")]
    Store(String),

    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A match or key referenced a column the table does not have
    #[error("Unknown field {field} in table {table}")]
    UnknownField { table: &'static str, field: String },

    /// A shorthand key could not be interpreted for the entity type
    #[error("Invalid key for {table}: {reason}")]
    InvalidKey { table: &'static str, reason: String },

    /// The engine was closed or never finished initializing
    #[error("Engine is closed")]
    Closed,

    /// The dispatch loop terminated on an unrecoverable error
    #[error("Dispatch loop failed: {0}")]
    Fatal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ndb operations
pub type Result<T> = std::result::Result<T, NdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NdbError::Netlink("bind failed".to_string());
        assert_eq!(err.to_string(), "Netlink error: bind failed");
    }

    #[test]
    fn test_unknown_field_display() {
        let err = NdbError::UnknownField {
            table: "interfaces",
            field: "bogus".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown field bogus in table interfaces");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: NdbError = io.into();
        assert!(matches!(err, NdbError::Io(_)));
    }
}
