//! Error types for geotrack.
//!
//! This module defines the crate-wide error type. Tracking failures that are
//! surfaced to consumers as state (permission denied, timeouts, ...) live in
//! [`crate::sampler::TrackingError`] instead; they are never fatal.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for geotrack operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Validation Errors ===
    /// A position sample failed validation before being stored.
    #[error("invalid sample: {reason}")]
    InvalidSample {
        /// Why the sample was rejected.
        reason: String,
    },

    /// An order record failed validation.
    #[error("invalid order: {reason}")]
    InvalidOrder {
        /// Why the order was rejected.
        reason: String,
    },

    /// An order with the same id already exists in the registry.
    #[error("order already exists: {id}")]
    DuplicateOrder {
        /// The conflicting order id.
        id: String,
    },

    /// A poller was configured with an unusable interval.
    #[error("invalid polling interval: {millis} ms")]
    InvalidInterval {
        /// The rejected interval in milliseconds.
        millis: u128,
    },

    /// A replay script line could not be parsed.
    #[error("invalid replay script at line {line}: {message}")]
    ReplayParse {
        /// 1-based line number.
        line: usize,
        /// Description of what went wrong.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for geotrack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a sample validation error.
    #[must_use]
    pub fn invalid_sample(reason: impl Into<String>) -> Self {
        Self::InvalidSample {
            reason: reason.into(),
        }
    }

    /// Create an order validation error.
    #[must_use]
    pub fn invalid_order(reason: impl Into<String>) -> Self {
        Self::InvalidOrder {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_sample("orderId is required");
        assert_eq!(err.to_string(), "invalid sample: orderId is required");

        let err = Error::internal("lock poisoned");
        assert_eq!(err.to_string(), "internal error: lock poisoned");
    }

    #[test]
    fn test_duplicate_order_display() {
        let err = Error::DuplicateOrder {
            id: "ORD-AB12C".to_string(),
        };
        assert!(err.to_string().contains("ORD-AB12C"));
    }

    #[test]
    fn test_invalid_interval_display() {
        let err = Error::InvalidInterval { millis: 0 };
        assert_eq!(err.to_string(), "invalid polling interval: 0 ms");
    }

    #[test]
    fn test_replay_parse_display() {
        let err = Error::ReplayParse {
            line: 3,
            message: "lat and lng are required".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid replay script at line 3: lat and lng are required"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "interval_ms must be greater than 0".to_string(),
        };
        assert!(err.to_string().contains("interval_ms"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
