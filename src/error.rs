//! Error types for the connection registry.
//!
//! All failures are defined with `thiserror`. Driver failures coming from
//! `sqlx` are passed through unmodified in [`DbError::Driver`], except inside
//! administrative operations where they are wrapped together with the
//! attempted operation and target database.

use crate::db::admin::AdminOperation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Database connection '{connection_id}' not found. Available connections: {available}")]
    ConnectionNotFound {
        connection_id: String,
        /// Comma separated list of configured names, or "none"
        available: String,
    },

    #[error(
        "No superuser connection available. Configure a connection with is_superuser=true"
    )]
    NoSuperuserConnection,

    #[error(
        "Connection '{connection_id}' does not have superuser privileges. Set is_superuser=true in the connection configuration."
    )]
    NotSuperuser { connection_id: String },

    #[error("Cannot drop protected database '{database}'")]
    ProtectedDatabase { database: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Administrative operation '{operation}' failed for database '{database}': {source}")]
    AdministrativeOperation {
        operation: AdminOperation,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Driver(#[from] sqlx::Error),
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found<'a>(
        connection_id: impl Into<String>,
        available: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let available: Vec<&str> = available.into_iter().collect();
        Self::ConnectionNotFound {
            connection_id: connection_id.into(),
            available: if available.is_empty() {
                "none".to_string()
            } else {
                available.join(", ")
            },
        }
    }

    /// Create a not-superuser error.
    pub fn not_superuser(connection_id: impl Into<String>) -> Self {
        Self::NotSuperuser {
            connection_id: connection_id.into(),
        }
    }

    /// Create a protected database error.
    pub fn protected_database(database: impl Into<String>) -> Self {
        Self::ProtectedDatabase {
            database: database.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap a driver failure raised during an administrative operation.
    pub fn administrative(
        operation: AdminOperation,
        database: impl Into<String>,
        source: sqlx::Error,
    ) -> Self {
        Self::AdministrativeOperation {
            operation,
            database: database.into(),
            source,
        }
    }

    /// The underlying driver error, if any.
    pub fn driver_error(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Driver(err) => Some(err),
            Self::AdministrativeOperation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Get an actionable suggestion for driver-level failures.
    pub fn suggestion(&self) -> Option<&'static str> {
        self.driver_error().map(driver_suggestion)
    }

    /// Check if this error is retryable.
    ///
    /// Nothing in this crate retries; this only classifies the failure for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.driver_error(),
            Some(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

/// Generate a helpful suggestion for a driver error.
fn driver_suggestion(error: &sqlx::Error) -> &'static str {
    if let sqlx::Error::Database(db_err) = error {
        // 42501 insufficient_privilege, 55006 object_in_use, 42P04 duplicate_database
        match db_err.code().as_deref() {
            Some("42501") => return "Use a connection whose role has CREATEDB or superuser rights",
            Some("55006") => return "Disconnect other sessions or drop with force=true",
            Some("42P04") => return "The database already exists",
            _ => {}
        }
    }

    if matches!(error, sqlx::Error::PoolTimedOut) {
        return "Increase pool_size/max_overflow or pool_timeout";
    }

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return "Check that the PostgreSQL server is running and accessible";
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password of the connection";
    }

    if error_str.contains("does not exist") {
        return "Check that the database name exists";
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it";
    }

    "Check the connection settings: host, port, username, password, database"
}

/// Result type alias for registry operations.
pub type DbResult<T> = Result<T, DbError>;
