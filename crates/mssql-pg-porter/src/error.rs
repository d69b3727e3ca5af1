//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (missing connection strings, bad toggles, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Catalog introspection failed for a schema object
    #[error("Schema introspection failed: {0}")]
    SchemaIntrospection(String),

    /// A generated DDL statement failed on the target
    #[error("DDL failed for {object}: {message}")]
    Ddl { object: String, message: String },

    /// Reading a batch from the source failed
    #[error("Batch read failed for table {table} at offset {offset}: {message}")]
    BatchRead {
        table: String,
        offset: i64,
        message: String,
    },

    /// Writing a batch to the target failed
    #[error("Batch write failed for table {table}: {message}")]
    BatchWrite { table: String, message: String },

    /// Data validation error
    #[error("Validation failed: {0}")]
    Validation(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (socket setup, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration was cancelled
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Ddl error for a named object
    pub fn ddl(object: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::Ddl {
            object: object.into(),
            message: message.to_string(),
        }
    }

    /// Create a BatchRead error carrying the failing offset
    pub fn batch_read(table: impl Into<String>, offset: i64, message: impl ToString) -> Self {
        MigrateError::BatchRead {
            table: table.into(),
            offset,
            message: message.to_string(),
        }
    }

    /// Create a BatchWrite error
    pub fn batch_write(table: impl Into<String>, message: impl ToString) -> Self {
        MigrateError::BatchWrite {
            table: table.into(),
            message: message.to_string(),
        }
    }

    /// Whether this error represents cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MigrateError::Cancelled)
    }

    /// Render the error with its full source chain on one line per cause.
    ///
    /// Driver errors often wrap the actionable detail (a socket error, a
    /// server message) one or two levels down; the run log records this
    /// form while events carry the plain message.
    pub fn format_detailed(&self) -> String {
        let mut output = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            output.push_str(&format!("\n  caused by: {}", err));
            source = err.source();
        }
        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
