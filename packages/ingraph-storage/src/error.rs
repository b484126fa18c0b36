//! Error types for the graph store adapter.

use std::fmt;
use thiserror::Error;

/// Storage error kinds, matching the adapter's failure model: connection and
/// query/transient errors retry, schema and malformed-query errors surface
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused, timed out, or dropped mid-session.
    Connection,
    /// Query execution failed (syntax, constraint violation, or backend fault).
    Query,
    /// Schema initialization failed.
    Schema,
    /// Transaction could not commit or roll back cleanly.
    Transaction,
    /// Serialization/deserialization of node or edge properties.
    Serialization,
    /// Node or edge not found by identity.
    NotFound,
    /// Configuration error (bad URI, empty candidate list, ...).
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Query => "query",
            ErrorKind::Schema => "schema",
            ErrorKind::Transaction => "transaction",
            ErrorKind::Serialization => "serialization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type.
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
    /// `QuerySyntax`/constraint failures and schema errors are not retryable;
    /// connection and deadlock/leader-election failures are.
    pub retryable: bool,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, ErrorKind::Connection | ErrorKind::Transaction);
        Self {
            kind,
            message: message.into(),
            source: None,
            retryable,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Query, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message).retryable(false)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message).retryable(false)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message).retryable(false)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        // Busy/locked are transient; everything else (constraint violations,
        // malformed SQL) is permanent.
        let retryable = matches!(
            err,
            rusqlite::Error::SqliteFailure(ref e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
        );
        StorageError::new(ErrorKind::Query, format!("sqlite error: {err}"))
            .retryable(retryable)
            .with_source(err)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("json error: {err}")).with_source(err)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, StorageError>;
