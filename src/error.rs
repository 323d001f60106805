//! Error types for the database access layer.
//!
//! `DatabaseError` is the complete outward-facing vocabulary of the query
//! executor and the transaction orchestrator: raw driver errors are always
//! classified into one of its five variants before they reach a caller.

use crate::models::QueryParam;
use serde::Serialize;
use thiserror::Error;

/// Timeout reported when the driver does not say how long it waited.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Classified database failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Timeout: {message} (limit {timeout_ms} ms)")]
    Timeout { message: String, timeout_ms: u64 },

    #[error("Integrity violation: {message}")]
    Integrity {
        message: String,
        /// e.g. "users.email" or "messages_ibfk_1"
        constraint: Option<String>,
    },

    #[error("Permission denied: {operation} on {resource} - {message}")]
    Permission {
        message: String,
        operation: String,
        resource: String,
    },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        sql: String,
        params: Vec<QueryParam>,
    },
}

/// Discriminant of a [`DatabaseError`], used to name retryable kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Integrity,
    Permission,
    Query,
}

impl ErrorKind {
    /// Every kind, in classification order.
    pub const ALL: [ErrorKind; 5] = [
        Self::Connection,
        Self::Timeout,
        Self::Integrity,
        Self::Permission,
        Self::Query,
    ];

    /// Type name as shown to API consumers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::Timeout => "TimeoutError",
            Self::Integrity => "IntegrityError",
            Self::Permission => "PermissionError",
            Self::Query => "QueryError",
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Integrity => "INTEGRITY_ERROR",
            Self::Permission => "PERMISSION_ERROR",
            Self::Query => "QUERY_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl DatabaseError {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error with the budget that was exceeded.
    pub fn timeout(message: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>, constraint: Option<String>) -> Self {
        Self::Integrity {
            message: message.into(),
            constraint,
        }
    }

    /// Create a permission error.
    pub fn permission(
        message: impl Into<String>,
        operation: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::Permission {
            message: message.into(),
            operation: operation.into(),
            resource: resource.into(),
        }
    }

    /// Create a query error carrying the statement that failed.
    pub fn query(message: impl Into<String>, sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self::Query {
            message: message.into(),
            sql: sql.into(),
            params,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Integrity { .. } => ErrorKind::Integrity,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Query { .. } => ErrorKind::Query,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Connection { message }
            | Self::Timeout { message, .. }
            | Self::Integrity { message, .. }
            | Self::Permission { message, .. }
            | Self::Query { message, .. } => message,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Help text for end users, if the kind has one.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Connection { .. } => Some(
                "Check the network connection and whether the database server is running.",
            ),
            Self::Timeout { .. } => {
                Some("The query took too long to complete. Try again later.")
            }
            Self::Permission { .. } => Some(
                "You do not have sufficient privileges for this operation. Contact the administrator.",
            ),
            Self::Integrity { .. } => Some(
                "The operation conflicts with existing data and cannot be completed.",
            ),
            Self::Query { .. } => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Build the `{success: false, error: {...}}` envelope returned by
    /// application-level data-access functions.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": ErrorPayload::from(self),
        })
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DatabaseError>;

/// Serializable view of a [`DatabaseError`] for API responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: &'static str,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<&'static str>,
    /// Whether the caller should offer a manual retry.
    pub retryable: bool,
}

impl From<&DatabaseError> for ErrorPayload {
    fn from(err: &DatabaseError) -> Self {
        Self {
            message: err.message().to_string(),
            code: err.code(),
            error_type: err.kind().name(),
            help: err.suggestion(),
            retryable: err.is_retryable(),
        }
    }
}

/// Invalid startup configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),

    #[error("Unknown database type for URL: {0}")]
    UnknownDatabaseType(String),

    #[error("Invalid pool options: {0}")]
    InvalidPoolOptions(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DatabaseError::connection("Could not connect to the database");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_retryable() {
        assert!(DatabaseError::timeout("query", 30_000).is_retryable());
        assert!(DatabaseError::connection("refused").is_retryable());
        assert!(!DatabaseError::permission("denied", "SELECT", "students").is_retryable());
        assert!(!DatabaseError::integrity("dup", None).is_retryable());
        assert!(!DatabaseError::query("bad", "SELEC 1", vec![]).is_retryable());
    }

    #[test]
    fn test_kind_and_code() {
        let err = DatabaseError::integrity("dup", Some("users.email".to_string()));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.code(), "INTEGRITY_ERROR");
        assert_eq!(err.kind().name(), "IntegrityError");
    }

    #[test]
    fn test_query_has_no_suggestion() {
        assert!(DatabaseError::query("bad", "SELEC 1", vec![]).suggestion().is_none());
        assert!(DatabaseError::connection("x").suggestion().is_some());
    }

    #[test]
    fn test_envelope_shape() {
        let err = DatabaseError::timeout("The database operation exceeded its time limit", 500);
        let envelope = err.envelope();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["error"]["type"], "TimeoutError");
        assert_eq!(envelope["error"]["code"], "TIMEOUT_ERROR");
        assert_eq!(envelope["error"]["retryable"], true);
        assert_eq!(
            envelope["error"]["message"],
            "The database operation exceeded its time limit"
        );
    }
}
