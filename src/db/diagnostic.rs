//! Raw driver diagnostics.
//!
//! A `DriverDiagnostic` is filled in immediately after a native driver call
//! fails, before any classification looks at it. This is the only place that
//! inspects `sqlx::Error` internals; everything downstream works with the
//! MySQL-style [`DriverCode`] vocabulary regardless of backend.

use crate::logger::Metadata;
use crate::models::{DatabaseType, QueryParam};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::error::ErrorKind as SqlxErrorKind;
use sqlx::mysql::MySqlDatabaseError;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::io;

/// Driver-level error code, named after the MySQL client codes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriverCode {
    /// ECONNREFUSED
    ConnectionRefused,
    /// PROTOCOL_CONNECTION_LOST
    ConnectionLost,
    /// ENOTFOUND
    HostNotFound,
    /// ETIMEDOUT, socket-level
    NetworkTimeout,
    /// POOL_CLOSED
    PoolClosed,
    /// PROTOCOL_SEQUENCE_TIMEOUT
    SequenceTimeout,
    /// POOL_ACQUIRE_TIMEOUT, no connection became free in time
    PoolAcquireTimeout,
    /// ER_LOCK_WAIT_TIMEOUT
    LockWaitTimeout,
    /// ER_DUP_ENTRY
    DuplicateEntry,
    /// ER_NO_REFERENCED_ROW
    NoReferencedRow,
    /// ER_ROW_IS_REFERENCED
    RowIsReferenced,
    /// ER_ACCESS_DENIED_ERROR
    AccessDenied,
    /// ER_DBACCESS_DENIED_ERROR
    DbAccessDenied,
    /// ER_TABLEACCESS_DENIED_ERROR
    TableAccessDenied,
    Other(String),
}

impl DriverCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionLost => "PROTOCOL_CONNECTION_LOST",
            Self::HostNotFound => "ENOTFOUND",
            Self::NetworkTimeout => "ETIMEDOUT",
            Self::PoolClosed => "POOL_CLOSED",
            Self::SequenceTimeout => "PROTOCOL_SEQUENCE_TIMEOUT",
            Self::PoolAcquireTimeout => "POOL_ACQUIRE_TIMEOUT",
            Self::LockWaitTimeout => "ER_LOCK_WAIT_TIMEOUT",
            Self::DuplicateEntry => "ER_DUP_ENTRY",
            Self::NoReferencedRow => "ER_NO_REFERENCED_ROW",
            Self::RowIsReferenced => "ER_ROW_IS_REFERENCED",
            Self::AccessDenied => "ER_ACCESS_DENIED_ERROR",
            Self::DbAccessDenied => "ER_DBACCESS_DENIED_ERROR",
            Self::TableAccessDenied => "ER_TABLEACCESS_DENIED_ERROR",
            Self::Other(code) => code,
        }
    }

    /// Parse a code name; unknown names become [`DriverCode::Other`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "ECONNREFUSED" => Self::ConnectionRefused,
            "PROTOCOL_CONNECTION_LOST" | "ECONNRESET" | "EPIPE" => Self::ConnectionLost,
            "ENOTFOUND" | "EAI_AGAIN" => Self::HostNotFound,
            "ETIMEDOUT" => Self::NetworkTimeout,
            "POOL_CLOSED" => Self::PoolClosed,
            "PROTOCOL_SEQUENCE_TIMEOUT" => Self::SequenceTimeout,
            "POOL_ACQUIRE_TIMEOUT" => Self::PoolAcquireTimeout,
            "ER_LOCK_WAIT_TIMEOUT" => Self::LockWaitTimeout,
            "ER_DUP_ENTRY" => Self::DuplicateEntry,
            "ER_NO_REFERENCED_ROW" | "ER_NO_REFERENCED_ROW_2" => Self::NoReferencedRow,
            "ER_ROW_IS_REFERENCED" | "ER_ROW_IS_REFERENCED_2" => Self::RowIsReferenced,
            "ER_ACCESS_DENIED_ERROR" => Self::AccessDenied,
            "ER_DBACCESS_DENIED_ERROR" => Self::DbAccessDenied,
            "ER_TABLEACCESS_DENIED_ERROR" | "ER_COLUMNACCESS_DENIED_ERROR" => {
                Self::TableAccessDenied
            }
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for DriverCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the driver told us about a failure, untouched.
#[derive(Debug, Clone)]
pub struct DriverDiagnostic {
    pub code: DriverCode,
    /// MySQL error number, SQLite result code or OS errno
    pub errno: Option<i64>,
    pub sql_state: Option<String>,
    pub message: String,
    /// Constraint name when the driver reports it directly
    pub constraint: Option<String>,
    /// Wait budget for timeouts raised by this layer (pool acquire)
    pub timeout_ms: Option<u64>,
    pub db_type: DatabaseType,
    pub backtrace: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DriverDiagnostic {
    pub fn new(code: DriverCode, message: impl Into<String>) -> Self {
        Self {
            code,
            errno: None,
            sql_state: None,
            message: message.into(),
            constraint: None,
            timeout_ms: None,
            db_type: DatabaseType::MySQL,
            backtrace: capture_backtrace(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_errno(mut self, errno: i64) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_db_type(mut self, db_type: DatabaseType) -> Self {
        self.db_type = db_type;
        self
    }

    /// Translate a sqlx error raised by a `db_type` backend.
    pub fn from_sqlx(err: &sqlx::Error, db_type: DatabaseType) -> Self {
        let diagnostic = match err {
            sqlx::Error::Io(io_err) => from_io(io_err),
            sqlx::Error::Tls(tls_err) => {
                Self::new(DriverCode::ConnectionLost, format!("TLS error: {tls_err}"))
            }
            sqlx::Error::Protocol(msg) => {
                Self::new(DriverCode::ConnectionLost, format!("Protocol error: {msg}"))
            }
            sqlx::Error::PoolTimedOut => Self::new(
                DriverCode::PoolAcquireTimeout,
                "Timed out waiting for a free connection",
            ),
            sqlx::Error::PoolClosed => {
                Self::new(DriverCode::PoolClosed, "Connection pool is closed")
            }
            sqlx::Error::WorkerCrashed => {
                Self::new(DriverCode::ConnectionLost, "Database worker crashed")
            }
            sqlx::Error::Database(db_err) => from_database_error(db_err.as_ref(), db_type),
            sqlx::Error::Configuration(msg) => {
                Self::new(DriverCode::Other("ER_CONFIGURATION".into()), msg.to_string())
            }
            sqlx::Error::RowNotFound => {
                Self::new(DriverCode::Other("ER_NO_ROWS".into()), "No rows returned")
            }
            sqlx::Error::ColumnDecode { index, source } => Self::new(
                DriverCode::Other("ER_DECODE".into()),
                format!("Failed to decode column {index}: {source}"),
            ),
            other => Self::new(DriverCode::Other("ER_UNKNOWN".into()), other.to_string()),
        };
        diagnostic.with_db_type(db_type)
    }

    /// Full record for the error log.
    pub fn to_metadata(&self, sql: &str, params: &[QueryParam]) -> Metadata {
        let value = json!({
            "code": self.code.as_str(),
            "errno": self.errno,
            "sql_state": self.sql_state,
            "message": self.message,
            "constraint": self.constraint,
            "sql": sql,
            "params": params,
            "db_type": self.db_type,
            "stack": self.backtrace,
            "timestamp": self.timestamp.to_rfc3339(),
        });
        crate::logger::context(value)
    }
}

fn capture_backtrace() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn from_io(err: &io::Error) -> DriverDiagnostic {
    let message = err.to_string();
    let code = match err.kind() {
        io::ErrorKind::ConnectionRefused => DriverCode::ConnectionRefused,
        io::ErrorKind::TimedOut => DriverCode::NetworkTimeout,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => DriverCode::ConnectionLost,
        _ if is_dns_failure(&message) => DriverCode::HostNotFound,
        _ => DriverCode::ConnectionLost,
    };

    let diagnostic = DriverDiagnostic::new(code, message);
    match err.raw_os_error() {
        Some(errno) => diagnostic.with_errno(errno as i64),
        None => diagnostic,
    }
}

fn is_dns_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host")
}

fn from_database_error(
    db_err: &dyn sqlx::error::DatabaseError,
    db_type: DatabaseType,
) -> DriverDiagnostic {
    let message = db_err.message().to_string();
    let sql_state = db_err.code().map(|c| c.to_string());

    let (code, errno) = match db_type {
        DatabaseType::MySQL => match db_err.try_downcast_ref::<MySqlDatabaseError>() {
            Some(mysql_err) => {
                let number = mysql_err.number();
                (mysql_code(number), Some(number as i64))
            }
            None => (generic_code(db_err), None),
        },
        DatabaseType::PostgreSQL => (
            sql_state
                .as_deref()
                .map(|state| postgres_code(state, &message))
                .unwrap_or_else(|| generic_code(db_err)),
            None,
        ),
        DatabaseType::SQLite => {
            let result_code = sql_state.as_deref().and_then(|c| c.parse::<i64>().ok());
            match result_code {
                Some(rc) => (sqlite_code(rc, db_err), Some(rc)),
                None => (generic_code(db_err), None),
            }
        }
    };

    let mut diagnostic = DriverDiagnostic::new(code, message);
    diagnostic.errno = errno;
    diagnostic.sql_state = sql_state;
    diagnostic.constraint = db_err.constraint().map(String::from);
    diagnostic
}

/// MySQL server error numbers.
fn mysql_code(number: u16) -> DriverCode {
    match number {
        1040 => DriverCode::ConnectionRefused, // ER_CON_COUNT_ERROR
        2006 | 2013 => DriverCode::ConnectionLost,
        1044 => DriverCode::DbAccessDenied,
        1045 => DriverCode::AccessDenied,
        1142 | 1143 => DriverCode::TableAccessDenied,
        1062 | 1586 => DriverCode::DuplicateEntry,
        1216 | 1452 => DriverCode::NoReferencedRow,
        1217 | 1451 => DriverCode::RowIsReferenced,
        1205 => DriverCode::LockWaitTimeout,
        3024 => DriverCode::SequenceTimeout, // ER_QUERY_TIMEOUT
        1064 => DriverCode::Other("ER_PARSE_ERROR".into()),
        1146 => DriverCode::Other("ER_NO_SUCH_TABLE".into()),
        1054 => DriverCode::Other("ER_BAD_FIELD_ERROR".into()),
        1048 => DriverCode::Other("ER_BAD_NULL_ERROR".into()),
        other => DriverCode::Other(format!("ER_{other}")),
    }
}

/// PostgreSQL SQLSTATE codes.
fn postgres_code(state: &str, message: &str) -> DriverCode {
    match state {
        "08001" | "08004" => DriverCode::ConnectionRefused,
        "57P01" | "57P02" | "57P03" => DriverCode::ConnectionLost,
        s if s.starts_with("08") => DriverCode::ConnectionLost,
        "57014" => DriverCode::SequenceTimeout,
        "55P03" => DriverCode::LockWaitTimeout,
        "23505" => DriverCode::DuplicateEntry,
        "23503" if message.contains("still referenced") => DriverCode::RowIsReferenced,
        "23503" => DriverCode::NoReferencedRow,
        "28000" | "28P01" => DriverCode::AccessDenied,
        "42501" => DriverCode::TableAccessDenied,
        other => DriverCode::Other(other.to_string()),
    }
}

/// SQLite (extended) result codes.
fn sqlite_code(result_code: i64, db_err: &dyn sqlx::error::DatabaseError) -> DriverCode {
    match result_code {
        // SQLITE_CONSTRAINT_UNIQUE, SQLITE_CONSTRAINT_PRIMARYKEY
        2067 | 1555 => DriverCode::DuplicateEntry,
        // SQLITE_CONSTRAINT_FOREIGNKEY
        787 => DriverCode::NoReferencedRow,
        _ => match result_code & 0xff {
            5 | 6 => DriverCode::LockWaitTimeout, // BUSY, LOCKED
            8 | 23 => DriverCode::TableAccessDenied, // READONLY, AUTH
            14 => DriverCode::ConnectionRefused, // CANTOPEN
            19 => match generic_code(db_err) {
                DriverCode::Other(_) => DriverCode::Other("SQLITE_CONSTRAINT".into()),
                code => code,
            },
            _ => DriverCode::Other(format!("SQLITE_{result_code}")),
        },
    }
}

/// Fallback using the backend-independent error kind.
fn generic_code(db_err: &dyn sqlx::error::DatabaseError) -> DriverCode {
    match db_err.kind() {
        SqlxErrorKind::UniqueViolation => DriverCode::DuplicateEntry,
        SqlxErrorKind::ForeignKeyViolation => DriverCode::NoReferencedRow,
        _ => DriverCode::Other(
            db_err
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "ER_UNKNOWN".to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names_round_trip() {
        for code in [
            DriverCode::ConnectionRefused,
            DriverCode::ConnectionLost,
            DriverCode::HostNotFound,
            DriverCode::NetworkTimeout,
            DriverCode::SequenceTimeout,
            DriverCode::DuplicateEntry,
            DriverCode::TableAccessDenied,
        ] {
            assert_eq!(DriverCode::from_name(code.as_str()), code);
        }
        assert_eq!(
            DriverCode::from_name("ER_PARSE_ERROR"),
            DriverCode::Other("ER_PARSE_ERROR".into())
        );
    }

    #[test]
    fn test_io_errors() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::Io(refused), DatabaseType::MySQL);
        assert_eq!(diag.code, DriverCode::ConnectionRefused);

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::Io(reset), DatabaseType::MySQL);
        assert_eq!(diag.code, DriverCode::ConnectionLost);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::Io(timed_out), DatabaseType::MySQL);
        assert_eq!(diag.code, DriverCode::NetworkTimeout);

        let dns = io::Error::other("failed to lookup address information: Name or service not known");
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::Io(dns), DatabaseType::PostgreSQL);
        assert_eq!(diag.code, DriverCode::HostNotFound);
        assert_eq!(diag.db_type, DatabaseType::PostgreSQL);
    }

    #[test]
    fn test_pool_errors() {
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::PoolTimedOut, DatabaseType::MySQL);
        assert_eq!(diag.code, DriverCode::PoolAcquireTimeout);
        let diag = DriverDiagnostic::from_sqlx(&sqlx::Error::PoolClosed, DatabaseType::MySQL);
        assert_eq!(diag.code, DriverCode::PoolClosed);
    }

    #[test]
    fn test_mysql_numbers() {
        assert_eq!(mysql_code(1062), DriverCode::DuplicateEntry);
        assert_eq!(mysql_code(1452), DriverCode::NoReferencedRow);
        assert_eq!(mysql_code(1451), DriverCode::RowIsReferenced);
        assert_eq!(mysql_code(1045), DriverCode::AccessDenied);
        assert_eq!(mysql_code(1044), DriverCode::DbAccessDenied);
        assert_eq!(mysql_code(1142), DriverCode::TableAccessDenied);
        assert_eq!(mysql_code(1064), DriverCode::Other("ER_PARSE_ERROR".into()));
        assert_eq!(mysql_code(9999), DriverCode::Other("ER_9999".into()));
    }

    #[test]
    fn test_postgres_states() {
        assert_eq!(postgres_code("23505", ""), DriverCode::DuplicateEntry);
        assert_eq!(
            postgres_code("23503", "Key (id)=(1) is still referenced from table \"messages\""),
            DriverCode::RowIsReferenced
        );
        assert_eq!(postgres_code("23503", "Key is not present"), DriverCode::NoReferencedRow);
        assert_eq!(postgres_code("42501", ""), DriverCode::TableAccessDenied);
        assert_eq!(postgres_code("08006", ""), DriverCode::ConnectionLost);
        assert_eq!(postgres_code("57014", ""), DriverCode::SequenceTimeout);
        assert_eq!(postgres_code("42601", ""), DriverCode::Other("42601".into()));
    }

    #[test]
    fn test_metadata_keeps_raw_fields() {
        let diag = DriverDiagnostic::new(DriverCode::DuplicateEntry, "Duplicate entry")
            .with_errno(1062)
            .with_sql_state("23000");
        let meta = diag.to_metadata("INSERT INTO users (email) VALUES (?)", &[QueryParam::from("a@b.c")]);
        assert_eq!(meta["code"], "ER_DUP_ENTRY");
        assert_eq!(meta["errno"], 1062);
        assert_eq!(meta["sql_state"], "23000");
        assert_eq!(meta["params"][0], "a@b.c");
        assert_eq!(meta["db_type"], "mysql");
    }
}
