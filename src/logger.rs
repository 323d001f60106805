//! Structured error logger.
//!
//! `ErrorLogger` is constructed once at startup and handed to the retry
//! manager and the query executor as an `Arc`. Entries below the configured
//! minimum level are dropped; the rest are dispatched to every attached
//! [`LogSink`]. A sink that fails to write never affects the caller.

use crate::db::diagnostic::DriverDiagnostic;
use crate::error::DatabaseError;
use crate::models::QueryParam;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Structured metadata attached to a log entry.
pub type Metadata = serde_json::Map<String, JsonValue>;

/// Build a metadata map from a `json!` object literal.
///
/// Non-object values are stored under a `"value"` key.
pub fn context(value: JsonValue) -> Metadata {
    match value {
        JsonValue::Object(map) => map,
        JsonValue::Null => Metadata::new(),
        other => {
            let mut map = Metadata::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Log severity, ordered `Debug < Info < Warn < Error < Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Fatal = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Debug,
            1 => Self::Info,
            2 => Self::Warn,
            3 => Self::Error,
            _ => Self::Fatal,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts the tracing level names too, so `LOG_LEVEL=trace` maps to debug.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(format!("Unknown log level: {other}")),
        }
    }
}

/// A single log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Metadata,
}

/// Output destination for log entries.
pub trait LogSink: Send + Sync {
    fn write(&self, entry: &LogEntry) -> io::Result<()>;
}

/// Console destination that forwards entries to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, entry: &LogEntry) -> io::Result<()> {
        let metadata = serde_json::to_string(&entry.metadata).map_err(io::Error::other)?;
        let message = entry.message.as_str();
        match entry.level {
            LogLevel::Debug => tracing::debug!(target: "edu_assistant_db::errors", %metadata, "{message}"),
            LogLevel::Info => tracing::info!(target: "edu_assistant_db::errors", %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "edu_assistant_db::errors", %metadata, "{message}"),
            LogLevel::Error => tracing::error!(target: "edu_assistant_db::errors", %metadata, "{message}"),
            LogLevel::Fatal => {
                tracing::error!(target: "edu_assistant_db::errors", fatal = true, %metadata, "{message}")
            }
        }
        Ok(())
    }
}

/// In-memory destination; useful in tests and for diagnostics dumps.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry written so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Entries at exactly `level`.
    pub fn entries_at(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl LogSink for MemorySink {
    fn write(&self, entry: &LogEntry) -> io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::other("memory sink lock poisoned"))?;
        entries.push(entry.clone());
        Ok(())
    }
}

/// Severity-filtered fan-out to a list of sinks.
pub struct ErrorLogger {
    min_level: AtomicU8,
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

impl ErrorLogger {
    /// Create a logger writing to the console (via `tracing`).
    pub fn new(min_level: LogLevel) -> Self {
        Self::with_sinks(min_level, vec![Arc::new(TracingSink)])
    }

    /// Create a logger with an explicit list of sinks.
    pub fn with_sinks(min_level: LogLevel, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            min_level: AtomicU8::new(min_level as u8),
            sinks: RwLock::new(sinks),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    /// Attach another destination.
    pub fn add_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(sink);
    }

    pub fn debug(&self, message: impl Into<String>, metadata: Metadata) {
        self.log(LogLevel::Debug, message.into(), metadata);
    }

    pub fn info(&self, message: impl Into<String>, metadata: Metadata) {
        self.log(LogLevel::Info, message.into(), metadata);
    }

    pub fn warn(&self, message: impl Into<String>, metadata: Metadata) {
        self.log(LogLevel::Warn, message.into(), metadata);
    }

    pub fn error(&self, message: impl Into<String>, metadata: Metadata) {
        self.log(LogLevel::Error, message.into(), metadata);
    }

    pub fn fatal(&self, message: impl Into<String>, metadata: Metadata) {
        self.log(LogLevel::Fatal, message.into(), metadata);
    }

    /// Log a classified error at error level with its variant-specific fields.
    pub fn database_error(&self, message: impl Into<String>, error: &DatabaseError, metadata: Metadata) {
        self.log(LogLevel::Error, message.into(), database_error_metadata(error, metadata));
    }

    /// Record an unclassified driver failure with everything the driver reported.
    pub fn driver_failure(&self, diagnostic: &DriverDiagnostic, sql: &str, params: &[QueryParam]) {
        self.log(
            LogLevel::Error,
            "Database driver error".to_string(),
            diagnostic.to_metadata(sql, params),
        );
    }

    fn log(&self, level: LogLevel, message: String, metadata: Metadata) {
        if level < self.min_level() {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            metadata,
        };

        let sinks = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for sink in sinks.iter() {
            // A broken destination must not take the caller down with it.
            let _ = sink.write(&entry);
        }
    }
}

impl std::fmt::Debug for ErrorLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sink_count = self
            .sinks
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        f.debug_struct("ErrorLogger")
            .field("min_level", &self.min_level())
            .field("sinks", &sink_count)
            .finish()
    }
}

/// Merge the fields of a classified error into `metadata`.
fn database_error_metadata(error: &DatabaseError, mut metadata: Metadata) -> Metadata {
    metadata.insert("error_name".into(), error.kind().name().into());
    metadata.insert("error_message".into(), error.message().into());

    match error {
        DatabaseError::Query { sql, params, .. } => {
            metadata.insert("query".into(), sql.clone().into());
            metadata.insert(
                "params".into(),
                serde_json::to_value(params).unwrap_or(JsonValue::Null),
            );
        }
        DatabaseError::Integrity { constraint, .. } => {
            metadata.insert("constraint".into(), constraint.clone().into());
        }
        DatabaseError::Permission {
            operation, resource, ..
        } => {
            metadata.insert("operation".into(), operation.clone().into());
            metadata.insert("resource".into(), resource.clone().into());
        }
        DatabaseError::Timeout { timeout_ms, .. } => {
            metadata.insert("timeout_ms".into(), (*timeout_ms).into());
        }
        DatabaseError::Connection { .. } => {}
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::diagnostic::DriverCode;
    use serde_json::json;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn write(&self, _entry: &LogEntry) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    fn capturing(level: LogLevel) -> (ErrorLogger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let logger = ErrorLogger::with_sinks(level, vec![sink.clone()]);
        (logger, sink)
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_entries_below_min_level_dropped() {
        let (logger, sink) = capturing(LogLevel::Warn);
        logger.debug("debug", Metadata::new());
        logger.info("info", Metadata::new());
        logger.warn("warn", Metadata::new());
        logger.error("error", Metadata::new());
        logger.fatal("fatal", Metadata::new());
        assert_eq!(sink.messages(), vec!["warn", "error", "fatal"]);
    }

    #[test]
    fn test_set_min_level() {
        let (logger, sink) = capturing(LogLevel::Error);
        logger.info("dropped", Metadata::new());
        logger.set_min_level(LogLevel::Debug);
        logger.debug("kept", Metadata::new());
        assert_eq!(logger.min_level(), LogLevel::Debug);
        assert_eq!(sink.messages(), vec!["kept"]);
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let sink = Arc::new(MemorySink::new());
        let logger = ErrorLogger::with_sinks(
            LogLevel::Debug,
            vec![Arc::new(FailingSink), sink.clone()],
        );
        logger.error("still delivered", Metadata::new());
        assert_eq!(sink.messages(), vec!["still delivered"]);
    }

    #[test]
    fn test_add_sink() {
        let logger = ErrorLogger::with_sinks(LogLevel::Info, vec![]);
        logger.info("nobody listening", Metadata::new());
        let sink = Arc::new(MemorySink::new());
        logger.add_sink(sink.clone());
        logger.info("heard", context(json!({ "attempt": 1 })));
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].metadata["attempt"], 1);
    }

    #[test]
    fn test_database_error_query_fields() {
        let (logger, sink) = capturing(LogLevel::Debug);
        let err = DatabaseError::query(
            "SQL query failed",
            "SELEC * FROM students",
            vec![QueryParam::Int(3)],
        );
        logger.database_error("query failed", &err, context(json!({ "op": "list" })));

        let entry = &sink.entries_at(LogLevel::Error)[0];
        assert_eq!(entry.metadata["error_name"], "QueryError");
        assert_eq!(entry.metadata["query"], "SELEC * FROM students");
        assert_eq!(entry.metadata["params"], json!([3]));
        assert_eq!(entry.metadata["op"], "list");
    }

    #[test]
    fn test_database_error_permission_and_integrity_fields() {
        let (logger, sink) = capturing(LogLevel::Debug);
        logger.database_error(
            "denied",
            &DatabaseError::permission("denied", "DELETE", "subjects"),
            Metadata::new(),
        );
        logger.database_error(
            "dup",
            &DatabaseError::integrity("dup", Some("users.email".to_string())),
            Metadata::new(),
        );

        let entries = sink.entries();
        assert_eq!(entries[0].metadata["operation"], "DELETE");
        assert_eq!(entries[0].metadata["resource"], "subjects");
        assert_eq!(entries[1].metadata["constraint"], "users.email");
    }

    #[test]
    fn test_driver_failure_keeps_raw_diagnostic() {
        let (logger, sink) = capturing(LogLevel::Error);
        let diag = DriverDiagnostic::new(DriverCode::ConnectionRefused, "connect ECONNREFUSED")
            .with_errno(111);
        logger.driver_failure(&diag, "SELECT 1", &[]);

        let entry = &sink.entries()[0];
        assert_eq!(entry.message, "Database driver error");
        assert_eq!(entry.metadata["code"], "ECONNREFUSED");
        assert_eq!(entry.metadata["errno"], 111);
        assert_eq!(entry.metadata["sql"], "SELECT 1");
    }

    #[test]
    fn test_context_wraps_scalars() {
        assert_eq!(context(json!(5))["value"], 5);
        assert!(context(JsonValue::Null).is_empty());
    }
}
