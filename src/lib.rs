//! Database access and resilience layer of the educational virtual assistant.
//!
//! Connection pooling, classification of driver failures into a typed error
//! taxonomy, exponential-backoff retries for transient failures, and atomic
//! multi-statement transactions over MySQL (PostgreSQL and SQLite are
//! supported too).

pub mod config;
pub mod db;
pub mod error;
pub mod logger;
pub mod models;
pub mod retry;

pub use config::Config;
pub use error::{DatabaseError, DbResult, ErrorKind};
pub use logger::ErrorLogger;
pub use retry::{RetryManager, RetryPolicy};
