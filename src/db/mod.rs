//! Database access layer.
//!
//! - Driver seam and the sqlx connection pool
//! - Raw driver diagnostics and their classification
//! - Query execution with retries
//! - Transaction orchestration
//! - Parameter binding and row decoding

pub mod backend;
pub mod classify;
pub mod diagnostic;
pub mod executor;
pub mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use backend::{Backend, BackendTransaction, DriverResult};
pub use classify::{classify, classify_diagnostic};
pub use diagnostic::{DriverCode, DriverDiagnostic};
pub use executor::{QueryExecutor, QueryOptions, RETRYABLE_KINDS};
pub use pool::{DatabasePool, DbPool, DbTransaction};
pub use transaction::TransactionOrchestrator;
