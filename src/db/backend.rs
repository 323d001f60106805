//! The seam between the executor and a concrete driver.
//!
//! The pooled sqlx implementation lives in [`super::pool`]; tests drive the
//! executor and the transaction orchestrator through scripted backends.
//! Backends report failures as raw [`DriverDiagnostic`]s; classification
//! happens above this layer.

use super::diagnostic::DriverDiagnostic;
use crate::models::{DatabaseType, QueryOutput, Statement};
use std::future::Future;

pub type DriverResult<T> = Result<T, DriverDiagnostic>;

/// A pool of connections that can run statements and open transactions.
pub trait Backend: Send + Sync {
    type Transaction: BackendTransaction;

    fn database_type(&self) -> DatabaseType;

    /// Run one statement on any free connection.
    fn run(&self, statement: &Statement) -> impl Future<Output = DriverResult<QueryOutput>> + Send;

    /// Acquire a dedicated connection and begin a transaction on it.
    fn begin(&self) -> impl Future<Output = DriverResult<Self::Transaction>> + Send;
}

/// A transaction bound to one connection.
///
/// `commit` and `rollback` consume the handle. Dropping a handle that was
/// never finished rolls back and returns the connection to the pool.
pub trait BackendTransaction: Send {
    fn run(&mut self, statement: &Statement) -> impl Future<Output = DriverResult<QueryOutput>> + Send;

    fn commit(self) -> impl Future<Output = DriverResult<()>> + Send;

    fn rollback(self) -> impl Future<Output = DriverResult<()>> + Send;
}
