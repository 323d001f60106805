//! Query execution.
//!
//! The executor owns the backend (normally the connection pool), runs
//! parameterized statements, classifies every driver failure, and routes
//! non-transactional statements through the retry manager. Only connection
//! and timeout failures are retried here; anything else surfaces on the first
//! attempt.

use super::backend::{Backend, BackendTransaction, DriverResult};
use super::classify::classify;
use super::diagnostic::{DriverCode, DriverDiagnostic};
use crate::error::{DEFAULT_TIMEOUT_MS, DbResult, ErrorKind};
use crate::logger::{ErrorLogger, Metadata, context};
use crate::models::{HealthReport, QueryOutput, QueryParam, Statement};
use crate::retry::{RetryManager, RetryPolicy};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Error kinds worth another attempt outside a transaction.
pub const RETRYABLE_KINDS: [ErrorKind; 2] = [ErrorKind::Connection, ErrorKind::Timeout];

pub const HEALTH_CHECK_SQL: &str = "SELECT 1 AS health_check";

/// Statement used when classifying a failure to open a transaction.
pub const BEGIN_STATEMENT: &str = "BEGIN TRANSACTION";

/// Per-call execution options.
pub struct QueryOptions<'t, T> {
    /// Route through the retry manager (ignored inside a transaction)
    pub retry_enabled: bool,
    /// Run on this transaction's connection instead of the pool
    pub transaction: Option<&'t mut T>,
}

impl<T> Default for QueryOptions<'_, T> {
    fn default() -> Self {
        Self {
            retry_enabled: true,
            transaction: None,
        }
    }
}

impl<'t, T> QueryOptions<'t, T> {
    pub fn without_retry() -> Self {
        Self {
            retry_enabled: false,
            transaction: None,
        }
    }

    pub fn in_transaction(transaction: &'t mut T) -> Self {
        Self {
            retry_enabled: false,
            transaction: Some(transaction),
        }
    }
}

/// Runs statements against a [`Backend`] with classification and retries.
#[derive(Debug)]
pub struct QueryExecutor<B: Backend> {
    backend: B,
    retry: RetryManager,
    logger: Arc<ErrorLogger>,
    query_timeout: Duration,
}

impl<B: Backend> QueryExecutor<B> {
    pub fn new(backend: B, policy: RetryPolicy, logger: Arc<ErrorLogger>) -> Self {
        Self {
            backend,
            retry: RetryManager::new(policy, logger.clone()),
            logger,
            query_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Limit each statement round-trip (including the wait for a connection).
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn logger(&self) -> &Arc<ErrorLogger> {
        &self.logger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    /// Execute `sql` with positional `params`.
    pub async fn execute_query(
        &self,
        sql: &str,
        params: &[QueryParam],
        options: QueryOptions<'_, B::Transaction>,
    ) -> DbResult<QueryOutput> {
        let statement = Statement::new(sql, params.to_vec());
        self.execute_statement(&statement, options).await
    }

    /// Execute a prepared [`Statement`].
    pub async fn execute_statement(
        &self,
        statement: &Statement,
        options: QueryOptions<'_, B::Transaction>,
    ) -> DbResult<QueryOutput> {
        let start = Instant::now();
        debug!(
            sql = %statement.sql,
            params = statement.params.len(),
            retry = options.retry_enabled,
            in_transaction = options.transaction.is_some(),
            "Executing statement"
        );

        let result = match options.transaction {
            Some(tx) => self.attempt(statement, tx.run(statement)).await,
            None if options.retry_enabled => {
                let ctx = statement_context(statement);
                self.retry
                    .execute(
                        || self.attempt(statement, self.backend.run(statement)),
                        &RETRYABLE_KINDS,
                        &ctx,
                    )
                    .await
            }
            None => self.attempt(statement, self.backend.run(statement)).await,
        };

        if let Ok(output) = &result {
            debug!(
                rows = output.rows.len(),
                rows_affected = output.rows_affected,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Statement completed"
            );
        }
        result
    }

    /// Probe the database with `SELECT 1`.
    ///
    /// Never fails: a classified error becomes an unhealthy report.
    pub async fn health_check(&self) -> HealthReport {
        match self
            .execute_query(HEALTH_CHECK_SQL, &[], QueryOptions::default())
            .await
        {
            Ok(_) => HealthReport::healthy(),
            Err(err) => HealthReport::unhealthy(err.message(), err.code()),
        }
    }

    /// Acquire a dedicated connection and begin a transaction on it.
    pub async fn begin_transaction(&self) -> DbResult<B::Transaction> {
        self.backend
            .begin()
            .await
            .map_err(|diag| classify(&diag, BEGIN_STATEMENT, &[], &self.logger))
    }

    /// One bounded round-trip, classified on failure.
    async fn attempt<F>(&self, statement: &Statement, round_trip: F) -> DbResult<QueryOutput>
    where
        F: Future<Output = DriverResult<QueryOutput>>,
    {
        let result = match tokio::time::timeout(self.query_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_diagnostic()),
        };
        result.map_err(|diag| classify(&diag, &statement.sql, &statement.params, &self.logger))
    }

    fn timeout_diagnostic(&self) -> DriverDiagnostic {
        let timeout_ms = self.query_timeout.as_millis() as u64;
        DriverDiagnostic::new(
            DriverCode::SequenceTimeout,
            format!("Query inactivity timeout after {timeout_ms} ms"),
        )
        .with_db_type(self.backend.database_type())
        .with_timeout_ms(timeout_ms)
    }
}

fn statement_context(statement: &Statement) -> Metadata {
    context(json!({
        "sql": statement.sql,
        "params": statement.params.len(),
    }))
}
