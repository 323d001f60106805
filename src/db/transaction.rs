//! Atomic multi-statement execution.
//!
//! A run acquires one dedicated connection, executes every statement on it in
//! order with per-statement retries disabled, and either commits or rolls
//! back. The transaction handle is consumed by commit or rollback, so the
//! connection goes back to the pool exactly once on every path.

use super::backend::{Backend, BackendTransaction};
use super::classify::classify;
use super::executor::{QueryExecutor, QueryOptions};
use crate::error::{DatabaseError, DbResult};
use crate::logger::{ErrorLogger, context};
use crate::models::{QueryOutput, Statement};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Statement used when classifying a failed commit.
pub const COMMIT_STATEMENT: &str = "COMMIT";

const ROLLBACK_STATEMENT: &str = "ROLLBACK";

/// Runs statement batches inside a single transaction.
#[derive(Debug)]
pub struct TransactionOrchestrator<B: Backend> {
    executor: Arc<QueryExecutor<B>>,
    logger: Arc<ErrorLogger>,
}

impl<B: Backend> Clone for TransactionOrchestrator<B> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            logger: self.logger.clone(),
        }
    }
}

impl<B: Backend> TransactionOrchestrator<B> {
    pub fn new(executor: Arc<QueryExecutor<B>>) -> Self {
        let logger = executor.logger().clone();
        Self { executor, logger }
    }

    pub fn executor(&self) -> &Arc<QueryExecutor<B>> {
        &self.executor
    }

    /// Run `statements` atomically and return one output per statement.
    pub async fn execute_transaction(&self, statements: &[Statement]) -> DbResult<Vec<QueryOutput>> {
        self.execute_transaction_with(statements, |outputs| outputs).await
    }

    /// Run `statements` atomically and hand the outputs to `mapper`.
    ///
    /// `mapper` runs only after a successful commit.
    pub async fn execute_transaction_with<T, F>(
        &self,
        statements: &[Statement],
        mapper: F,
    ) -> DbResult<T>
    where
        F: FnOnce(Vec<QueryOutput>) -> T,
    {
        let transaction_id = Uuid::new_v4().to_string();
        debug!(%transaction_id, statements = statements.len(), "Starting transaction");

        let mut tx = self.executor.begin_transaction().await?;

        let mut outputs = Vec::with_capacity(statements.len());
        for (index, statement) in statements.iter().enumerate() {
            match self
                .executor
                .execute_statement(statement, QueryOptions::in_transaction(&mut tx))
                .await
            {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    self.rollback(tx, &transaction_id, index, &err).await;
                    return Err(err);
                }
            }
        }

        if let Err(diag) = tx.commit().await {
            debug!(%transaction_id, "Connection released after failed commit");
            return Err(classify(&diag, COMMIT_STATEMENT, &[], &self.logger));
        }

        info!(%transaction_id, statements = statements.len(), "Transaction committed");
        debug!(%transaction_id, "Connection released");
        Ok(mapper(outputs))
    }

    /// Roll back after statement `index` failed with `original`.
    ///
    /// A rollback failure is logged next to the original error and swallowed;
    /// the caller always sees `original`.
    async fn rollback(
        &self,
        tx: B::Transaction,
        transaction_id: &str,
        index: usize,
        original: &DatabaseError,
    ) {
        match tx.rollback().await {
            Ok(()) => {
                info!(
                    %transaction_id,
                    failed_statement = index,
                    error = %original,
                    "Transaction rolled back"
                );
            }
            Err(rollback_err) => {
                self.logger.error(
                    "Failed to roll back transaction",
                    context(json!({
                        "transaction_id": transaction_id,
                        "failed_statement": index,
                        "original_error": original.to_string(),
                        "original_code": original.code(),
                        "rollback_error": rollback_err.to_metadata(ROLLBACK_STATEMENT, &[]),
                    })),
                );
            }
        }
        debug!(%transaction_id, "Connection released");
    }
}
