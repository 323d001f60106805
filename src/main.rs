//! edu-assistant-db - operator tool for the database access layer.
//!
//! Runs health checks, single statements and transaction files against the
//! configured database and prints the results as JSON on stdout.

use edu_assistant_db::config::{Command, Config};
use edu_assistant_db::db::{DatabasePool, QueryExecutor, QueryOptions, TransactionOrchestrator};
use edu_assistant_db::logger::ErrorLogger;
use edu_assistant_db::models::{QueryParam, Statement};
use edu_assistant_db::DatabaseError;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging. Logs go to stderr so that
/// stdout carries only results.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a result or the error envelope; failures map to exit status 1.
fn report<T: Serialize>(result: Result<T, DatabaseError>) -> Result<ExitCode, serde_json::Error> {
    match result {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            print_json(&err.envelope())?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn parse_params(raw: &[String]) -> Result<Vec<QueryParam>, serde_json::Error> {
    raw.iter()
        .map(|p| serde_json::from_str::<serde_json::Value>(p).map(QueryParam::from))
        .collect()
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    let pool_config = config.pool_config()?;
    let policy = config.retry_policy()?;
    let logger = Arc::new(ErrorLogger::new(config.min_log_level()));

    info!(
        url = %pool_config.masked(),
        max_retries = policy.max_retries,
        "Starting edu-assistant-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = DatabasePool::connect(&pool_config)?;
    let executor = Arc::new(QueryExecutor::new(pool.clone(), policy, logger));

    let exit = match config.command {
        Command::Health => {
            let health = executor.health_check().await;
            print_json(&health)?;
            if health.is_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Query {
            sql,
            params,
            no_retry,
        } => {
            let params = parse_params(&params)?;
            let options = if no_retry {
                QueryOptions::without_retry()
            } else {
                QueryOptions::default()
            };
            report(executor.execute_query(&sql, &params, options).await)?
        }
        Command::Transaction { file } => {
            let contents = std::fs::read_to_string(&file)?;
            let statements: Vec<Statement> = serde_json::from_str(&contents)?;
            let orchestrator = TransactionOrchestrator::new(executor.clone());
            report(orchestrator.execute_transaction(&statements).await)?
        }
    };

    pool.close().await;
    Ok(exit)
}
