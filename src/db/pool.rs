//! Connection pool and the sqlx-backed [`Backend`].
//!
//! Database-specific pools (MySqlPool, PgPool, SqlitePool) are used instead of
//! `AnyPool` to keep full type support. The pool bounds live connections and
//! queues waiters until the acquire timeout.

use super::backend::{Backend, BackendTransaction, DriverResult};
use super::diagnostic::{DriverCode, DriverDiagnostic};
use super::params::{mysql_query, postgres_query, sqlite_query};
use super::types::RowToJson;
use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::models::{DatabaseType, QueryOutput, Statement};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Database-specific connection pool.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Live connections, idle or in use.
    pub fn size(&self) -> u32 {
        match self {
            DbPool::MySql(pool) => pool.size(),
            DbPool::Postgres(pool) => pool.size(),
            DbPool::SQLite(pool) => pool.size(),
        }
    }

    pub fn num_idle(&self) -> usize {
        match self {
            DbPool::MySql(pool) => pool.num_idle(),
            DbPool::Postgres(pool) => pool.num_idle(),
            DbPool::SQLite(pool) => pool.num_idle(),
        }
    }
}

/// The shared pool owned by the query executor.
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: DbPool,
    acquire_timeout: Duration,
}

impl DatabasePool {
    /// Create the pool without opening any connection.
    ///
    /// Connections are established on first use, so an unreachable server
    /// shows up as a classified error on the first query or health check
    /// rather than at startup. Must be called inside a Tokio runtime.
    pub fn connect(config: &PoolConfig) -> Result<Self, ConfigError> {
        let opts = &config.options;
        let is_sqlite = config.db_type == DatabaseType::SQLite;
        let acquire_timeout = opts.acquire_timeout_or_default();
        let idle_timeout = Some(opts.idle_timeout_or_default());
        let max_connections = opts.max_connections_or_default(is_sqlite);
        let min_connections = opts.min_connections_or_default();
        let test_before_acquire = opts.test_before_acquire_or_default();

        info!(
            url = %config.masked(),
            db_type = %config.db_type,
            max_connections,
            "Creating connection pool"
        );

        let pool = match config.db_type {
            DatabaseType::MySQL => {
                // mariadb:// is accepted as an alias
                let url = config.connection_string.replacen("mariadb://", "mysql://", 1);
                let options = MySqlConnectOptions::from_str(&url)
                    .map_err(|e| ConfigError::InvalidUrl(format!("Invalid MySQL connection string: {e}")))?
                    .charset("utf8mb4");

                DbPool::MySql(
                    MySqlPoolOptions::new()
                        .min_connections(min_connections)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(test_before_acquire)
                        .connect_lazy_with(options),
                )
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(&config.connection_string).map_err(|e| {
                    ConfigError::InvalidUrl(format!("Invalid PostgreSQL connection string: {e}"))
                })?;

                DbPool::Postgres(
                    PgPoolOptions::new()
                        .min_connections(min_connections)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(test_before_acquire)
                        .connect_lazy_with(options),
                )
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(&config.connection_string)
                    .map_err(|e| {
                        ConfigError::InvalidUrl(format!("Invalid SQLite connection string: {e}"))
                    })?
                    .create_if_missing(true)
                    .foreign_keys(true);

                DbPool::SQLite(
                    SqlitePoolOptions::new()
                        .min_connections(min_connections)
                        .max_connections(max_connections)
                        .acquire_timeout(acquire_timeout)
                        .idle_timeout(idle_timeout)
                        .test_before_acquire(test_before_acquire)
                        .connect_lazy_with(options),
                )
            }
        };

        Ok(Self {
            pool,
            acquire_timeout,
        })
    }

    /// Wrap an already configured pool.
    pub fn from_pool(pool: DbPool, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Close every connection; later acquisitions fail with POOL_CLOSED.
    pub async fn close(&self) {
        info!(db_type = %self.pool.db_type(), "Closing connection pool");
        self.pool.close().await;
    }

    fn diagnostic(&self, err: &sqlx::Error) -> DriverDiagnostic {
        pool_diagnostic(err, self.pool.db_type(), self.pool.size(), self.acquire_timeout)
    }
}

/// Translate a sqlx error raised while the pool had `pool_size` live connections.
///
/// sqlx keeps retrying refused connects until the acquire deadline and then
/// reports `PoolTimedOut`. With no live connection at all that timeout means
/// the server never accepted one, so it is reported as a refused connection.
fn pool_diagnostic(
    err: &sqlx::Error,
    db_type: DatabaseType,
    pool_size: u32,
    acquire_timeout: Duration,
) -> DriverDiagnostic {
    let diagnostic = DriverDiagnostic::from_sqlx(err, db_type);
    if diagnostic.code != DriverCode::PoolAcquireTimeout {
        return diagnostic;
    }
    if pool_size == 0 {
        return DriverDiagnostic::new(
            DriverCode::ConnectionRefused,
            format!(
                "No connection could be established within {} ms",
                acquire_timeout.as_millis()
            ),
        )
        .with_db_type(db_type);
    }
    diagnostic.with_timeout_ms(acquire_timeout.as_millis() as u64)
}

impl Backend for DatabasePool {
    type Transaction = DbTransaction;

    fn database_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    async fn run(&self, statement: &Statement) -> DriverResult<QueryOutput> {
        let result = match &self.pool {
            DbPool::MySql(pool) => match pool.acquire().await {
                Ok(mut conn) => mysql::run(&mut conn, statement).await,
                Err(e) => Err(e),
            },
            DbPool::Postgres(pool) => match pool.acquire().await {
                Ok(mut conn) => postgres::run(&mut conn, statement).await,
                Err(e) => Err(e),
            },
            DbPool::SQLite(pool) => match pool.acquire().await {
                Ok(mut conn) => sqlite::run(&mut conn, statement).await,
                Err(e) => Err(e),
            },
        };
        result.map_err(|e| self.diagnostic(&e))
    }

    async fn begin(&self) -> DriverResult<DbTransaction> {
        let result = match &self.pool {
            DbPool::MySql(pool) => pool.begin().await.map(DbTransaction::MySql),
            DbPool::Postgres(pool) => pool.begin().await.map(DbTransaction::Postgres),
            DbPool::SQLite(pool) => pool.begin().await.map(DbTransaction::SQLite),
        };
        match result {
            Ok(tx) => {
                debug!(db_type = %self.pool.db_type(), "Transaction begun");
                Ok(tx)
            }
            Err(e) => Err(self.diagnostic(&e)),
        }
    }
}

/// A transaction holding one pooled connection.
///
/// Dropping it without commit or rollback rolls back and returns the
/// connection to the pool (sqlx `Transaction` semantics).
pub enum DbTransaction {
    MySql(Transaction<'static, MySql>),
    Postgres(Transaction<'static, Postgres>),
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

impl BackendTransaction for DbTransaction {
    async fn run(&mut self, statement: &Statement) -> DriverResult<QueryOutput> {
        let db_type = self.db_type();
        let result = match self {
            DbTransaction::MySql(tx) => mysql::run(&mut **tx, statement).await,
            DbTransaction::Postgres(tx) => postgres::run(&mut **tx, statement).await,
            DbTransaction::SQLite(tx) => sqlite::run(&mut **tx, statement).await,
        };
        result.map_err(|e| DriverDiagnostic::from_sqlx(&e, db_type))
    }

    async fn commit(self) -> DriverResult<()> {
        let db_type = self.db_type();
        let result = match self {
            DbTransaction::MySql(tx) => tx.commit().await,
            DbTransaction::Postgres(tx) => tx.commit().await,
            DbTransaction::SQLite(tx) => tx.commit().await,
        };
        result.map_err(|e| DriverDiagnostic::from_sqlx(&e, db_type))
    }

    async fn rollback(self) -> DriverResult<()> {
        let db_type = self.db_type();
        let result = match self {
            DbTransaction::MySql(tx) => tx.rollback().await,
            DbTransaction::Postgres(tx) => tx.rollback().await,
            DbTransaction::SQLite(tx) => tx.rollback().await,
        };
        result.map_err(|e| DriverDiagnostic::from_sqlx(&e, db_type))
    }
}

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;

    pub(super) async fn run(
        conn: &mut MySqlConnection,
        statement: &Statement,
    ) -> Result<QueryOutput, sqlx::Error> {
        let query = mysql_query(statement);
        if statement.returns_rows() {
            let rows = query.fetch_all(conn).await?;
            Ok(rows_output(&rows))
        } else {
            let result = query.execute(conn).await?;
            let last_insert_id = Some(result.last_insert_id()).filter(|id| *id > 0);
            Ok(QueryOutput::affected(result.rows_affected(), last_insert_id))
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::PgConnection;

    pub(super) async fn run(
        conn: &mut PgConnection,
        statement: &Statement,
    ) -> Result<QueryOutput, sqlx::Error> {
        let query = postgres_query(statement);
        if statement.returns_rows() {
            let rows = query.fetch_all(conn).await?;
            Ok(rows_output(&rows))
        } else {
            let result = query.execute(conn).await?;
            Ok(QueryOutput::affected(result.rows_affected(), None))
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;

    pub(super) async fn run(
        conn: &mut SqliteConnection,
        statement: &Statement,
    ) -> Result<QueryOutput, sqlx::Error> {
        let query = sqlite_query(statement);
        if statement.returns_rows() {
            let rows = query.fetch_all(conn).await?;
            Ok(rows_output(&rows))
        } else {
            let result = query.execute(conn).await?;
            let last_insert_id = u64::try_from(result.last_insert_rowid())
                .ok()
                .filter(|id| *id > 0);
            Ok(QueryOutput::affected(result.rows_affected(), last_insert_id))
        }
    }
}

fn rows_output<R: RowToJson>(rows: &[R]) -> QueryOutput {
    let columns = rows.first().map(RowToJson::column_names).unwrap_or_default();
    QueryOutput::from_rows(columns, rows.iter().map(RowToJson::to_json_map).collect())
}
