//! Configuration handling.
//!
//! Everything is read once at startup from CLI arguments and environment
//! variables, validated, and handed to the pool, the retry manager and the
//! error logger as immutable values.

use crate::error::ConfigError;
use crate::logger::LogLevel;
use crate::models::{DatabaseType, masked_connection_string};
use crate::retry::RetryPolicy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MYSQL_HOST: &str = "localhost";
pub const DEFAULT_MYSQL_PORT: u16 = 3306;
pub const DEFAULT_MYSQL_USER: &str = "root";
pub const DEFAULT_MYSQL_DATABASE: &str = "edu_assistant_db";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 0;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

// Retry defaults as deployed; the library default allows longer waits
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 3_000;

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 10, or 1 for SQLite)
    pub max_connections: Option<u32>,
    /// Minimum idle connections kept open (default: 0)
    pub min_connections: Option<u32>,
    /// How long a caller waits for a free connection (default: 10 s)
    pub acquire_timeout_ms: Option<u64>,
    /// Idle timeout in seconds (default: 600)
    pub idle_timeout_secs: Option<u64>,
    /// Whether to ping connections before handing them out (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    pub fn max_connections_or_default(&self, is_sqlite: bool) -> u32 {
        self.max_connections.unwrap_or(if is_sqlite {
            DEFAULT_MAX_CONNECTIONS_SQLITE
        } else {
            DEFAULT_MAX_CONNECTIONS
        })
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS)
    }

    pub fn acquire_timeout_or_default(&self) -> Duration {
        self.acquire_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == Some(0) {
            return Err(ConfigError::InvalidPoolOptions(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (self.min_connections, self.max_connections) {
            if min > max {
                return Err(ConfigError::InvalidPoolOptions(format!(
                    "min_connections ({min}) cannot exceed max_connections ({max})"
                )));
            }
        }
        if self.acquire_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidPoolOptions(
                "acquire timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to open the shared pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub connection_string: String,
    pub db_type: DatabaseType,
    pub options: PoolOptions,
}

impl PoolConfig {
    pub fn new(connection_string: impl Into<String>, options: PoolOptions) -> Result<Self, ConfigError> {
        let connection_string = connection_string.into();
        let db_type = DatabaseType::from_connection_string(&connection_string).ok_or_else(|| {
            ConfigError::UnknownDatabaseType(masked_connection_string(&connection_string))
        })?;
        options.validate()?;
        Ok(Self {
            connection_string,
            db_type,
            options,
        })
    }

    /// Connection string safe to print.
    pub fn masked(&self) -> String {
        masked_connection_string(&self.connection_string)
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "edu-assistant-db",
    about = "Database access layer of the educational virtual assistant",
    version
)]
pub struct Config {
    /// Full connection URL (mysql://, postgres://, sqlite:). Overrides the MYSQL_* settings.
    #[arg(long, value_name = "URL", env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, default_value = DEFAULT_MYSQL_HOST, env = "MYSQL_HOST")]
    pub mysql_host: String,

    #[arg(long, default_value_t = DEFAULT_MYSQL_PORT, env = "MYSQL_PORT")]
    pub mysql_port: u16,

    #[arg(long, default_value = DEFAULT_MYSQL_USER, env = "MYSQL_USER")]
    pub mysql_user: String,

    #[arg(long, default_value = "", env = "MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: String,

    #[arg(long, default_value = DEFAULT_MYSQL_DATABASE, env = "MYSQL_DATABASE")]
    pub mysql_database: String,

    /// Maximum connections in the pool
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, env = "DB_MAX_CONNECTIONS")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[arg(long, default_value_t = DEFAULT_MIN_CONNECTIONS, env = "DB_MIN_CONNECTIONS")]
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "DB_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Seconds before an idle connection is closed
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "DB_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    #[arg(long, default_value_t = crate::retry::DEFAULT_MAX_RETRIES, env = "DB_MAX_RETRIES")]
    pub max_retries: u32,

    #[arg(
        long,
        default_value_t = crate::retry::DEFAULT_INITIAL_DELAY_MS,
        env = "DB_RETRY_INITIAL_DELAY_MS"
    )]
    pub retry_initial_delay_ms: u64,

    #[arg(long, default_value_t = DEFAULT_RETRY_MAX_DELAY_MS, env = "DB_RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,

    #[arg(
        long,
        default_value_t = crate::retry::DEFAULT_BACKOFF_FACTOR,
        env = "DB_RETRY_BACKOFF_FACTOR"
    )]
    pub retry_backoff_factor: f64,

    #[arg(
        long,
        default_value_t = crate::retry::DEFAULT_JITTER_FACTOR,
        env = "DB_RETRY_JITTER_FACTOR"
    )]
    pub retry_jitter_factor: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "LOG_JSON")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check that the database answers `SELECT 1`
    Health,
    /// Run a single statement
    Query {
        sql: String,
        /// Positional parameter as a JSON value; repeat for each placeholder
        #[arg(long = "param", value_name = "JSON")]
        params: Vec<String>,
        /// Fail on the first error instead of retrying transient ones
        #[arg(long)]
        no_retry: bool,
    },
    /// Run the statements of a JSON file ([{"sql": ..., "params": [...]}]) atomically
    Transaction { file: PathBuf },
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The configured URL, or a MySQL URL assembled from the MYSQL_* settings.
    pub fn connection_string(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }

        let mut url = Url::parse("mysql://localhost")
            .map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        url.set_host(Some(&self.mysql_host))
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {e}", self.mysql_host)))?;
        url.set_port(Some(self.mysql_port))
            .map_err(|_| ConfigError::InvalidUrl("cannot set port".to_string()))?;
        url.set_username(&self.mysql_user)
            .map_err(|_| ConfigError::InvalidUrl("cannot set user".to_string()))?;
        if !self.mysql_password.is_empty() {
            url.set_password(Some(&self.mysql_password))
                .map_err(|_| ConfigError::InvalidUrl("cannot set password".to_string()))?;
        }
        url.set_path(&self.mysql_database);
        Ok(url.to_string())
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: Some(self.max_connections),
            min_connections: Some(self.min_connections),
            acquire_timeout_ms: Some(self.connect_timeout.saturating_mul(1_000)),
            idle_timeout_secs: Some(self.idle_timeout),
            test_before_acquire: None,
        }
    }

    pub fn pool_config(&self) -> Result<PoolConfig, ConfigError> {
        PoolConfig::new(self.connection_string()?, self.pool_options())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            backoff_factor: self.retry_backoff_factor,
            jitter_factor: self.retry_jitter_factor,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Minimum level of the error logger; unknown names fall back to info.
    pub fn min_log_level(&self) -> LogLevel {
        self.log_level.parse().unwrap_or(LogLevel::Info)
    }
}
