//! Shared test helpers: a scripted in-memory backend and logger capture.

#![allow(dead_code)]

use edu_assistant_db::db::{Backend, BackendTransaction, DriverCode, DriverDiagnostic, DriverResult};
use edu_assistant_db::logger::{ErrorLogger, LogLevel, MemorySink};
use edu_assistant_db::models::{DatabaseType, QueryOutput, Statement};
use edu_assistant_db::retry::RetryPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Script = Arc<Mutex<VecDeque<DriverResult<QueryOutput>>>>;

/// Call counters shared between a fake backend and its transactions.
#[derive(Debug, Default)]
pub struct Counters {
    pub attempts: AtomicUsize,
    pub tx_attempts: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Counters {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
    pub fn tx_attempts(&self) -> usize {
        self.tx_attempts.load(Ordering::SeqCst)
    }
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// Backend whose results are scripted in advance.
///
/// Unscripted calls succeed with an empty output.
#[derive(Debug, Default)]
pub struct FakeBackend {
    pub counters: Arc<Counters>,
    run_script: Script,
    tx_script: Script,
    begin_error: Mutex<Option<DriverDiagnostic>>,
    commit_error: Mutex<Option<DriverDiagnostic>>,
    rollback_error: Mutex<Option<DriverDiagnostic>>,
    delay: Option<Duration>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next pooled `run` returns `result`.
    pub fn then(self, result: DriverResult<QueryOutput>) -> Self {
        self.run_script.lock().unwrap().push_back(result);
        self
    }

    /// Next `times` pooled runs fail with `code`.
    pub fn failing(self, times: usize, code: DriverCode, message: &str) -> Self {
        for _ in 0..times {
            self.run_script
                .lock()
                .unwrap()
                .push_back(Err(diag(code.clone(), message)));
        }
        self
    }

    /// Next statement inside a transaction returns `result`.
    pub fn then_in_tx(self, result: DriverResult<QueryOutput>) -> Self {
        self.tx_script.lock().unwrap().push_back(result);
        self
    }

    pub fn begin_fails(self, diagnostic: DriverDiagnostic) -> Self {
        *self.begin_error.lock().unwrap() = Some(diagnostic);
        self
    }

    pub fn commit_fails(self, diagnostic: DriverDiagnostic) -> Self {
        *self.commit_error.lock().unwrap() = Some(diagnostic);
        self
    }

    pub fn rollback_fails(self, diagnostic: DriverDiagnostic) -> Self {
        *self.rollback_error.lock().unwrap() = Some(diagnostic);
        self
    }

    /// Every round-trip takes `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// SQL text of every statement run inside a transaction, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl Backend for FakeBackend {
    type Transaction = FakeTransaction;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn run(&self, _statement: &Statement) -> DriverResult<QueryOutput> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.run_script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(QueryOutput::default()))
    }

    async fn begin(&self) -> DriverResult<FakeTransaction> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.begin_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(FakeTransaction {
            counters: self.counters.clone(),
            script: self.tx_script.clone(),
            commit_error: self.commit_error.lock().unwrap().take(),
            rollback_error: self.rollback_error.lock().unwrap().take(),
            executed: self.executed.clone(),
        })
    }
}

/// Transaction handle; dropping it counts as releasing the connection.
#[derive(Debug)]
pub struct FakeTransaction {
    counters: Arc<Counters>,
    script: Script,
    commit_error: Option<DriverDiagnostic>,
    rollback_error: Option<DriverDiagnostic>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl BackendTransaction for FakeTransaction {
    async fn run(&mut self, statement: &Statement) -> DriverResult<QueryOutput> {
        self.counters.tx_attempts.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(statement.sql.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(QueryOutput::default()))
    }

    async fn commit(mut self) -> DriverResult<()> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        match self.commit_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(mut self) -> DriverResult<()> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        match self.rollback_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for FakeTransaction {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn diag(code: DriverCode, message: &str) -> DriverDiagnostic {
    DriverDiagnostic::new(code, message)
}

pub fn rows_affected(n: u64) -> DriverResult<QueryOutput> {
    Ok(QueryOutput::affected(n, None))
}

/// Logger capturing every entry in memory.
pub fn capturing_logger() -> (Arc<ErrorLogger>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let logger = Arc::new(ErrorLogger::with_sinks(LogLevel::Debug, vec![sink.clone()]));
    (logger, sink)
}

/// Three retries, no jitter, short delays: 10, 20, 40 ms.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay_ms: 10,
        max_delay_ms: 1_000,
        backoff_factor: 2.0,
        jitter_factor: 0.0,
    }
}

/// Keep a temporary SQLite file alive for the whole test and return its URL.
pub fn temp_sqlite_url() -> String {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let db_path = temp_file
        .into_temp_path()
        .keep()
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    format!("sqlite:{}", db_path)
}
