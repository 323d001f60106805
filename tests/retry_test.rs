//! Integration tests for the retry manager.
//!
//! Time is paused, so sleeps complete instantly while the virtual clock
//! still records exactly how long the manager waited.

mod common;

use common::{capturing_logger, fast_policy};
use edu_assistant_db::error::{DatabaseError, ErrorKind};
use edu_assistant_db::logger::{LogLevel, Metadata};
use edu_assistant_db::retry::{RetryManager, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_retryable_error_attempted_max_retries_plus_one() {
    let (logger, sink) = capturing_logger();
    let manager = RetryManager::new(fast_policy(), logger);
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = manager
        .execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::connection("Could not connect to the database")) }
            },
            &[ErrorKind::Connection, ErrorKind::Timeout],
            &Metadata::new(),
        )
        .await;

    assert_eq!(result, Err(DatabaseError::connection("Could not connect to the database")));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    assert_eq!(sink.entries_at(LogLevel::Warn).len(), 3);
    let failures = sink.entries_at(LogLevel::Error);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message, "Operation failed permanently after 4 attempt(s)");
    assert_eq!(failures[0].metadata["error_name"], "ConnectionError");
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_attempted_once() {
    let (logger, sink) = capturing_logger();
    let manager = RetryManager::new(fast_policy(), logger);
    let attempts = AtomicU32::new(0);
    let start = Instant::now();

    let result: Result<(), _> = manager
        .execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::integrity("Data integrity violation", None)) }
            },
            &[ErrorKind::Connection, ErrorKind::Timeout],
            &Metadata::new(),
        )
        .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(sink.entries_at(LogLevel::Warn).is_empty());
    assert_eq!(sink.entries_at(LogLevel::Error)[0].metadata["retryable"], false);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_means_single_attempt_without_sleep() {
    let (logger, _sink) = capturing_logger();
    let manager = RetryManager::new(RetryPolicy::no_retries(), logger);
    let attempts = AtomicU32::new(0);
    let start = Instant::now();

    let result: Result<(), _> = manager
        .execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::timeout("The database operation exceeded its time limit", 30_000)) }
            },
            &[],
            &Metadata::new(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_success_after_transient_failures() {
    let (logger, sink) = capturing_logger();
    let manager = RetryManager::new(fast_policy(), logger);
    let attempts = AtomicU32::new(0);
    let start = Instant::now();

    let result = manager
        .execute(
            || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(DatabaseError::connection("Could not connect to the database"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
            &[ErrorKind::Connection],
            &Metadata::new(),
        )
        .await;

    assert_eq!(result, Ok(3));
    // 10 ms then 20 ms
    assert!((30..32).contains(&start.elapsed().as_millis()));

    let warnings = sink.entries_at(LogLevel::Warn);
    assert_eq!(warnings.len(), 2);
    assert_eq!(warnings[0].metadata["attempt"], 1);
    assert_eq!(warnings[0].metadata["remaining"], 3);
    assert_eq!(warnings[0].metadata["delay_ms"], 10);
    assert_eq!(warnings[1].metadata["delay_ms"], 20);
    assert!(sink.entries_at(LogLevel::Error).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delay_capped_at_max_delay() {
    let (logger, sink) = capturing_logger();
    let policy = RetryPolicy {
        max_retries: 3,
        initial_delay_ms: 100,
        max_delay_ms: 500,
        backoff_factor: 10.0,
        jitter_factor: 0.0,
    };
    let manager = RetryManager::new(policy, logger);
    let start = Instant::now();

    let result: Result<(), _> = manager
        .execute(
            || async { Err(DatabaseError::connection("Could not connect to the database")) },
            &[],
            &Metadata::new(),
        )
        .await;

    assert!(result.is_err());
    // 100, then 1000 and 10000 both capped to 500
    assert!((1_100..1_102).contains(&start.elapsed().as_millis()));
    let delays: Vec<_> = sink
        .entries_at(LogLevel::Warn)
        .iter()
        .map(|e| e.metadata["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays, vec![100, 500, 500]);
}

#[tokio::test(start_paused = true)]
async fn test_jitter_never_shortens_backoff() {
    let (logger, sink) = capturing_logger();
    let policy = RetryPolicy {
        max_retries: 5,
        initial_delay_ms: 100,
        max_delay_ms: 60_000,
        backoff_factor: 2.0,
        jitter_factor: 1.0,
    };
    let manager = RetryManager::new(policy, logger);

    let _: Result<(), _> = manager
        .execute(
            || async { Err(DatabaseError::connection("Could not connect to the database")) },
            &[],
            &Metadata::new(),
        )
        .await;

    let delays: Vec<u64> = sink
        .entries_at(LogLevel::Warn)
        .iter()
        .map(|e| e.metadata["delay_ms"].as_u64().unwrap())
        .collect();
    assert_eq!(delays.len(), 5);
    assert_eq!(delays[0], 100);
    for pair in delays.windows(2) {
        // backoff of 2 with jitter up to 100% lands in [2x, 4x]
        assert!(pair[1] >= pair[0] * 2 - 1, "{:?}", delays);
        assert!(pair[1] <= pair[0] * 4 + 4, "{:?}", delays);
    }
}

#[tokio::test(start_paused = true)]
async fn test_empty_retryable_list_retries_every_kind() {
    let (logger, _sink) = capturing_logger();
    let manager = RetryManager::new(fast_policy(), logger);
    let attempts = AtomicU32::new(0);

    let result: Result<(), _> = manager
        .execute(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::query("SQL query failed: syntax", "SELEC 1", vec![])) }
            },
            &[],
            &Metadata::new(),
        )
        .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Query);
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn test_context_carried_into_logs() {
    let (logger, sink) = capturing_logger();
    let manager = RetryManager::new(RetryPolicy::no_retries(), logger);
    let mut context = Metadata::new();
    context.insert("operation".into(), "load_subjects".into());

    let _: Result<(), _> = manager
        .execute(
            || async { Err(DatabaseError::connection("Could not connect to the database")) },
            &[],
            &context,
        )
        .await;

    let entry = &sink.entries_at(LogLevel::Error)[0];
    assert_eq!(entry.metadata["operation"], "load_subjects");
    assert_eq!(entry.metadata["attempt"], 1);
}
