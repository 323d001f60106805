//! Driver diagnostic classification.
//!
//! Ordered rules, first match wins: connection, timeout, integrity,
//! permission, and everything else is a query error. Classification is a
//! pure function of the diagnostic and the statement; [`classify`] also
//! forwards the raw diagnostic to the error logger before returning.

use super::diagnostic::{DriverCode, DriverDiagnostic};
use crate::error::{DEFAULT_TIMEOUT_MS, DatabaseError};
use crate::logger::ErrorLogger;
use crate::models::QueryParam;
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

const UNKNOWN: &str = "unknown";

/// Log `diagnostic` untouched, then classify it.
pub fn classify(
    diagnostic: &DriverDiagnostic,
    sql: &str,
    params: &[QueryParam],
    logger: &ErrorLogger,
) -> DatabaseError {
    logger.driver_failure(diagnostic, sql, params);
    classify_diagnostic(diagnostic, sql, params)
}

/// Map a diagnostic to exactly one [`DatabaseError`].
pub fn classify_diagnostic(
    diagnostic: &DriverDiagnostic,
    sql: &str,
    params: &[QueryParam],
) -> DatabaseError {
    match &diagnostic.code {
        DriverCode::ConnectionRefused
        | DriverCode::ConnectionLost
        | DriverCode::HostNotFound
        | DriverCode::NetworkTimeout
        | DriverCode::PoolClosed => DatabaseError::connection("Could not connect to the database"),

        DriverCode::SequenceTimeout
        | DriverCode::PoolAcquireTimeout
        | DriverCode::LockWaitTimeout => DatabaseError::timeout(
            "The database operation exceeded its time limit",
            diagnostic.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        ),

        DriverCode::DuplicateEntry | DriverCode::NoReferencedRow | DriverCode::RowIsReferenced => {
            let constraint = diagnostic
                .constraint
                .clone()
                .or_else(|| constraint_from_message(&diagnostic.message));
            DatabaseError::integrity("Data integrity violation", constraint)
        }

        DriverCode::AccessDenied | DriverCode::DbAccessDenied | DriverCode::TableAccessDenied => {
            let target = permission_from_message(&diagnostic.message);
            let statement = permission_from_statement(sql);
            let operation = target
                .operation
                .or(statement.operation)
                .unwrap_or_else(|| UNKNOWN.to_string());
            let resource = target
                .resource
                .or(statement.resource)
                .unwrap_or_else(|| UNKNOWN.to_string());
            DatabaseError::permission("Insufficient database privileges", operation, resource)
        }

        DriverCode::Other(_) => DatabaseError::query(
            format!("SQL query failed: {}", diagnostic.message),
            sql,
            params.to_vec(),
        ),
    }
}

/// Constraint name from common driver phrasings.
///
/// MySQL: `Duplicate entry 'x' for key 'users.email'` and
/// ``... CONSTRAINT `messages_ibfk_1` FOREIGN KEY ...``.
/// SQLite: `UNIQUE constraint failed: users.email`.
fn constraint_from_message(message: &str) -> Option<String> {
    if let Some(rest) = after(message, "for key ") {
        return quoted(rest);
    }
    if let Some(rest) = after(message, "CONSTRAINT ") {
        return quoted(rest);
    }
    if let Some(rest) = after(message, "constraint failed: ") {
        let name = rest.split([',', ' ']).next().unwrap_or("").trim();
        return (!name.is_empty()).then(|| name.to_string());
    }
    if let Some(rest) = after(message, "constraint ") {
        return quoted(rest);
    }
    None
}

#[derive(Debug, Default, PartialEq)]
struct PermissionTarget {
    operation: Option<String>,
    resource: Option<String>,
}

/// Operation and resource named by an access-denied message.
fn permission_from_message(message: &str) -> PermissionTarget {
    let mut target = PermissionTarget::default();

    // MySQL: "SELECT command denied to user 'u'@'h' for table 'students'"
    if let Some(idx) = message.find(" command denied") {
        target.operation = message[..idx]
            .split_whitespace()
            .last()
            .map(|op| op.to_ascii_uppercase());
        target.resource = after(message, "in table ")
            .or_else(|| after(message, "for table "))
            .and_then(quoted);
        return target;
    }

    // MySQL: "Access denied for user 'u'@'h' to database 'edu_assistant_db'"
    if let Some(rest) = after(message, "to database ") {
        target.operation = Some("CONNECT".to_string());
        target.resource = quoted(rest);
        return target;
    }

    // MySQL: "Access denied for user 'u'@'h' (using password: YES)"
    if message.starts_with("Access denied for user") {
        target.operation = Some("CONNECT".to_string());
        return target;
    }

    // PostgreSQL: "permission denied for table students"
    if let Some(rest) = after(message, "permission denied for ") {
        let mut words = rest.split_whitespace();
        let _object_kind = words.next();
        target.resource = words.next().map(|name| name.trim_matches('"').to_string());
    }

    target
}

/// Operation keyword and target table parsed out of the statement itself.
fn permission_from_statement(sql: &str) -> PermissionTarget {
    let dialect = GenericDialect {};
    let Ok(tokens) = Tokenizer::new(&dialect, sql).tokenize() else {
        return PermissionTarget::default();
    };
    let tokens: Vec<Token> = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut target = PermissionTarget::default();
    let mut iter = tokens.iter().enumerate();
    while let Some((idx, token)) = iter.next() {
        let Token::Word(word) = token else { continue };
        if target.operation.is_none() {
            target.operation = Some(word.value.to_ascii_uppercase());
        }
        let upper = word.value.to_ascii_uppercase();
        if matches!(upper.as_str(), "FROM" | "INTO" | "UPDATE" | "TABLE" | "JOIN") {
            if let Some(name) = object_name(&tokens[idx + 1..]) {
                target.resource = Some(name);
                break;
            }
        }
    }
    target
}

/// Possibly dotted identifier at the start of `tokens`.
fn object_name(tokens: &[Token]) -> Option<String> {
    let mut parts = Vec::new();
    let mut expect_word = true;
    for token in tokens {
        match token {
            Token::Word(word) if expect_word => {
                parts.push(word.value.clone());
                expect_word = false;
            }
            Token::Period if !expect_word => expect_word = true,
            _ => break,
        }
    }
    (!parts.is_empty()).then(|| parts.join("."))
}

fn after<'a>(haystack: &'a str, needle: &str) -> Option<&'a str> {
    haystack.find(needle).map(|idx| &haystack[idx + needle.len()..])
}

/// First quoted name in `text`, accepting ', ` and " and dotted backtick names.
fn quoted(text: &str) -> Option<String> {
    let text = text.trim_start();
    let quote = text.chars().next().filter(|c| matches!(c, '\'' | '`' | '"'))?;
    let mut name = String::new();
    let mut rest = &text[quote.len_utf8()..];
    loop {
        let end = rest.find(quote)?;
        name.push_str(&rest[..end]);
        rest = &rest[end + quote.len_utf8()..];
        // `db`.`table`
        if quote == '`' && rest.starts_with(".`") {
            name.push('.');
            rest = &rest[2..];
            continue;
        }
        break;
    }
    (!name.is_empty()).then_some(name)
}
