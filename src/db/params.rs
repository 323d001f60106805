//! Parameter binding for parameterized statements.
//!
//! Placeholders follow the backend's native syntax (`?` for MySQL and
//! SQLite, `$n` for PostgreSQL); values are bound positionally.

use crate::models::{QueryParam, Statement};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Build a MySQL query with every parameter of `statement` bound.
pub(crate) fn mysql_query(statement: &Statement) -> MySqlQuery<'_> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_mysql_param)
}

/// Build a PostgreSQL query with every parameter of `statement` bound.
pub(crate) fn postgres_query(statement: &Statement) -> PgQuery<'_> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_postgres_param)
}

/// Build a SQLite query with every parameter of `statement` bound.
pub(crate) fn sqlite_query(statement: &Statement) -> SqliteQuery<'_> {
    statement
        .params
        .iter()
        .fold(sqlx::query(&statement.sql), bind_sqlite_param)
}

fn bind_mysql_param<'q>(query: MySqlQuery<'q>, param: &'q QueryParam) -> MySqlQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &'q QueryParam) -> PgQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn bind_sqlite_param<'q>(query: SqliteQuery<'q>, param: &'q QueryParam) -> SqliteQuery<'q> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // No native JSON type; stored as text
        QueryParam::Json(v) => query.bind(v.to_string()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}
