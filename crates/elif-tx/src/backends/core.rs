//! Core Database Capability Traits
//!
//! The transaction manager never talks to a driver directly. It opens
//! physical transactions through [`DatabasePool`] and runs statements through
//! [`DatabaseTransaction`]; both are implemented by the backends in this
//! module's siblings or by the application.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::named::{self, NamedArgs};
use crate::error::TxResult;
use crate::isolation::IsolationLevel;

/// Options forwarded to the driver when a physical transaction is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeginOptions {
    pub isolation_level: IsolationLevel,
    pub read_only: bool,
}

/// Result of a write statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Generated key, when the driver or statement reports one
    pub last_insert_id: Option<i64>,
}

impl ExecOutcome {
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }

    pub fn inserted(id: i64) -> Self {
        Self {
            rows_affected: 1,
            last_insert_id: Some(id),
        }
    }
}

/// Source of physical transactions
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Begin a transaction with the given isolation level and access mode
    async fn begin_transaction(&self, options: &BeginOptions) -> TxResult<Box<dyn DatabaseTransaction>>;

    /// SQL dialect used for placeholder rendering
    fn dialect(&self) -> SqlDialect;
}

/// One open physical transaction
#[async_trait]
pub trait DatabaseTransaction: Send + Sync {
    /// Execute a statement with positional parameters
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<ExecOutcome>;

    /// Execute a statement with `:name` parameters
    async fn execute_named(&mut self, sql: &str, args: &NamedArgs) -> TxResult<ExecOutcome> {
        let (sql, params) = named::expand(sql, args, self.dialect())?;
        self.execute(&sql, &params).await
    }

    /// Execute a query and return all rows
    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<Vec<Box<dyn DatabaseRow>>>;

    /// Execute a query and return the first row, if any
    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<Option<Box<dyn DatabaseRow>>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> TxResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> TxResult<()>;

    fn dialect(&self) -> SqlDialect;
}

/// A fetched row
pub trait DatabaseRow: Send + Sync {
    /// Get a column value by name
    fn get_by_name(&self, name: &str) -> TxResult<DatabaseValue>;

    fn column_names(&self) -> Vec<String>;

    /// Convert the row to a JSON object keyed by column name
    fn to_json(&self) -> TxResult<JsonValue>;
}

/// Parameter and column values exchanged with the driver
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int32(i) => JsonValue::from(*i),
            DatabaseValue::Int64(i) => JsonValue::from(*i),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(b.iter().map(|&x| JsonValue::from(x)).collect()),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }

    /// Map a JSON value onto the closest database value.
    ///
    /// Strings stay strings; the driver decides how to coerce them.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => DatabaseValue::Null,
            JsonValue::Bool(b) => DatabaseValue::Bool(b),
            JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => DatabaseValue::Int64(i),
                (None, Some(f)) => DatabaseValue::Float64(f),
                (None, None) => DatabaseValue::Null,
            },
            JsonValue::String(s) => DatabaseValue::String(s),
            other => DatabaseValue::Json(other),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DatabaseValue::Null)
    }
}

/// SQL dialect, used to render bind placeholders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Placeholder for the zero-based parameter `index`
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }
}
