//! PostgreSQL Backend Implementation
//!
//! Physical transactions on top of a sqlx `PgPool`. The isolation level and
//! access mode are applied with `SET TRANSACTION` right after `BEGIN`.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Pool, Postgres, Row, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::debug;

use super::core::*;
use crate::error::{TxError, TxResult};

/// Pool of PostgreSQL connections handing out physical transactions
#[derive(Debug, Clone)]
pub struct PostgresPool {
    pool: Pool<Postgres>,
}

impl PostgresPool {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with sqlx's default pool settings
    pub async fn connect(database_url: &str) -> TxResult<Self> {
        if !database_url.starts_with("postgresql://") && !database_url.starts_with("postgres://") {
            return Err(TxError::Configuration("invalid PostgreSQL URL scheme".to_string()));
        }

        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| TxError::Database(format!("failed to create PostgreSQL pool: {}", e)))?;
        Ok(Self::new(pool))
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn begin_transaction(&self, options: &BeginOptions) -> TxResult<Box<dyn DatabaseTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TxError::Begin(e.to_string()))?;

        let mut statement = format!("SET TRANSACTION ISOLATION LEVEL {}", options.isolation_level.as_sql());
        if options.read_only {
            statement.push_str(", READ ONLY");
        }
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| TxError::Begin(format!("failed to configure transaction: {}", e)))?;

        debug!("PostgreSQL transaction begun: {}", statement);
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }
}

/// One open PostgreSQL transaction
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn open(&mut self) -> TxResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| TxError::Database("transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<ExecOutcome> {
        let tx = self.open()?;
        let query = bind_all(sqlx::query(sql), params);

        // INSERT ... RETURNING id reports the generated key as the first column
        if returns_rows(sql) {
            let rows = query.fetch_all(&mut **tx).await?;
            let last_insert_id = rows.first().map(first_column_as_i64).transpose()?;
            return Ok(ExecOutcome {
                rows_affected: rows.len() as u64,
                last_insert_id,
            });
        }

        let result = query.execute(&mut **tx).await?;
        Ok(ExecOutcome::affected(result.rows_affected()))
    }

    async fn fetch_all(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<Vec<Box<dyn DatabaseRow>>> {
        let tx = self.open()?;
        let rows = bind_all(sqlx::query(sql), params).fetch_all(&mut **tx).await?;
        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow { row }) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<Option<Box<dyn DatabaseRow>>> {
        let tx = self.open()?;
        let row = bind_all(sqlx::query(sql), params).fetch_optional(&mut **tx).await?;
        Ok(row.map(|row| Box::new(PostgresRow { row }) as Box<dyn DatabaseRow>))
    }

    async fn commit(mut self: Box<Self>) -> TxResult<()> {
        let tx = self.tx.take().ok_or_else(|| TxError::Commit("transaction already completed".to_string()))?;
        tx.commit().await.map_err(|e| TxError::Commit(e.to_string()))
    }

    async fn rollback(mut self: Box<Self>) -> TxResult<()> {
        let tx = self.tx.take().ok_or_else(|| TxError::Rollback("transaction already completed".to_string()))?;
        tx.rollback().await.map_err(|e| TxError::Rollback(e.to_string()))
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::PostgreSQL
    }
}

fn returns_rows(sql: &str) -> bool {
    sql.split_whitespace().any(|word| word.eq_ignore_ascii_case("returning"))
}

fn first_column_as_i64(row: &PgRow) -> TxResult<i64> {
    row.try_get::<i64, _>(0)
        .or_else(|_| row.try_get::<i32, _>(0).map(i64::from))
        .map_err(|e| TxError::Database(format!("generated key is not an integer: {}", e)))
}

fn bind_all<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &[DatabaseValue],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params.iter().fold(query, bind_database_value)
}

fn bind_database_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(*u),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
        DatabaseValue::Json(j) => query.bind(j.clone()),
    }
}

/// Row wrapper decoding columns by their PostgreSQL type
pub struct PostgresRow {
    row: PgRow,
}

impl PostgresRow {
    fn value_at(&self, index: usize) -> TxResult<DatabaseValue> {
        let raw = self.row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(DatabaseValue::Null);
        }

        let row = &self.row;
        let value = match row.columns()[index].type_info().name() {
            "BOOL" => DatabaseValue::Bool(row.try_get(index)?),
            "INT2" => DatabaseValue::Int32(i32::from(row.try_get::<i16, _>(index)?)),
            "INT4" => DatabaseValue::Int32(row.try_get(index)?),
            "INT8" => DatabaseValue::Int64(row.try_get(index)?),
            "FLOAT4" => DatabaseValue::Float64(f64::from(row.try_get::<f32, _>(index)?)),
            "FLOAT8" => DatabaseValue::Float64(row.try_get(index)?),
            "BYTEA" => DatabaseValue::Bytes(row.try_get(index)?),
            "UUID" => DatabaseValue::Uuid(row.try_get(index)?),
            "TIMESTAMPTZ" => DatabaseValue::DateTime(row.try_get(index)?),
            "TIMESTAMP" => DatabaseValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(index)?.and_utc()),
            "JSON" | "JSONB" => DatabaseValue::Json(row.try_get(index)?),
            _ => DatabaseValue::String(row.try_get(index)?),
        };
        Ok(value)
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_name(&self, name: &str) -> TxResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|column| column.name() == name)
            .ok_or_else(|| TxError::Database(format!("column '{}' not found", name)))?;
        self.value_at(index)
    }

    fn column_names(&self) -> Vec<String> {
        self.row.columns().iter().map(|c| c.name().to_string()).collect()
    }

    fn to_json(&self) -> TxResult<JsonValue> {
        let mut fields = Map::new();
        for (index, column) in self.row.columns().iter().enumerate() {
            fields.insert(column.name().to_string(), self.value_at(index)?.to_json());
        }
        Ok(JsonValue::Object(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returning_detection() {
        assert!(returns_rows("INSERT INTO account (name) VALUES ($1) RETURNING id"));
        assert!(returns_rows("insert into account (name) values ($1) returning id"));
        assert!(!returns_rows("UPDATE account SET name = $1"));
    }

    #[tokio::test]
    async fn test_connect_rejects_other_schemes() {
        let err = PostgresPool::connect("mysql://localhost/db").await.unwrap_err();
        assert!(matches!(err, TxError::Configuration(_)));
    }
}
