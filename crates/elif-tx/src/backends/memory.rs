//! In-memory database backend for development and testing
//!
//! Nothing is parsed or stored as tables. The backend journals every begin,
//! statement, commit and rollback, keeps the statements of committed
//! transactions, and answers queries from scripted responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::core::*;
use crate::error::{TxError, TxResult};
use crate::isolation::IsolationLevel;

/// Something the backend observed
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEvent {
    Begin {
        tx: u64,
        isolation_level: IsolationLevel,
        read_only: bool,
    },
    Execute {
        tx: u64,
        sql: String,
        params: Vec<DatabaseValue>,
    },
    Fetch {
        tx: u64,
        sql: String,
    },
    Commit {
        tx: u64,
    },
    Rollback {
        tx: u64,
    },
    /// Transaction dropped without commit or rollback; its work is discarded
    Dropped {
        tx: u64,
    },
}

/// Scripted answer for statements containing a given fragment
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryResponse {
    Rows(Vec<JsonValue>),
    Affected(u64),
    Fail(String),
}

/// A write statement that was part of a committed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStatement {
    pub tx: u64,
    pub sql: String,
    pub params: Vec<DatabaseValue>,
}

/// Counters derived from the journal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct FailurePlan {
    begin: Option<String>,
    commit: Option<String>,
    rollback: Option<String>,
}

struct MemoryState {
    dialect: SqlDialect,
    next_tx: AtomicU64,
    next_insert_id: AtomicI64,
    journal: Mutex<Vec<MemoryEvent>>,
    committed: Mutex<Vec<MemoryStatement>>,
    responses: Mutex<Vec<(String, MemoryResponse)>>,
    failures: Mutex<FailurePlan>,
    begin_delay: Mutex<Option<Duration>>,
}

impl MemoryState {
    fn record(&self, event: MemoryEvent) {
        self.journal.lock().push(event);
    }

    fn response_for(&self, sql: &str) -> Option<MemoryResponse> {
        self.responses
            .lock()
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, response)| response.clone())
    }
}

/// In-memory backend; clones share the same journal
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    /// Create a backend rendering PostgreSQL placeholders
    pub fn new() -> Self {
        Self::with_dialect(SqlDialect::PostgreSQL)
    }

    pub fn with_dialect(dialect: SqlDialect) -> Self {
        Self {
            state: Arc::new(MemoryState {
                dialect,
                next_tx: AtomicU64::new(1),
                next_insert_id: AtomicI64::new(1),
                journal: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                responses: Mutex::new(Vec::new()),
                failures: Mutex::new(FailurePlan::default()),
                begin_delay: Mutex::new(None),
            }),
        }
    }

    /// Answer statements containing `fragment` with `response`.
    /// Earlier registrations win.
    pub fn respond_to(&self, fragment: impl Into<String>, response: MemoryResponse) -> &Self {
        self.state.responses.lock().push((fragment.into(), response));
        self
    }

    pub fn fail_begin(&self, message: impl Into<String>) -> &Self {
        self.state.failures.lock().begin = Some(message.into());
        self
    }

    pub fn fail_commit(&self, message: impl Into<String>) -> &Self {
        self.state.failures.lock().commit = Some(message.into());
        self
    }

    pub fn fail_rollback(&self, message: impl Into<String>) -> &Self {
        self.state.failures.lock().rollback = Some(message.into());
        self
    }

    /// Delay every begin, to simulate a slow or exhausted pool
    pub fn set_begin_delay(&self, delay: Duration) -> &Self {
        *self.state.begin_delay.lock() = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<MemoryEvent> {
        self.state.journal.lock().clone()
    }

    /// Statements of every committed transaction, in commit order
    pub fn committed(&self) -> Vec<MemoryStatement> {
        self.state.committed.lock().clone()
    }

    pub fn stats(&self) -> MemoryStats {
        self.state
            .journal
            .lock()
            .iter()
            .fold(MemoryStats::default(), |mut stats, event| {
                match event {
                    MemoryEvent::Begin { .. } => stats.begun += 1,
                    MemoryEvent::Commit { .. } => stats.committed += 1,
                    MemoryEvent::Rollback { .. } => stats.rolled_back += 1,
                    MemoryEvent::Dropped { .. } => stats.dropped += 1,
                    MemoryEvent::Execute { .. } | MemoryEvent::Fetch { .. } => {}
                }
                stats
            })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabasePool for MemoryBackend {
    async fn begin_transaction(&self, options: &BeginOptions) -> TxResult<Box<dyn DatabaseTransaction>> {
        let delay = *self.state.begin_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.state.failures.lock().begin.clone() {
            return Err(TxError::Begin(message));
        }

        let id = self.state.next_tx.fetch_add(1, Ordering::SeqCst);
        self.state.record(MemoryEvent::Begin {
            tx: id,
            isolation_level: options.isolation_level,
            read_only: options.read_only,
        });
        debug!("memory transaction {} begun at {}", id, options.isolation_level);

        Ok(Box::new(MemoryTransaction {
            id,
            state: Arc::clone(&self.state),
            pending: Vec::new(),
            finished: false,
        }))
    }

    fn dialect(&self) -> SqlDialect {
        self.state.dialect
    }
}

/// Transaction handed out by [`MemoryBackend`]
pub struct MemoryTransaction {
    id: u64,
    state: Arc<MemoryState>,
    pending: Vec<MemoryStatement>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> TxResult<()> {
        if self.finished {
            return Err(TxError::Database(format!(
                "memory transaction {} already completed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<ExecOutcome> {
        self.ensure_open()?;
        self.state.record(MemoryEvent::Execute {
            tx: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        let rows_affected = match self.state.response_for(sql) {
            Some(MemoryResponse::Fail(message)) => return Err(TxError::Database(message)),
            Some(MemoryResponse::Affected(rows)) => rows,
            Some(MemoryResponse::Rows(rows)) => rows.len() as u64,
            None => 1,
        };

        self.pending.push(MemoryStatement {
            tx: self.id,
            sql: sql.to_string(),
            params: params.to_vec(),
        });

        let is_insert = sql.trim_start().to_lowercase().starts_with("insert");
        let last_insert_id = if is_insert && rows_affected > 0 {
            Some(self.state.next_insert_id.fetch_add(1, Ordering::SeqCst))
        } else {
            None
        };

        Ok(ExecOutcome {
            rows_affected,
            last_insert_id,
        })
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[DatabaseValue]) -> TxResult<Vec<Box<dyn DatabaseRow>>> {
        self.ensure_open()?;
        self.state.record(MemoryEvent::Fetch {
            tx: self.id,
            sql: sql.to_string(),
        });

        match self.state.response_for(sql) {
            Some(MemoryResponse::Fail(message)) => Err(TxError::Database(message)),
            Some(MemoryResponse::Rows(rows)) => Ok(rows
                .into_iter()
                .map(|row| Box::new(JsonRow::new(row)) as Box<dyn DatabaseRow>)
                .collect()),
            Some(MemoryResponse::Affected(_)) | None => Ok(Vec::new()),
        }
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[DatabaseValue]) -> TxResult<Option<Box<dyn DatabaseRow>>> {
        Ok(self.fetch_all(sql, params).await?.into_iter().next())
    }

    async fn commit(mut self: Box<Self>) -> TxResult<()> {
        self.ensure_open()?;
        self.finished = true;

        if let Some(message) = self.state.failures.lock().commit.clone() {
            return Err(TxError::Commit(message));
        }

        let pending = std::mem::take(&mut self.pending);
        self.state.committed.lock().extend(pending);
        self.state.record(MemoryEvent::Commit { tx: self.id });
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> TxResult<()> {
        self.ensure_open()?;
        self.finished = true;

        if let Some(message) = self.state.failures.lock().rollback.clone() {
            return Err(TxError::Rollback(message));
        }

        self.pending.clear();
        self.state.record(MemoryEvent::Rollback { tx: self.id });
        Ok(())
    }

    fn dialect(&self) -> SqlDialect {
        self.state.dialect
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.state.record(MemoryEvent::Dropped { tx: self.id });
        }
    }
}

/// Row backed by a JSON object
pub struct JsonRow {
    fields: Map<String, JsonValue>,
}

impl JsonRow {
    pub fn new(value: JsonValue) -> Self {
        let fields = match value {
            JsonValue::Object(fields) => fields,
            // Bare scalars behave like an unnamed single column
            other => {
                let mut fields = Map::new();
                fields.insert("?column?".to_string(), other);
                fields
            }
        };
        Self { fields }
    }
}

impl DatabaseRow for JsonRow {
    fn get_by_name(&self, name: &str) -> TxResult<DatabaseValue> {
        self.fields
            .get(name)
            .cloned()
            .map(DatabaseValue::from_json)
            .ok_or_else(|| TxError::Database(format!("column '{}' not found", name)))
    }

    fn column_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn to_json(&self) -> TxResult<JsonValue> {
        Ok(JsonValue::Object(self.fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_moves_pending_statements() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin_transaction(&BeginOptions::default()).await.unwrap();

        let outcome = tx
            .execute("INSERT INTO account (name) VALUES ($1)", &["alice".into()])
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::inserted(1));
        assert!(backend.committed().is_empty());

        tx.commit().await.unwrap();

        let committed = backend.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].params, vec![DatabaseValue::from("alice")]);
        assert_eq!(
            backend.stats(),
            MemoryStats {
                begun: 1,
                committed: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_work() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin_transaction(&BeginOptions::default()).await.unwrap();
        tx.execute("UPDATE account SET name = 'x'", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = backend.begin_transaction(&BeginOptions::default()).await.unwrap();
        tx.execute("UPDATE account SET name = 'y'", &[]).await.unwrap();
        drop(tx);

        assert!(backend.committed().is_empty());
        let stats = backend.stats();
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_scripted_responses() {
        let backend = MemoryBackend::new();
        backend
            .respond_to("FROM account", MemoryResponse::Rows(vec![json!({"id": 1, "name": "a"})]))
            .respond_to("DELETE", MemoryResponse::Affected(0))
            .respond_to("broken", MemoryResponse::Fail("syntax error".to_string()));

        let mut tx = backend.begin_transaction(&BeginOptions::default()).await.unwrap();

        let row = tx.fetch_optional("SELECT * FROM account", &[]).await.unwrap().unwrap();
        assert_eq!(row.get_by_name("name").unwrap(), DatabaseValue::from("a"));
        assert_eq!(row.to_json().unwrap(), json!({"id": 1, "name": "a"}));

        let outcome = tx.execute("DELETE FROM account", &[]).await.unwrap();
        assert_eq!(outcome.rows_affected, 0);

        let err = tx.execute("broken sql", &[]).await.unwrap_err();
        assert_eq!(err, TxError::Database("syntax error".to_string()));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MemoryBackend::new();
        backend.fail_commit("disk full");

        let tx = backend.begin_transaction(&BeginOptions::default()).await.unwrap();
        assert_eq!(tx.commit().await.unwrap_err(), TxError::Commit("disk full".to_string()));
        // A failed commit is not reported as dropped
        assert_eq!(backend.stats().dropped, 0);

        backend.fail_begin("too many connections");
        let err = backend.begin_transaction(&BeginOptions::default()).await.err().unwrap();
        assert_eq!(err, TxError::Begin("too many connections".to_string()));
    }

    #[tokio::test]
    async fn test_begin_records_options() {
        let backend = MemoryBackend::with_dialect(SqlDialect::SQLite);
        let options = BeginOptions {
            isolation_level: IsolationLevel::Serializable,
            read_only: true,
        };
        let _tx = backend.begin_transaction(&options).await.unwrap();

        assert_eq!(backend.dialect(), SqlDialect::SQLite);
        assert_eq!(
            backend.events()[0],
            MemoryEvent::Begin {
                tx: 1,
                isolation_level: IsolationLevel::Serializable,
                read_only: true,
            }
        );
    }
}
