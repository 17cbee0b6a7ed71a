//! Logical transactions
//!
//! A [`Transaction`] is what the body of a `run` call works with. It is bound
//! to exactly one [`PhysicalTransaction`], either privately (`isolated`) or
//! shared with every other joined transaction of its context.
//!
//! Commit of a joined transaction only releases its reference; the last one
//! out performs the real commit. Rollback of a joined transaction rolls the
//! shared physical transaction back immediately and invalidates every other
//! participant in the context.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tokio::sync::MappedMutexGuard;
use tracing::{debug, warn};

use crate::backends::{DatabaseRow, DatabaseTransaction, DatabaseValue, NamedArgs};
use crate::context::ContextId;
use crate::error::{QueryOperation, TxError, TxResult};
use crate::isolation::IsolationLevel;
use crate::physical::PhysicalTransaction;
use crate::registry::ContextRegistry;

/// Lifecycle of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Another participant rolled the shared physical transaction back
    Invalidated,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TransactionState::Active)
    }
}

/// Caller-facing transaction handle
pub struct Transaction {
    id: String,
    physical: Arc<PhysicalTransaction>,
    isolated: bool,
    state: Mutex<TransactionState>,
    failure: Mutex<Option<String>>,
    context: ContextId,
    registry: Arc<ContextRegistry>,
}

impl Transaction {
    pub(crate) fn new(
        id: String,
        physical: Arc<PhysicalTransaction>,
        isolated: bool,
        context: ContextId,
        registry: Arc<ContextRegistry>,
    ) -> Arc<Self> {
        physical.retain();
        Arc::new(Self {
            id,
            physical,
            isolated,
            state: Mutex::new(TransactionState::Active),
            failure: Mutex::new(None),
            context,
            registry,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this transaction owns a private physical transaction
    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn physical(&self) -> &Arc<PhysicalTransaction> {
        &self.physical
    }

    /// Isolation level of the underlying physical transaction
    pub fn isolation_level(&self) -> IsolationLevel {
        self.physical.options().isolation_level
    }

    /// Error message recorded from the body that ran in this transaction
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub(crate) fn record_failure(&self, message: String) {
        *self.failure.lock() = Some(message);
    }

    fn check_state(&self) -> TxResult<()> {
        if self.is_finished() {
            return Err(TxError::invalid_state(self));
        }
        Ok(())
    }

    fn finish(&self, target: TransactionState) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.is_finished() {
            return Err(TxError::invalid_state(self));
        }
        *state = target;
        Ok(())
    }

    /// Mark as doomed by a sibling's rollback
    pub(crate) fn invalidate(&self) -> bool {
        let mut state = self.state.lock();
        if *state != TransactionState::Active {
            return false;
        }
        *state = TransactionState::Invalidated;
        true
    }

    /// Commit this logical transaction.
    ///
    /// Joined transactions only commit the database transaction when they are
    /// the last participant still holding it.
    pub async fn commit(&self) -> TxResult<()> {
        self.finish(TransactionState::Committed)?;
        self.registry.release(self.context, self);

        if self.isolated {
            self.physical.release();
            self.physical.commit().await?;
        } else {
            let remaining = self.physical.release();
            if remaining == 0 {
                self.physical.commit().await?;
            } else {
                debug!("{} deferred commit, {} still joined to {}", self, remaining, self.physical);
            }
        }

        debug!("{} committed", self);
        Ok(())
    }

    /// Roll this logical transaction back.
    ///
    /// For a joined transaction this discards the whole shared transaction:
    /// the database rollback runs once, and every transaction registered in
    /// the context is deregistered.
    pub async fn rollback(&self) -> TxResult<()> {
        self.finish(TransactionState::RolledBack)?;

        if self.isolated {
            self.registry.release(self.context, self);
            self.physical.release();
            self.physical.rollback().await?;
        } else {
            self.discard_context();
            if self.physical.is_done() {
                debug!("{} is already complete, skipping database rollback", self.physical);
            } else {
                self.physical.rollback().await?;
            }
        }

        debug!("{} rolled back", self);
        Ok(())
    }

    /// Deregister the whole context and invalidate the joined siblings
    fn discard_context(&self) {
        for other in self.registry.release_all(self.context) {
            let sibling = !std::ptr::eq(Arc::as_ptr(&other), self);
            if sibling && Arc::ptr_eq(&other.physical, &self.physical) && other.invalidate() {
                debug!("{} invalidated by rollback of {}", other, self);
            }
        }
        self.physical.release_all();
    }

    /// Synchronous rollback for cancelled or dropped flows.
    ///
    /// Same bookkeeping as [`rollback`](Self::rollback), but the driver
    /// handle is dropped instead of awaited.
    pub(crate) fn abandon(&self) {
        if self.finish(TransactionState::RolledBack).is_err() {
            return;
        }
        if self.isolated {
            self.registry.release(self.context, self);
        } else {
            self.discard_context();
        }
        if self.physical.abandon() {
            warn!("{} abandoned, {} dropped without commit", self, self.physical);
        }
    }

    async fn handle(&self) -> TxResult<MappedMutexGuard<'_, Box<dyn DatabaseTransaction>>> {
        self.check_state()?;
        self.physical
            .lock()
            .await
            .ok_or_else(|| TxError::invalid_state(self))
    }

    /// Fetch a single row and deserialize it into `T`
    pub async fn fetch_one<T: DeserializeOwned>(&self, query: &str, args: &[DatabaseValue]) -> TxResult<T> {
        let mut handle = self.handle().await?;
        let row = handle
            .fetch_optional(query, args)
            .await
            .map_err(|e| TxError::query(QueryOperation::Fetch, e))?
            .ok_or_else(|| TxError::query(QueryOperation::Fetch, "no rows in result set"))?;

        decode_row(row.as_ref(), QueryOperation::Fetch)
    }

    /// Fetch every matching row, deserializing each into `T`
    pub async fn fetch_many<T: DeserializeOwned>(&self, query: &str, args: &[DatabaseValue]) -> TxResult<Vec<T>> {
        let mut handle = self.handle().await?;
        let rows = handle
            .fetch_all(query, args)
            .await
            .map_err(|e| TxError::query(QueryOperation::Select, e))?;

        rows.iter()
            .map(|row| decode_row(row.as_ref(), QueryOperation::Select))
            .collect()
    }

    /// Run an insert and return the generated id
    pub async fn insert(&self, query: &str, args: &NamedArgs) -> TxResult<i64> {
        let mut handle = self.handle().await?;
        let outcome = handle
            .execute_named(query, args)
            .await
            .map_err(|e| TxError::query(QueryOperation::Insert, e))?;

        outcome
            .last_insert_id
            .ok_or_else(|| TxError::query(QueryOperation::Insert, "no generated id was returned"))
    }

    /// Run an update and return the number of affected rows.
    ///
    /// Updating nothing is reported as a failure.
    pub async fn update(&self, query: &str, args: &NamedArgs) -> TxResult<u64> {
        let mut handle = self.handle().await?;
        let outcome = handle
            .execute_named(query, args)
            .await
            .map_err(|e| TxError::query(QueryOperation::Update, e))?;

        if outcome.rows_affected == 0 {
            return Err(TxError::query(QueryOperation::Update, "no rows affected"));
        }
        Ok(outcome.rows_affected)
    }

    /// Run a delete. Deleting nothing is logged but not an error.
    pub async fn delete(&self, query: &str, args: &NamedArgs) -> TxResult<()> {
        let mut handle = self.handle().await?;
        let outcome = handle
            .execute_named(query, args)
            .await
            .map_err(|e| TxError::query(QueryOperation::Delete, e))?;

        if outcome.rows_affected == 0 {
            warn!("{}: delete affected no rows: {}", self, query);
        }
        Ok(())
    }
}

fn decode_row<T: DeserializeOwned>(row: &dyn DatabaseRow, operation: QueryOperation) -> TxResult<T> {
    let json = row.to_json().map_err(|e| TxError::query(operation, e))?;
    serde_json::from_value(json).map_err(|e| TxError::query(operation, e))
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolated", &self.isolated)
            .field("state", &self.state())
            .field("context", &self.context)
            .field("physical", &self.physical)
            .finish()
    }
}
