//! Execution contexts
//!
//! A [`TxContext`] identifies one logical flow of execution. Nested `run`
//! calls made with the same context see each other's transactions; calls
//! made with different contexts never do, whatever task or thread they run
//! on.

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::registry::ContextRegistry;
use crate::transaction::Transaction;

/// Identifier of a [`TxContext`], unique per manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Token for one flow of execution.
///
/// Created by [`TxManager::context`](crate::TxManager::context) and passed by
/// reference into every nested `run` call. Dropping the context abandons any
/// transaction it still has open, which rolls them back in the driver.
pub struct TxContext {
    id: ContextId,
    registry: Arc<ContextRegistry>,
    deadline: Option<Instant>,
}

impl TxContext {
    pub(crate) fn new(registry: Arc<ContextRegistry>, deadline: Option<Instant>) -> Self {
        let id = registry.next_context_id();
        Self {
            id,
            registry,
            deadline,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Deadline for starting physical transactions, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of logical transactions currently open
    pub fn depth(&self) -> usize {
        self.registry.depth(self.id)
    }

    /// Open logical transactions, root first
    pub fn open_transactions(&self) -> Vec<Arc<Transaction>> {
        self.registry.open_transactions(self.id)
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<ContextRegistry>) -> bool {
        Arc::ptr_eq(&self.registry, registry)
    }
}

impl fmt::Debug for TxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxContext")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("depth", &self.depth())
            .finish()
    }
}

impl Drop for TxContext {
    fn drop(&mut self) {
        self.registry.abandon(self.id);
    }
}
