//! Per-context transaction registry
//!
//! Each [`TxContext`] owns an ordered stack of the logical transactions it
//! has open. The first entry is the root; `Required` transactions join the
//! root's physical transaction, `RequiresNew` ones begin their own.

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backends::DatabasePool;
use crate::config::TxConfig;
use crate::context::{ContextId, TxContext};
use crate::error::{TxError, TxResult};
use crate::options::{Propagation, RunOptions};
use crate::physical::PhysicalTransaction;
use crate::transaction::Transaction;

pub struct ContextRegistry {
    pool: Arc<dyn DatabasePool>,
    contexts: Mutex<HashMap<ContextId, Vec<Arc<Transaction>>>>,
    next_context: AtomicU64,
    id_length: usize,
    begin_timeout: Option<Duration>,
}

impl ContextRegistry {
    pub(crate) fn new(pool: Arc<dyn DatabasePool>, config: &TxConfig) -> Self {
        Self {
            pool,
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
            id_length: *config.get_id_length(),
            begin_timeout: *config.get_begin_timeout(),
        }
    }

    pub(crate) fn next_context_id(&self) -> ContextId {
        ContextId::new(self.next_context.fetch_add(1, Ordering::SeqCst))
    }

    /// Open a logical transaction in `ctx` according to `options`
    pub(crate) async fn resolve(self: &Arc<Self>, ctx: &TxContext, options: &RunOptions) -> TxResult<Arc<Transaction>> {
        let id = self.generate_id();
        let isolated = options.propagation == Propagation::RequiresNew;

        // The root can appear or go away while a begin is awaited, so the
        // join decision is only final under the lock
        let mut fresh = None;
        let (tx, depth) = loop {
            if fresh.is_none() && (isolated || self.root(ctx.id()).is_none()) {
                fresh = Some(self.begin_physical(ctx, options, &id).await?);
            }
            if let Some(registered) = self.register(ctx.id(), &id, isolated, &mut fresh) {
                break registered;
            }
        };

        if let Some(surplus) = fresh {
            debug!("{} joined a root opened concurrently, discarding {}", tx, surplus);
            if let Err(err) = surplus.rollback().await {
                warn!("rollback of unused {} failed: {}", surplus, err);
            }
        }

        debug!(
            "{} opened in {} ({}, joined: {}, depth: {})",
            tx,
            ctx.id(),
            options.propagation,
            !isolated && depth > 1,
            depth
        );
        Ok(tx)
    }

    /// Push a new logical transaction onto the context's stack.
    ///
    /// Joins the current root unless `isolated`; otherwise consumes `fresh`.
    /// Returns `None` when a physical transaction still has to be begun.
    fn register(
        self: &Arc<Self>,
        ctx: ContextId,
        id: &str,
        isolated: bool,
        fresh: &mut Option<Arc<PhysicalTransaction>>,
    ) -> Option<(Arc<Transaction>, usize)> {
        let mut contexts = self.contexts.lock();
        let root = contexts
            .get(&ctx)
            .and_then(|stack| stack.first())
            .map(|root| Arc::clone(root.physical()));

        let physical = match root {
            Some(root) if !isolated => root,
            _ => fresh.take()?,
        };

        let tx = Transaction::new(id.to_string(), physical, isolated, ctx, Arc::clone(self));
        let stack = contexts.entry(ctx).or_default();
        stack.push(Arc::clone(&tx));
        Some((tx, stack.len()))
    }

    fn root(&self, ctx: ContextId) -> Option<Arc<Transaction>> {
        self.contexts
            .lock()
            .get(&ctx)
            .and_then(|stack| stack.first().cloned())
    }

    async fn begin_physical(
        &self,
        ctx: &TxContext,
        options: &RunOptions,
        label: &str,
    ) -> TxResult<Arc<PhysicalTransaction>> {
        let begin_options = options.begin_options();
        let dialect = self.pool.dialect();
        if !begin_options.isolation_level.is_supported_by(dialect) {
            warn!("{:?} does not support {}, the driver default applies", dialect, begin_options.isolation_level);
        }
        let begin = self.pool.begin_transaction(&begin_options);

        let deadline = ctx
            .deadline()
            .or_else(|| self.begin_timeout.map(|timeout| Instant::now() + timeout));
        let handle = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, begin)
                .await
                .map_err(|_| TxError::Timeout)??,
            None => begin.await?,
        };

        debug!(
            "began physical transaction {} at {}{}",
            label,
            begin_options.isolation_level,
            if begin_options.read_only { " (read only)" } else { "" }
        );
        Ok(Arc::new(PhysicalTransaction::new(label.to_string(), begin_options, handle)))
    }

    /// Remove one transaction from its context's stack
    pub(crate) fn release(&self, ctx: ContextId, tx: &Transaction) -> bool {
        let mut contexts = self.contexts.lock();
        let Some(stack) = contexts.get_mut(&ctx) else {
            return false;
        };

        let before = stack.len();
        stack.retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), tx));
        let removed = stack.len() != before;
        if stack.is_empty() {
            contexts.remove(&ctx);
        }
        removed
    }

    /// Remove every transaction of a context, returning them
    pub(crate) fn release_all(&self, ctx: ContextId) -> Vec<Arc<Transaction>> {
        self.contexts.lock().remove(&ctx).unwrap_or_default()
    }

    /// Transactions open in `ctx`, root first
    pub fn open_transactions(&self, ctx: ContextId) -> Vec<Arc<Transaction>> {
        self.contexts.lock().get(&ctx).cloned().unwrap_or_default()
    }

    pub fn depth(&self, ctx: ContextId) -> usize {
        self.contexts.lock().get(&ctx).map_or(0, Vec::len)
    }

    /// Number of contexts with at least one open transaction
    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Drop everything still open in `ctx` without awaiting the database.
    /// Returns how many transactions were abandoned.
    pub(crate) fn abandon(&self, ctx: ContextId) -> usize {
        let leftovers = self.release_all(ctx);
        if !leftovers.is_empty() {
            warn!("abandoning {} open transaction(s) in {}", leftovers.len(), ctx);
        }
        for tx in &leftovers {
            tx.abandon();
        }
        leftovers.len()
    }

    fn generate_id(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(self.id_length)
            .map(char::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, MemoryEvent};
    use crate::config::TxConfigBuilder;
    use crate::isolation::IsolationLevel;

    fn registry(backend: &MemoryBackend, config: TxConfig) -> Arc<ContextRegistry> {
        Arc::new(ContextRegistry::new(Arc::new(backend.clone()), &config))
    }

    #[tokio::test]
    async fn test_required_joins_root_and_requires_new_does_not() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, TxConfig::default());
        let ctx = TxContext::new(Arc::clone(&registry), None);

        let root = registry.resolve(&ctx, &RunOptions::required()).await.unwrap();
        let isolated = registry.resolve(&ctx, &RunOptions::requires_new()).await.unwrap();
        let joined = registry.resolve(&ctx, &RunOptions::required()).await.unwrap();

        assert!(!root.is_isolated());
        assert!(isolated.is_isolated());
        // Joining always targets the root, not the innermost entry
        assert!(Arc::ptr_eq(joined.physical(), root.physical()));
        assert_eq!(registry.depth(ctx.id()), 3);
        assert_eq!(backend.stats().begun, 2);

        let open = registry.open_transactions(ctx.id());
        assert!(Arc::ptr_eq(&open[0], &root));
        assert!(Arc::ptr_eq(&open[2], &joined));
    }

    #[tokio::test]
    async fn test_isolation_level_only_applies_to_new_physical() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, TxConfig::default());
        let ctx = TxContext::new(Arc::clone(&registry), None);

        registry.resolve(&ctx, &RunOptions::required()).await.unwrap();
        let joined = registry
            .resolve(&ctx, &RunOptions::required().isolation_level(IsolationLevel::Serializable))
            .await
            .unwrap();

        assert_eq!(joined.isolation_level(), IsolationLevel::RepeatableRead);
        assert_eq!(backend.stats().begun, 1);
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, TxConfig::default());
        let first = TxContext::new(Arc::clone(&registry), None);
        let second = TxContext::new(Arc::clone(&registry), None);
        assert_ne!(first.id(), second.id());

        let a = registry.resolve(&first, &RunOptions::required()).await.unwrap();
        let b = registry.resolve(&second, &RunOptions::required()).await.unwrap();

        assert!(!Arc::ptr_eq(a.physical(), b.physical()));
        assert_eq!(registry.context_count(), 2);

        registry.release(first.id(), &a);
        assert_eq!(registry.context_count(), 1);
        assert_eq!(registry.depth(second.id()), 1);
    }

    #[tokio::test]
    async fn test_generated_ids_use_configured_length() {
        let backend = MemoryBackend::new();
        let config = TxConfigBuilder::new()
            .id_length(16)
            .build()
            .expect("Failed to build config");
        let registry = registry(&backend, config);
        let ctx = TxContext::new(Arc::clone(&registry), None);

        let tx = registry.resolve(&ctx, &RunOptions::required()).await.unwrap();
        assert_eq!(tx.id().len(), 16);
        assert!(tx.id().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(tx.to_string(), format!("tx-{}", tx.id()));
    }

    #[tokio::test]
    async fn test_begin_timeout() {
        let backend = MemoryBackend::new();
        backend.set_begin_delay(Duration::from_millis(200));
        let config = TxConfigBuilder::new()
            .begin_timeout(Some(Duration::from_millis(20)))
            .build()
            .expect("Failed to build config");
        let registry = registry(&backend, config);
        let ctx = TxContext::new(Arc::clone(&registry), None);

        let err = registry.resolve(&ctx, &RunOptions::required()).await.unwrap_err();
        assert_eq!(err, TxError::Timeout);
        assert_eq!(registry.depth(ctx.id()), 0);
    }

    #[tokio::test]
    async fn test_abandon_drops_every_handle() {
        let backend = MemoryBackend::new();
        let registry = registry(&backend, TxConfig::default());
        let ctx = TxContext::new(Arc::clone(&registry), None);

        registry.resolve(&ctx, &RunOptions::required()).await.unwrap();
        registry.resolve(&ctx, &RunOptions::requires_new()).await.unwrap();

        assert_eq!(registry.abandon(ctx.id()), 2);
        assert_eq!(registry.context_count(), 0);
        let dropped: Vec<_> = backend
            .events()
            .into_iter()
            .filter(|event| matches!(event, MemoryEvent::Dropped { .. }))
            .collect();
        assert_eq!(dropped.len(), 2);
    }
}
