//! Transaction manager
//!
//! [`TxManager::run`] executes a body inside a logical transaction. Depending
//! on the propagation it joins the context's root transaction or opens a
//! dedicated one. After the body:
//!
//! - `Ok` commits the logical transaction
//! - `Err` rolls it back and returns the body's error
//! - a panic rolls back everything open in the context and resumes unwinding
//! - dropping the future abandons the transaction, which rolls it back in the
//!   driver

use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::backends::DatabasePool;
use crate::config::TxConfig;
use crate::context::TxContext;
use crate::error::{TxError, TxResult};
use crate::options::RunOptions;
use crate::registry::ContextRegistry;
use crate::transaction::{Transaction, TransactionState};

/// Entry point for running code in nested transactions
#[derive(Clone)]
pub struct TxManager {
    registry: Arc<ContextRegistry>,
    config: Arc<TxConfig>,
}

impl TxManager {
    /// Create a manager, rejecting an invalid configuration
    pub fn new(pool: Arc<dyn DatabasePool>, config: TxConfig) -> TxResult<Self> {
        config.validate()?;
        Ok(Self::with_config(pool, config))
    }

    /// Manager with the default configuration
    pub fn with_defaults(pool: Arc<dyn DatabasePool>) -> Self {
        Self::with_config(pool, TxConfig::default())
    }

    fn with_config(pool: Arc<dyn DatabasePool>, config: TxConfig) -> Self {
        let registry = Arc::new(ContextRegistry::new(pool, &config));
        Self {
            registry,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Start a new flow of execution.
    ///
    /// Physical transactions begun in this context wait at most
    /// `begin_timeout` for a connection.
    pub fn context(&self) -> TxContext {
        TxContext::new(Arc::clone(&self.registry), None)
    }

    /// Start a new flow whose transactions must begin before `deadline`
    pub fn context_with_deadline(&self, deadline: Instant) -> TxContext {
        TxContext::new(Arc::clone(&self.registry), Some(deadline))
    }

    pub fn context_with_timeout(&self, timeout: Duration) -> TxContext {
        self.context_with_deadline(Instant::now() + timeout)
    }

    /// Number of contexts that currently have open transactions
    pub fn active_contexts(&self) -> usize {
        self.registry.context_count()
    }

    /// Run `body` with the configured default options.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` was created by a different manager.
    #[track_caller]
    pub fn run<'a, F, Fut, R, E>(&'a self, ctx: &'a TxContext, body: F) -> impl Future<Output = Result<R, E>> + 'a
    where
        F: FnOnce(Arc<Transaction>) -> Fut + 'a,
        Fut: Future<Output = Result<R, E>> + 'a,
        R: 'a,
        E: From<TxError> + fmt::Display + 'a,
    {
        self.run_with(ctx, self.config.default_options(), body)
    }

    /// Run `body` with explicit propagation and isolation options.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` was created by a different manager.
    #[track_caller]
    pub fn run_with<'a, F, Fut, R, E>(
        &'a self,
        ctx: &'a TxContext,
        options: RunOptions,
        body: F,
    ) -> impl Future<Output = Result<R, E>> + 'a
    where
        F: FnOnce(Arc<Transaction>) -> Fut + 'a,
        Fut: Future<Output = Result<R, E>> + 'a,
        R: 'a,
        E: From<TxError> + fmt::Display + 'a,
    {
        assert!(
            ctx.belongs_to(&self.registry),
            "{} was created by a different TxManager",
            ctx.id()
        );
        self.execute(ctx, options, body, Location::caller())
    }

    async fn execute<F, Fut, R, E>(
        &self,
        ctx: &TxContext,
        options: RunOptions,
        body: F,
        caller: &'static Location<'static>,
    ) -> Result<R, E>
    where
        F: FnOnce(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<TxError> + fmt::Display,
    {
        if *self.config.get_log_callers() {
            debug!("Tx caller: {}", caller);
        }

        let tx = self.registry.resolve(ctx, &options).await?;
        let mut guard = CancelGuard::new(&tx);

        let handle = Arc::clone(&tx);
        let outcome = AssertUnwindSafe(async move { body(handle).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                guard.disarm();
                error!("{} panicked, rolling back {} open transaction(s)", tx, ctx.depth().max(1));
                self.rollback_open(ctx, &tx).await;
                panic::resume_unwind(payload);
            }
        };

        let result = match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    warn!("{} commit failed: {}", tx, err);
                    Err(E::from(err))
                }
            },
            Err(err) => Err(self.rollback_failed(&tx, err).await),
        };

        guard.disarm();
        result
    }

    /// Roll back after the body returned `err`; a rollback failure replaces it
    async fn rollback_failed<E>(&self, tx: &Transaction, err: E) -> E
    where
        E: From<TxError> + fmt::Display,
    {
        tx.record_failure(err.to_string());
        debug!("{} failed: {}", tx, err);

        match tx.state() {
            TransactionState::Active => {}
            TransactionState::Invalidated => {
                debug!("{} was already rolled back by a joined transaction", tx);
                return err;
            }
            // Finished from inside the body; there is nothing left to undo
            TransactionState::Committed | TransactionState::RolledBack => return err,
        }

        match tx.rollback().await {
            Ok(()) => err,
            Err(rollback_err) => {
                warn!("{} rollback failed: {} (body error: {})", tx, rollback_err, err);
                E::from(rollback_err)
            }
        }
    }

    /// Roll back every transaction still open in `ctx`, innermost first
    async fn rollback_open(&self, ctx: &TxContext, current: &Arc<Transaction>) {
        let mut open = ctx.open_transactions();
        if !open.iter().any(|tx| Arc::ptr_eq(tx, current)) {
            open.push(Arc::clone(current));
        }

        for tx in open.iter().rev() {
            if tx.state() != TransactionState::Active {
                continue;
            }
            if let Err(err) = tx.rollback().await {
                error!("{} rollback after panic failed: {}", tx, err);
            }
        }
    }
}

impl fmt::Debug for TxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager")
            .field("config", &self.config)
            .field("active_contexts", &self.active_contexts())
            .finish()
    }
}

/// Abandons the transaction if the `run` future is dropped mid-flight
struct CancelGuard {
    tx: Option<Arc<Transaction>>,
}

impl CancelGuard {
    fn new(tx: &Arc<Transaction>) -> Self {
        Self {
            tx: Some(Arc::clone(tx)),
        }
    }

    fn disarm(&mut self) {
        self.tx = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            if !tx.is_finished() {
                warn!("{} cancelled before completion", tx);
                tx.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::config::TxConfigBuilder;
    use crate::options::Propagation;

    fn manager() -> (MemoryBackend, TxManager) {
        let backend = MemoryBackend::new();
        let manager = TxManager::with_defaults(Arc::new(backend.clone()));
        (backend, manager)
    }

    #[tokio::test]
    async fn test_run_commits_on_success() {
        let (backend, manager) = manager();
        let ctx = manager.context();

        let value = manager
            .run(&ctx, |_tx| async { Ok::<_, TxError>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(backend.stats().committed, 1);
        assert_eq!(manager.active_contexts(), 0);
    }

    #[tokio::test]
    async fn test_run_rolls_back_on_error() {
        let (backend, manager) = manager();
        let ctx = manager.context();

        let err = manager
            .run(&ctx, |_tx| async { Err::<(), _>(TxError::Database("boom".to_string())) })
            .await
            .unwrap_err();

        assert_eq!(err, TxError::Database("boom".to_string()));
        assert_eq!(backend.stats().rolled_back, 1);
        assert_eq!(backend.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_body_error_is_recorded_on_transaction() {
        let (_backend, manager) = manager();
        let ctx = manager.context();
        let mut seen = None;

        let _ = manager
            .run(&ctx, |tx| {
                seen = Some(Arc::clone(&tx));
                async { Err::<(), _>(TxError::Database("bad row".to_string())) }
            })
            .await;

        let tx = seen.unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(tx.failure().as_deref(), Some("database error: bad row"));
    }

    #[tokio::test]
    async fn test_configured_default_propagation() {
        let backend = MemoryBackend::new();
        let config = TxConfigBuilder::new()
            .default_propagation(Propagation::RequiresNew)
            .build()
            .expect("Failed to build config");
        let manager = TxManager::new(Arc::new(backend.clone()), config).unwrap();
        let ctx = manager.context();
        let (m, c) = (&manager, &ctx);

        manager
            .run(&ctx, |_outer| async move {
                m.run(c, |inner| async move {
                    assert!(inner.is_isolated());
                    Ok::<_, TxError>(())
                })
                .await
            })
            .await
            .unwrap();

        assert_eq!(backend.stats().begun, 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let backend = MemoryBackend::new();
        let config = TxConfigBuilder::new()
            .id_length(0)
            .build()
            .expect("Failed to build config");

        let err = TxManager::new(Arc::new(backend.clone()), config).unwrap_err();
        assert!(matches!(err, TxError::Configuration(_)));

        let config = TxConfigBuilder::new()
            .begin_timeout(Some(Duration::ZERO))
            .build()
            .expect("Failed to build config");
        assert!(TxManager::new(Arc::new(backend), config).is_err());
    }

    #[tokio::test]
    #[should_panic(expected = "was created by a different TxManager")]
    async fn test_foreign_context_is_rejected() {
        let (_b1, first) = manager();
        let (_b2, second) = manager();
        let ctx = first.context();

        let _ = second.run(&ctx, |_tx| async { Ok::<_, TxError>(()) }).await;
    }
}
