//! # elif-tx
//!
//! Nested transaction propagation for the elif.rs framework.
//!
//! ## Features
//!
//! - **Joined transactions**: nested `Required` calls share one database transaction
//! - **Isolated transactions**: `RequiresNew` calls get a transaction of their own
//! - **Deferred commit**: the database commit happens when the last participant finishes
//! - **Shared rollback**: a failing participant dooms everyone sharing its transaction
//! - **Panic and cancel safety**: nothing is left open when a body panics or is dropped
//! - **Backends**: sqlx PostgreSQL and an in-memory backend for tests
//!
//! ## Quick Start
//!
//! ```rust
//! use elif_tx::{MemoryBackend, NamedArgs, RunOptions, TxError, TxManager};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let backend = MemoryBackend::new();
//! let manager = TxManager::with_defaults(Arc::new(backend.clone()));
//! let ctx = manager.context();
//! let (m, c) = (&manager, &ctx);
//!
//! manager
//!     .run(&ctx, |tx| async move {
//!         let id = tx
//!             .insert(
//!                 "INSERT INTO account (name) VALUES (:name) RETURNING id",
//!                 &NamedArgs::new().bind("name", "alice"),
//!             )
//!             .await?;
//!
//!         // Joins the outer transaction; nothing is committed yet
//!         m.run(c, |tx| async move {
//!             tx.update(
//!                 "UPDATE account SET active = true WHERE id = :id",
//!                 &NamedArgs::new().bind("id", id),
//!             )
//!             .await
//!         })
//!         .await?;
//!
//!         // Runs in its own transaction and commits on its own
//!         m.run_with(c, RunOptions::requires_new(), |tx| async move {
//!             tx.insert(
//!                 "INSERT INTO audit (event) VALUES (:event)",
//!                 &NamedArgs::new().bind("event", "account created"),
//!             )
//!             .await
//!         })
//!         .await?;
//!
//!         Ok::<_, TxError>(())
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(backend.stats().committed, 2);
//! # });
//! ```

pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod isolation;
pub mod manager;
pub mod options;
pub mod physical;
pub mod registry;
pub mod transaction;

pub use backends::{
    BeginOptions, DatabasePool, DatabaseRow, DatabaseTransaction, DatabaseValue, ExecOutcome, MemoryBackend,
    MemoryEvent, MemoryResponse, MemoryStats, NamedArgs, PostgresPool, SqlDialect,
};
pub use config::{TxConfig, TxConfigBuilder};
pub use context::{ContextId, TxContext};
pub use error::{QueryOperation, TxError, TxResult};
pub use isolation::IsolationLevel;
pub use manager::TxManager;
pub use options::{Propagation, RunOptions};
pub use physical::{PhysicalState, PhysicalTransaction};
pub use registry::ContextRegistry;
pub use transaction::{Transaction, TransactionState};
