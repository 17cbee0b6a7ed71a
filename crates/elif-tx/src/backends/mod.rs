//! Database Backends
//!
//! Driver abstraction used by the transaction manager, with a sqlx backed
//! PostgreSQL implementation and an in-memory one for development and tests.

pub mod core;
pub mod memory;
pub mod named;
pub mod postgres;

pub use self::core::*;
pub use self::memory::{JsonRow, MemoryBackend, MemoryEvent, MemoryResponse, MemoryStatement, MemoryStats, MemoryTransaction};
pub use self::named::NamedArgs;
pub use self::postgres::{PostgresPool, PostgresRow, PostgresTransaction};
