//! Error types for transaction propagation
//!
//! Every fallible operation in this crate returns [`TxError`]. Errors coming
//! back from the database collaborator are either passed through verbatim
//! (commit, rollback) or tagged with the data-access operation that failed.

use std::fmt;
use thiserror::Error;

/// Result type alias for transaction operations
pub type TxResult<T> = Result<T, TxError>;

/// Data-access operation a [`TxError::Query`] is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperation {
    /// Single row fetch
    Fetch,
    /// Multi row fetch
    Select,
    Insert,
    Update,
    Delete,
}

impl fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryOperation::Fetch => "fetch",
            QueryOperation::Select => "query",
            QueryOperation::Insert => "insert",
            QueryOperation::Update => "update",
            QueryOperation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Transaction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TxError {
    /// The logical transaction was already committed or rolled back
    #[error("{transaction} is already committed or rolled back")]
    InvalidState { transaction: String },

    /// A propagation value outside the supported set
    #[error("unknown propagation type: {0}")]
    PropagationConfig(String),

    /// A data-access call failed inside the database collaborator
    #[error("{operation} failed: {message}")]
    Query {
        operation: QueryOperation,
        message: String,
    },

    /// The physical transaction could not be started
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    /// The deadline passed before a physical transaction could be started
    #[error("timed out before the transaction could begin")]
    Timeout,

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    /// Driver level error outside of commit/rollback
    #[error("database error: {0}")]
    Database(String),

    /// Named argument binding failed
    #[error("binding error: {0}")]
    Binding(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TxError {
    pub(crate) fn invalid_state(transaction: impl fmt::Display) -> Self {
        TxError::InvalidState {
            transaction: transaction.to_string(),
        }
    }

    pub(crate) fn query(operation: QueryOperation, cause: impl fmt::Display) -> Self {
        TxError::Query {
            operation,
            message: cause.to_string(),
        }
    }

    /// Whether this error reports use of an already finished transaction
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, TxError::InvalidState { .. })
    }

    /// Operation tag of a query failure
    pub fn operation(&self) -> Option<QueryOperation> {
        match self {
            TxError::Query { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for TxError {
    fn from(err: sqlx::Error) -> Self {
        TxError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for TxError {
    fn from(err: serde_json::Error) -> Self {
        TxError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_carries_operation_prefix() {
        let err = TxError::query(QueryOperation::Insert, "duplicate key");
        assert_eq!(err.to_string(), "insert failed: duplicate key");
        assert_eq!(err.operation(), Some(QueryOperation::Insert));

        let err = TxError::query(QueryOperation::Select, "relation does not exist");
        assert_eq!(err.to_string(), "query failed: relation does not exist");
    }

    #[test]
    fn test_invalid_state_names_transaction() {
        let err = TxError::invalid_state("tx-abc");
        assert!(err.is_invalid_state());
        assert_eq!(err.to_string(), "tx-abc is already committed or rolled back");
        assert_eq!(err.operation(), None);
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: TxError = parse.unwrap_err().into();
        assert!(matches!(err, TxError::Serialization(_)));
    }
}
