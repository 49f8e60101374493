//! Error types for the Kinetik state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database {location}: {source}")]
    Open {
        location: String,
        #[source]
        source: redb::DatabaseError,
    },

    /// Any transaction, table or storage failure inside redb.
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("failed to encode {table}/{key}: {source}")]
    Encode {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A stored row no longer matches its type.
    #[error("corrupt row {table}/{key}: {source}")]
    Corrupt {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    pub(crate) fn storage(err: impl Into<redb::Error>) -> Self {
        Self::Storage(err.into())
    }
}
