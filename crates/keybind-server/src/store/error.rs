//! Typed store failures surfaced to the validation engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// redb rejected a transaction, table open, read, or commit.
    #[error("database error: {0}")]
    Database(#[from] redb::Error),

    #[error("record encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("record decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

macro_rules! impl_from_redb {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Database(e.into())
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
