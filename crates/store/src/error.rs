use lore_object::{ContentHash, IdHash, ObjectError};
use thiserror::Error;

/// The common error type for the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No object stored under the given hash.
    #[error("not found: {0}")]
    NotFound(String),

    /// A concurrent writer advanced the version chain first. Retried a
    /// bounded number of times by the callers that can recompute their
    /// write; surfaced otherwise.
    #[error("stale write on version chain {id}")]
    StaleWrite { id: IdHash },

    /// Stored bytes failed canonical decoding. The blob has been moved to
    /// the quarantine table for repair; it is never silently discarded.
    #[error("corrupt object quarantined: {hash}")]
    Corrupt { hash: ContentHash },

    /// Schema or encoding failure from the object layer.
    #[error(transparent)]
    Object(#[from] ObjectError),

    /// An error from the storage backend.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }
}

macro_rules! backend_error {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(error: $ty) -> Self {
                    StoreError::Backend(error.to_string())
                }
            }
        )+
    };
}

backend_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
