use thiserror::Error;

use crate::storage::StoreError;

/// Errors surfaced by a persistence provider.
///
/// Cloneable so a single load failure can be handed to every waiter of
/// `when_synced`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Corrupt fragment at key {key}: {reason}")]
    CorruptFragment { key: u64, reason: String },

    #[error("Provider for '{name}' has been destroyed")]
    UseAfterDestroy { name: String },

    #[error("Meta value error: {0}")]
    Meta(String),

    #[error("Could not observe document edits: {0}")]
    Observer(String),
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CorruptEntry { key, reason } => {
                PersistenceError::CorruptFragment { key, reason }
            }
            StoreError::Serialization(msg) | StoreError::Deserialization(msg) => {
                PersistenceError::Meta(msg)
            }
            StoreError::Database(msg) => PersistenceError::StoreUnavailable(msg),
            StoreError::Closed(name) => PersistenceError::UseAfterDestroy { name },
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
