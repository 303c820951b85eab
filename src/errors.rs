use thiserror::Error;

use crate::rid::Rid;

/// Coarse classification of [`GraphTxError`] values.
///
/// Callers use this to decide between retrying the whole transaction
/// (`Conflict`), fixing their code (`State`, `Consistency`) or reporting the
/// failure to the user (`Validation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation attempted on a transaction that cannot accept it.
    State,
    /// Version mismatch or uniqueness violation. Retry the whole transaction.
    Conflict,
    /// Data-integrity defect inside the transaction bookkeeping.
    Consistency,
    /// Schema, constraint or security check rejected a record.
    Validation,
    /// A collaborator (storage, serializer) failed.
    Storage,
}

#[derive(Error, Debug)]
pub enum GraphTxError {
    #[error("Invalid transaction state: {0}")]
    InvalidState(String),

    #[error("Record {0} was already deleted in this transaction")]
    RecordAlreadyDeleted(Rid),

    #[error("Record {0} was already created in this transaction")]
    DuplicateCreation(Rid),

    #[error("Index '{index}' still references stale identity {rid}")]
    StaleIdentity { index: String, rid: Rid },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Transaction conflict on {rid}: expected version {expected}, found {actual}")]
    TransactionConflict { rid: Rid, expected: u64, actual: u64 },

    #[error("Duplicate key {key} in unique index '{index}'")]
    DuplicateKey { index: String, key: String },

    #[error("Merge conflict on {rid}: local dirty counter {local} is not behind remote {remote}")]
    MergeConflict { rid: Rid, local: u64, remote: u64 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl GraphTxError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphTxError::InvalidState(_) => ErrorKind::State,
            GraphTxError::RecordAlreadyDeleted(_)
            | GraphTxError::DuplicateCreation(_)
            | GraphTxError::StaleIdentity { .. }
            | GraphTxError::Consistency(_) => ErrorKind::Consistency,
            GraphTxError::TransactionConflict { .. }
            | GraphTxError::DuplicateKey { .. }
            | GraphTxError::MergeConflict { .. } => ErrorKind::Conflict,
            GraphTxError::Validation(_) => ErrorKind::Validation,
            GraphTxError::StorageError(_) | GraphTxError::SerializationError(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Only conflicts may succeed when the caller replays the transaction.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

#[cfg(feature = "distributed")]
impl From<bincode::Error> for GraphTxError {
    fn from(err: bincode::Error) -> Self {
        GraphTxError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphTxError>;
