use crate::data_store::record::Record;
use crate::errors::Result;
use crate::index::interpret::IndexEffect;
use crate::rid::Rid;

/// A single record mutation to be applied by the storage layer.
///
/// Identities are final by the time a mutation is built: temporary
/// positions were replaced through the identity remap protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageMutation {
    /// Store a new record. Its version is the version it should be stored at.
    Create(Record),
    /// Replace a record currently stored at `expected_version`.
    Update { record: Record, expected_version: u64 },
    /// Delete a record currently stored at `expected_version`.
    Delete { rid: Rid, expected_version: u64 },
}

impl StorageMutation {
    pub fn rid(&self) -> Rid {
        match self {
            StorageMutation::Create(record) => record.rid(),
            StorageMutation::Update { record, .. } => record.rid(),
            StorageMutation::Delete { rid, .. } => *rid,
        }
    }
}

/// Net effects of a transaction on one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommit {
    pub index: String,
    pub effects: Vec<IndexEffect>,
}

/// Everything a transaction hands to storage in one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    pub transaction_id: u64,
    pub mutations: Vec<StorageMutation>,
    pub indexes: Vec<IndexCommit>,
}

/// Storage collaborator of the transaction engine.
///
/// The engine drives a commit as follows:
///
/// 1. `begin_atomic_operation`
/// 2. `read_current_version` for every updated or deleted record
/// 3. `assign_final_position` for every created record, each bracketed by
///    the identity remap protocol
/// 4. `commit` with the finalized batch
/// 5. `end_atomic_operation`, with `rollback = true` if any step failed
///
/// `commit` must apply the batch atomically and must itself reject a
/// mutation whose `expected_version` no longer matches with
/// `GraphTxError::TransactionConflict`, since other transactions may commit
/// between steps 2 and 4.
///
/// Implementations must be `Send` and `Sync` to be shared by sessions.
pub trait Storage: Send + Sync {
    /// Reserves the final identity for a new record.
    fn assign_final_position(&self, record: &Record) -> Result<Rid>;

    /// Version currently stored for `rid`, or `None` if there is no such record.
    fn read_current_version(&self, rid: Rid) -> Result<Option<u64>>;

    /// Atomically applies `batch`.
    fn commit(&self, batch: CommitBatch) -> Result<()>;

    /// Opens the atomic operation that covers one transaction's index and record writes.
    fn begin_atomic_operation(&self, _transaction_id: u64) -> Result<()> {
        Ok(())
    }

    /// Closes the atomic operation. `rollback` releases everything it reserved.
    fn end_atomic_operation(&self, _transaction_id: u64, _rollback: bool) -> Result<()> {
        Ok(())
    }
}
