//! Optimistic transaction engine for a graph-document database.
//!
//! A [`Transaction`] buffers record operations and secondary-index mutations,
//! runs the registered [`RecordHook`]s to a fixpoint, replaces temporary
//! record identities with the final ones chosen by [`Storage`], and keeps
//! every transaction-local structure consistent across that replacement.

pub mod errors;
pub mod config;
pub mod rid;
pub mod value;
pub mod data_store;
pub mod catalog;
pub mod storage;
pub mod ledger;
pub mod identity;
pub mod index;
pub mod callbacks;
pub mod hooks;
pub mod transaction;
pub mod session;
#[cfg(feature = "distributed")]
pub mod remote;

// Re-export key types and structs for easier access
pub use errors::{ErrorKind, GraphTxError, Result};
pub use config::TxConfig;
pub use rid::{CollectionId, Rid};
pub use value::Value;
pub use data_store::record::{Record, RecordRef};
pub use data_store::record_cache::RecordCache;
pub use catalog::{Catalog, StaticCatalog};
pub use storage::{CommitBatch, Storage, StorageMutation};
pub use ledger::{OperationKind, RecordOperation};
pub use index::definition::{IndexCardinality, IndexDefinition};
pub use index::key::IndexKey;
pub use callbacks::{PendingOperation, RecordHook};
pub use transaction::{Transaction, TransactionStatus};
pub use session::{prelude, Session};
#[cfg(feature = "distributed")]
pub use remote::{
    codec::{BincodeCodec, WireCodec},
    merge::{ServerOperation, ServerPayload, ServerTransactionLog},
};
