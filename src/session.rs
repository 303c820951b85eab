use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::callbacks::RecordHook;
use crate::catalog::Catalog;
use crate::config::TxConfig;
use crate::data_store::record::{Record, RecordContent, RecordOwner, RecordRef, SessionId};
use crate::data_store::record_cache::RecordCache;
use crate::errors::Result;
use crate::hooks::IndexMaintenanceHook;
use crate::rid::Rid;
use crate::storage::Storage;
use crate::transaction::Transaction;
use crate::value::Value;

/// graphtx Prelude
pub mod prelude {
    pub use crate::callbacks::*;
    pub use crate::catalog::*;
    pub use crate::config::*;
    pub use crate::data_store::record::*;
    pub use crate::data_store::record_cache::*;
    pub use crate::errors::*;
    pub use crate::identity::*;
    pub use crate::index::changes::*;
    pub use crate::index::definition::*;
    pub use crate::index::interpret::*;
    pub use crate::index::key::*;
    pub use crate::ledger::*;
    #[cfg(feature = "distributed")]
    pub use crate::remote::codec::*;
    #[cfg(feature = "distributed")]
    pub use crate::remote::merge::*;
    pub use crate::rid::*;
    pub use crate::session::Session;
    pub use crate::storage::*;
    pub use crate::transaction::*;
    pub use crate::value::*;
}

/// Process-wide counter for session identifiers.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A database session: the single-threaded owner of records and transactions.
///
/// Sessions share storage with each other; everything else (the record
/// cache, the hooks, the transactions) belongs to one session.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use graphtx::prelude::*;
///
/// # struct NullStorage;
/// # impl Storage for NullStorage {
/// #     fn assign_final_position(&self, record: &Record) -> Result<Rid> {
/// #         Ok(record.rid().with_position(0))
/// #     }
/// #     fn read_current_version(&self, _rid: Rid) -> Result<Option<u64>> {
/// #         Ok(None)
/// #     }
/// #     fn commit(&self, _batch: CommitBatch) -> Result<()> {
/// #         Ok(())
/// #     }
/// # }
/// let catalog = StaticCatalog::new().with_class("Person", &[10]);
/// let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
///
/// let mut tx = session.begin()?;
/// let person = session.new_record(Some("Person"));
/// person.write().set_field("name", "ada")?;
/// tx.add_operation(&person, OperationKind::Created)?;
///
/// let mapping = tx.commit(false)?;
/// assert_eq!(mapping[&Rid::new(10, -2)], Rid::new(10, 0));
/// assert_eq!(person.rid(), Rid::new(10, 0));
/// # Ok::<(), GraphTxError>(())
/// ```
pub struct Session {
    id: SessionId,
    /// A per-session increasing counter for generating transaction IDs.
    transaction_counter: Arc<AtomicU64>,
    /// The storage implementation for persisting committed data.
    storage: Arc<dyn Storage>,
    catalog: Arc<dyn Catalog>,
    cache: Arc<RecordCache>,
    hooks: Vec<Arc<dyn RecordHook>>,
    config: TxConfig,
}

impl Session {
    /// Creates a session with the automatic index maintenance hook installed.
    pub fn new(storage: Arc<dyn Storage>, catalog: Arc<dyn Catalog>, config: TxConfig) -> Self {
        let index_hook: Arc<dyn RecordHook> =
            Arc::new(IndexMaintenanceHook::new(Arc::clone(&catalog)));
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::SeqCst),
            transaction_counter: Arc::new(AtomicU64::new(0)),
            storage,
            catalog,
            cache: Arc::new(RecordCache::new()),
            hooks: vec![index_hook],
            config,
        }
    }

    /// Appends a hook; hooks run in registration order.
    pub fn with_hook(mut self, hook: Arc<dyn RecordHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Creates an empty record bound to this session.
    pub fn new_record(&self, class: Option<&str>) -> RecordRef {
        RecordRef::new(Record::new(class, RecordOwner::Session(self.id)))
    }

    /// Creates a record owned by a parent record of this session.
    pub fn new_embedded_record(&self, class: Option<&str>) -> RecordRef {
        RecordRef::new(Record::new(class, RecordOwner::Embedded(self.id)))
    }

    /// Binds a record read from storage to this session and caches it.
    pub fn load_record(
        &self,
        rid: Rid,
        class: Option<&str>,
        fields: BTreeMap<String, Value>,
        version: u64,
    ) -> RecordRef {
        let record = RecordRef::new(Record::loaded(
            rid,
            class.map(str::to_string),
            RecordContent::Fields(fields),
            version,
            RecordOwner::Session(self.id),
        ));
        self.cache.put(rid, record.clone());
        record
    }

    /// Creates a new transaction in the `Invalid` state.
    pub fn transaction(&self) -> Transaction {
        let transaction_id = self.transaction_counter.fetch_add(1, Ordering::SeqCst);
        Transaction::new(
            transaction_id,
            self.id,
            Arc::clone(&self.storage),
            Arc::clone(&self.catalog),
            Arc::clone(&self.cache),
            self.hooks.iter().cloned().collect(),
            self.config.clone(),
        )
    }

    /// Creates a transaction and begins it.
    pub fn begin(&self) -> Result<Transaction> {
        let mut transaction = self.transaction();
        transaction.begin()?;
        Ok(transaction)
    }
}
