use std::cmp::Reverse;
use std::sync::Arc;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, trace, warn};

use crate::callbacks::{restore_positions, take_positions, CallbackState, RecordHook};
use crate::catalog::Catalog;
use crate::config::TxConfig;
use crate::data_store::record::{RecordOwner, RecordRef, SessionId};
use crate::data_store::record_cache::RecordCache;
use crate::errors::{GraphTxError, Result};
use crate::identity::{IdentityChangeListener, IdentityRemap, InTransit};
use crate::index::changes::{IndexChangeLog, IndexChanges, IndexOperation};
use crate::index::definition::IndexDefinition;
use crate::index::interpret::interpret_index;
use crate::index::key::IndexKey;
use crate::ledger::{Ledger, OperationKind, RecordOperation};
use crate::rid::{Rid, INVALID_POSITION};
use crate::storage::{CommitBatch, IndexCommit, Storage, StorageMutation};
use crate::value::Value;

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Created, `begin` not called yet.
    Invalid,
    Begun,
    /// The outermost commit is running hooks or talking to storage.
    Committing,
    RollingBack,
    Completed,
    RolledBack,
}

/// A unit of work over the records of one session.
///
/// A transaction buffers record operations in its ledger and index mutations
/// in its index change log. Nothing reaches storage until the outermost
/// `commit`, which runs the mutation hooks to a fixpoint, checks record
/// versions optimistically, replaces temporary identities with final ones and
/// hands the batch to storage.
///
/// `begin`/`commit` pairs nest: only the call that brings the nesting level
/// back to zero commits (or rolls back) for real.
///
/// Any error escaping `add_operation`, `add_index_entry` or the outermost
/// `commit` rolls the transaction back before it is returned.
pub struct Transaction {
    /// Unique identifier for the transaction.
    id: u64,
    /// The session that owns this transaction and its records.
    session: SessionId,
    status: TransactionStatus,
    nesting: u32,
    pub(crate) ledger: Ledger,
    pub(crate) index_log: IndexChangeLog,
    pub(crate) identity: IdentityRemap,
    pub(crate) callbacks: CallbackState,
    /// Every identity this transaction registered, old and new, for cache eviction.
    pub(crate) touched: HashSet<Rid>,
    custom: HashMap<String, Value>,
    storage: Arc<dyn Storage>,
    catalog: Arc<dyn Catalog>,
    pub(crate) cache: Arc<RecordCache>,
    pub(crate) hooks: Arc<[Arc<dyn RecordHook>]>,
    pub(crate) config: TxConfig,
}

impl Transaction {
    /// Creates a transaction in the `Invalid` state.
    ///
    /// This is typically called by `Session::transaction`.
    pub fn new(
        id: u64,
        session: SessionId,
        storage: Arc<dyn Storage>,
        catalog: Arc<dyn Catalog>,
        cache: Arc<RecordCache>,
        hooks: Arc<[Arc<dyn RecordHook>]>,
        config: TxConfig,
    ) -> Self {
        Self {
            id,
            session,
            status: TransactionStatus::Invalid,
            nesting: 0,
            ledger: Ledger::new(config.first_temporary_position),
            index_log: IndexChangeLog::new(),
            identity: IdentityRemap::new(),
            callbacks: CallbackState::default(),
            touched: HashSet::new(),
            custom: HashMap::new(),
            storage,
            catalog,
            cache,
            hooks,
            config,
        }
    }

    /// Returns the unique identifier of the transaction.
    ///
    /// Identifiers are handed out by the owning session and increase with
    /// every transaction it creates.
    ///
    /// # Returns
    ///
    /// The transaction ID as a `u64`.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the identifier of the session that owns this transaction.
    ///
    /// Only records bound to this session can be registered.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Returns the current lifecycle state.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Number of `begin` calls not yet closed by `commit` or `rollback`.
    pub fn nesting_level(&self) -> u32 {
        self.nesting
    }

    /// Operations are accepted while begun and while the commit runs hooks.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Begun | TransactionStatus::Committing
        )
    }

    pub(crate) fn ensure_active(&self, action: &str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(GraphTxError::InvalidState(format!(
                "cannot {} in transaction {}: status is {:?}",
                action, self.id, self.status
            )))
        }
    }

    /// Starts the transaction or, if already begun, opens a nested level.
    ///
    /// A transaction leaves `Invalid` on its first `begin`. Every further call
    /// increases the nesting level; the matching `commit` or `rollback` only
    /// takes effect once the level is back to zero.
    ///
    /// # Errors
    ///
    /// `InvalidState` once the transaction is committing, completed or
    /// rolled back.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use graphtx::prelude::*;
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
    /// # let catalog = StaticCatalog::new().with_class("Person", &[10]);
    /// # let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
    /// let mut tx = session.transaction();
    /// assert_eq!(tx.status(), TransactionStatus::Invalid);
    ///
    /// tx.begin()?;
    /// tx.begin()?;
    /// assert_eq!(tx.nesting_level(), 2);
    ///
    /// tx.commit(false)?;
    /// assert_eq!(tx.status(), TransactionStatus::Begun);
    /// # Ok::<(), GraphTxError>(())
    /// ```
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            TransactionStatus::Invalid | TransactionStatus::Begun => {
                self.status = TransactionStatus::Begun;
                self.nesting += 1;
                debug!("transaction {} begun (level {})", self.id, self.nesting);
                Ok(())
            }
            status => Err(GraphTxError::InvalidState(format!(
                "cannot begin transaction {}: status is {:?}",
                self.id, status
            ))),
        }
    }

    /// Registers or merges the pending operation for `record`.
    ///
    /// A record without an identity is placed in a collection chosen (or, if
    /// it already names one, checked) by the catalog and receives the next
    /// temporary position. Updating a record that was never stored registers
    /// its creation. A second touch of the same record follows the merge
    /// table: a delete after a create or update wins, anything after a delete
    /// fails, and a second creation fails.
    ///
    /// # Arguments
    ///
    /// * `record` - A record bound to this transaction's session.
    /// * `kind` - The operation requested for it.
    ///
    /// # Returns
    ///
    /// A snapshot of the resulting operation, so callers can compare dirty
    /// counters.
    ///
    /// # Errors
    ///
    /// * `InvalidState` for records of another session, embedded records,
    ///   deletion of a record that was never saved, or an inactive
    ///   transaction.
    /// * `RecordAlreadyDeleted` / `DuplicateCreation` for merge-table
    ///   violations.
    /// * `Validation` when the catalog refuses the collection.
    ///
    /// In every case the transaction is rolled back before the error is
    /// returned.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use graphtx::prelude::*;
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
    /// # let catalog = StaticCatalog::new().with_class("Person", &[10]);
    /// # let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
    /// let mut tx = session.begin()?;
    /// let person = session.new_record(Some("Person"));
    /// person.write().set_field("name", "ada")?;
    ///
    /// let operation = tx.add_operation(&person, OperationKind::Updated)?;
    /// assert_eq!(operation.kind(), OperationKind::Created);
    /// assert!(person.rid().is_temporary());
    ///
    /// tx.add_operation(&person, OperationKind::Deleted)?;
    /// assert!(tx.is_deleted(person.rid()));
    /// # Ok::<(), GraphTxError>(())
    /// ```
    pub fn add_operation(
        &mut self,
        record: &RecordRef,
        kind: OperationKind,
    ) -> Result<RecordOperation> {
        if let Err(err) = self.check_record(record) {
            return Err(self.abort(err));
        }
        let registered = self
            .ledger
            .add_operation(record, kind, &mut self.identity, self.catalog.as_ref())
            .cloned();
        match registered {
            Ok(operation) => {
                self.touched.insert(operation.rid());
                Ok(operation)
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    fn check_record(&self, record: &RecordRef) -> Result<()> {
        self.ensure_active("register a record operation")?;
        let (rid, owner) = {
            let guard = record.read();
            (guard.rid(), guard.owner())
        };
        match owner {
            RecordOwner::Session(session) if session == self.session => Ok(()),
            RecordOwner::Embedded(_) => Err(GraphTxError::InvalidState(format!(
                "record {} is embedded and cannot be saved on its own",
                rid
            ))),
            RecordOwner::Session(_) | RecordOwner::Detached => Err(GraphTxError::InvalidState(
                format!("record {} is not bound to session {}", rid, self.session),
            )),
        }
    }

    /// Appends one mutation to the index change log.
    ///
    /// Keys and values given by an identity that already changed in this
    /// transaction are redirected to the current identity. Entries are kept
    /// per key in arrival order and reduced according to the index
    /// cardinality at commit.
    ///
    /// # Arguments
    ///
    /// * `index` - The index the entry belongs to.
    /// * `key` - The entry key; `None` is the null key.
    /// * `operation` - `Put`, `Remove`, or `Clear` to discard every earlier
    ///   entry of the index.
    /// * `value` - The indexed record. Required for `Put`; a `Remove` without
    ///   a value removes every value under the key.
    ///
    /// # Errors
    ///
    /// `InvalidState` for an inactive transaction and `Consistency` for a
    /// `Put` without a value. The transaction is rolled back first.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use graphtx::prelude::*;
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
    /// # let catalog = StaticCatalog::new().with_class("Person", &[10]);
    /// # let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
    /// let email = Arc::new(IndexDefinition::manual(
    ///     "email",
    ///     vec![IndexField::new("email", FieldType::String)],
    ///     IndexCardinality::Unique,
    /// ));
    /// let mut tx = session.begin()?;
    /// let owner = Rid::new(10, 0);
    /// tx.add_index_entry(&email, Some("ada@example.com".into()), IndexOperation::Put, Some(owner))?;
    ///
    /// let changes = tx.index_changes("email").expect("index buffered");
    /// assert_eq!(changes.len(), 1);
    /// # Ok::<(), GraphTxError>(())
    /// ```
    pub fn add_index_entry(
        &mut self,
        index: &Arc<IndexDefinition>,
        key: Option<IndexKey>,
        operation: IndexOperation,
        value: Option<Rid>,
    ) -> Result<()> {
        if let Err(err) = self.ensure_active("add an index entry") {
            return Err(self.abort(err));
        }
        let value = value.map(|rid| self.identity.resolve(rid));
        let key = key.map(|key| self.resolve_key(key));
        match self.index_log.add_entry(index, key, operation, value) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(err)),
        }
    }

    fn resolve_key(&self, key: IndexKey) -> IndexKey {
        self.identity
            .mapping()
            .iter()
            .fold(key, |key, (old, new)| {
                key.with_rid_replaced(*old, *new).unwrap_or(key)
            })
    }

    /// Pending operation for `rid`, following identity changes made in this transaction.
    ///
    /// A record looked up by the temporary identity it had before commit (or
    /// before a server log renamed it) is still found.
    pub fn get_operation(&self, rid: Rid) -> Option<&RecordOperation> {
        self.ledger.get(&self.identity.resolve(rid))
    }

    /// Pending operations in callback order.
    pub fn operations(&self) -> Vec<&RecordOperation> {
        self.ledger.sorted()
    }

    /// Buffered changes of the index named `index`, if any were added.
    pub fn index_changes(&self, index: &str) -> Option<&IndexChanges> {
        self.index_log.index_changes(index)
    }

    pub fn index_change_log(&self) -> &IndexChangeLog {
        &self.index_log
    }

    pub(crate) fn index_changes_mut(&mut self) -> &mut IndexChangeLog {
        &mut self.index_log
    }

    /// Whether the pending operation for `rid` is a deletion.
    pub fn is_deleted(&self, rid: Rid) -> bool {
        self.get_operation(rid)
            .is_some_and(|operation| operation.kind() == OperationKind::Deleted)
    }

    /// Old -> new identities assigned so far.
    pub fn identity_mapping(&self) -> &HashMap<Rid, Rid> {
        self.identity.mapping()
    }

    /// Whether ledger, index change log and identity tables are all empty.
    pub fn is_clean(&self) -> bool {
        self.ledger.is_empty() && self.index_log.is_empty() && self.identity.is_empty()
    }

    /// Returns the metadata value stored under `name`.
    ///
    /// Custom data lives as long as the transaction and is dropped by
    /// commit and rollback.
    pub fn custom_data(&self, name: &str) -> Option<&Value> {
        self.custom.get(name)
    }

    /// Stores `value` under `name`, replacing any earlier value.
    pub fn set_custom_data(&mut self, name: &str, value: impl Into<Value>) {
        self.custom.insert(name.to_string(), value.into());
    }

    pub fn remove_custom_data(&mut self, name: &str) -> Option<Value> {
        self.custom.remove(name)
    }

    /// Runs the mutation hooks to a fixpoint without committing.
    ///
    /// Calling this from inside a hook is a state error and leaves the
    /// transaction to the processor already running; any other failure rolls
    /// the transaction back.
    pub fn process_callbacks(&mut self) -> Result<()> {
        self.ensure_active("process callbacks")?;
        self.ensure_outside_hooks("process callbacks of")?;
        self.run_callbacks().map_err(|err| self.abort(err))
    }

    /// Closes one nesting level; the outermost call (or `force`) commits.
    ///
    /// The real commit runs the hooks to a fixpoint, drops records created
    /// and deleted in this transaction, then inside one storage atomic
    /// operation checks every read version, asks storage for the final
    /// identity of each created record, rewrites links and index entries to
    /// those identities and hands the batch over.
    ///
    /// # Arguments
    ///
    /// * `force` - Commit regardless of the nesting level.
    ///
    /// # Returns
    ///
    /// The old -> new identities assigned by storage, empty for an inner
    /// level.
    ///
    /// # Errors
    ///
    /// * `InvalidState` if the transaction is not begun, including calls
    ///   from inside a hook.
    /// * `TransactionConflict` when a record changed in storage since it was
    ///   read, `DuplicateKey` for a unique index violation.
    /// * Any hook or storage error.
    ///
    /// Any failure of the real commit rolls the transaction back before it
    /// is returned. Records created here lose their temporary identity, so a
    /// conflict is retried by replaying the whole transaction.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use graphtx::prelude::*;
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
    /// # let catalog = StaticCatalog::new().with_class("Person", &[10]);
    /// # let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
    /// let mut tx = session.begin()?;
    /// let person = session.new_record(Some("Person"));
    /// tx.add_operation(&person, OperationKind::Created)?;
    /// let temporary = person.rid();
    ///
    /// let mapping = tx.commit(false)?;
    /// assert_eq!(mapping[&temporary], person.rid());
    /// assert_eq!(tx.status(), TransactionStatus::Completed);
    /// # Ok::<(), GraphTxError>(())
    /// ```
    pub fn commit(&mut self, force: bool) -> Result<HashMap<Rid, Rid>> {
        self.ensure_outside_hooks("commit")?;
        if self.status != TransactionStatus::Begun {
            return Err(GraphTxError::InvalidState(format!(
                "cannot commit transaction {}: status is {:?}",
                self.id, self.status
            )));
        }
        self.nesting = if force {
            0
        } else {
            self.nesting.saturating_sub(1)
        };
        if self.nesting > 0 {
            trace!("transaction {} commit deferred (level {})", self.id, self.nesting);
            return Ok(HashMap::new());
        }
        match self.do_commit() {
            Ok(mapping) => Ok(mapping),
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Closes one nesting level; the outermost call (or `force`) rolls back.
    ///
    /// Rolling back evicts every record this transaction touched from the
    /// session cache and returns records created here to the never-saved
    /// state. Rolling back an already rolled back transaction is a no-op, so
    /// callers may clean up unconditionally after an error.
    ///
    /// # Arguments
    ///
    /// * `force` - Roll back regardless of the nesting level.
    ///
    /// # Errors
    ///
    /// `InvalidState` from inside a hook, or when the transaction was never
    /// begun or already completed.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use graphtx::prelude::*;
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
    /// # let catalog = StaticCatalog::new().with_class("Person", &[10]);
    /// # let session = Session::new(Arc::new(NullStorage), Arc::new(catalog), TxConfig::default());
    /// let mut tx = session.begin()?;
    /// let person = session.new_record(Some("Person"));
    /// tx.add_operation(&person, OperationKind::Created)?;
    ///
    /// tx.rollback(false)?;
    /// assert_eq!(tx.status(), TransactionStatus::RolledBack);
    /// assert!(!person.rid().is_temporary());
    /// tx.rollback(false)?;
    /// # Ok::<(), GraphTxError>(())
    /// ```
    pub fn rollback(&mut self, force: bool) -> Result<()> {
        self.ensure_outside_hooks("roll back")?;
        match self.status {
            TransactionStatus::Begun => {}
            TransactionStatus::RolledBack => return Ok(()),
            status => {
                return Err(GraphTxError::InvalidState(format!(
                    "cannot roll back transaction {}: status is {:?}",
                    self.id, status
                )));
            }
        }
        self.nesting = if force {
            0
        } else {
            self.nesting.saturating_sub(1)
        };
        if self.nesting == 0 {
            self.do_rollback();
        }
        Ok(())
    }

    fn ensure_outside_hooks(&self, action: &str) -> Result<()> {
        if self.callbacks.in_progress {
            return Err(GraphTxError::InvalidState(format!(
                "cannot {} transaction {} from inside a hook",
                action, self.id
            )));
        }
        Ok(())
    }

    /// Rolls back after a failure, if the transaction is still alive.
    pub(crate) fn abort(&mut self, err: GraphTxError) -> GraphTxError {
        if self.is_active() {
            warn!("transaction {} rolled back: {}", self.id, err);
            self.do_rollback();
        }
        err
    }

    fn do_rollback(&mut self) {
        self.status = TransactionStatus::RollingBack;
        let mut evicted: Vec<Rid> = self.touched.iter().copied().collect();
        evicted.extend(self.ledger.iter().map(|(rid, _)| *rid));
        evicted.extend(
            self.identity
                .mapping()
                .iter()
                .flat_map(|(old, new)| [*old, *new]),
        );
        self.cache.evict_all(evicted.iter());
        self.release_new_identities();
        // A hook may have triggered this rollback; the running processor still owns the guard.
        let in_progress = self.callbacks.in_progress;
        self.clear_state();
        self.callbacks.in_progress = in_progress;
        self.status = TransactionStatus::RolledBack;
        debug!("transaction {} rolled back", self.id);
    }

    /// Returns records created here to the never-saved state.
    ///
    /// Links rewritten to identities assigned by a failed commit point back to
    /// the temporary identities, and every record that was new in this
    /// transaction drops its position so the next transaction allocates a
    /// fresh one. Replaying the same operations in the same order reproduces
    /// the same temporary identities.
    fn release_new_identities(&self) {
        let mut reverse: HashMap<Rid, Rid> = HashMap::new();
        for (old, new) in self.identity.mapping() {
            if !old.is_temporary() {
                continue;
            }
            reverse
                .entry(*new)
                .and_modify(|first| {
                    // Temporary positions decrease: the highest one was allocated first.
                    if old.position() > first.position() {
                        *first = *old;
                    }
                })
                .or_insert(*old);
        }
        for (_, operation) in self.ledger.iter() {
            let mut record = operation.record().write();
            if !reverse.is_empty() {
                record.rewrite_links(&reverse);
            }
            let rid = record.rid();
            if rid.is_new() || reverse.contains_key(&rid) {
                record.set_rid(rid.with_position(INVALID_POSITION));
                trace!("released identity {}", rid);
            }
        }
    }

    fn clear_state(&mut self) {
        self.ledger.clear();
        self.index_log.clear();
        self.identity.clear();
        self.callbacks.reset();
        self.touched.clear();
        self.custom.clear();
        self.nesting = 0;
    }

    fn do_commit(&mut self) -> Result<HashMap<Rid, Rid>> {
        self.status = TransactionStatus::Committing;
        debug!("transaction {} committing", self.id);

        self.run_callbacks()?;
        self.ensure_not_rolled_back_by_hooks()?;

        self.storage.begin_atomic_operation(self.id)?;
        if let Err(err) = self.check_versions().and_then(|()| self.store()) {
            if let Err(end_err) = self.storage.end_atomic_operation(self.id, true) {
                warn!(
                    "transaction {} could not release its atomic operation: {}",
                    self.id, end_err
                );
            }
            return Err(err);
        }
        self.storage.end_atomic_operation(self.id, false)?;

        let mapping = self.identity.mapping().clone();
        self.publish();
        self.clear_state();
        self.status = TransactionStatus::Completed;
        debug!(
            "transaction {} committed, {} identities assigned",
            self.id,
            mapping.len()
        );
        Ok(mapping)
    }

    /// Optimistic check: every updated or deleted record must still be at the version it was read.
    fn check_versions(&self) -> Result<()> {
        for operation in self.ledger.sorted() {
            if operation.kind() == OperationKind::Created {
                continue;
            }
            let (rid, expected) = {
                let record = operation.record().read();
                (record.rid(), record.version())
            };
            let actual = self.storage.read_current_version(rid)?.unwrap_or(0);
            if actual != expected {
                return Err(GraphTxError::TransactionConflict {
                    rid,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Assigns final identities, reduces index changes and hands the batch to storage.
    fn store(&mut self) -> Result<()> {
        let mut created: Vec<RecordRef> = self
            .ledger
            .iter()
            .filter(|(rid, op)| op.kind() == OperationKind::Created && rid.is_new())
            .map(|(_, op)| op.record().clone())
            .collect();
        // Temporary positions decrease, so this is creation order.
        created.sort_by_key(|record| {
            let rid = record.rid();
            (Reverse(rid.position()), rid.collection())
        });
        for record in created {
            let old = record.rid();
            let new = self.storage.assign_final_position(&record.read())?;
            self.apply_identity_change(old, new)?;
        }

        self.rewrite_links();
        let stale: Vec<Rid> = self.identity.mapping().keys().copied().collect();
        self.index_log.verify_no_stale(&stale)?;

        let mut indexes = Vec::new();
        for changes in self.index_log.indexes() {
            let effects = interpret_index(changes)?;
            if !effects.is_empty() {
                indexes.push(IndexCommit {
                    index: changes.definition().name().to_string(),
                    effects,
                });
            }
        }

        let mutations = self
            .ledger
            .sorted()
            .into_iter()
            .map(|operation| {
                let record = operation.record().read();
                match operation.kind() {
                    OperationKind::Created => {
                        let mut snapshot = (*record).clone();
                        snapshot.set_version(1);
                        StorageMutation::Create(snapshot)
                    }
                    OperationKind::Updated => {
                        let mut snapshot = (*record).clone();
                        snapshot.set_version(record.version() + 1);
                        StorageMutation::Update {
                            record: snapshot,
                            expected_version: record.version(),
                        }
                    }
                    OperationKind::Deleted => StorageMutation::Delete {
                        rid: record.rid(),
                        expected_version: record.version(),
                    },
                }
            })
            .collect();

        self.storage.commit(CommitBatch {
            transaction_id: self.id,
            mutations,
            indexes,
        })
    }

    /// Applies committed versions to the live records and refreshes the cache.
    fn publish(&mut self) {
        let stale: Vec<Rid> = self.identity.mapping().keys().copied().collect();
        self.cache.evict_all(stale.iter());
        for (rid, operation) in self.ledger.iter() {
            let record = operation.record();
            match operation.kind() {
                OperationKind::Created | OperationKind::Updated => {
                    {
                        let mut guard = record.write();
                        let version = match operation.kind() {
                            OperationKind::Created => 1,
                            _ => guard.version() + 1,
                        };
                        guard.set_version(version);
                        guard.mark_clean();
                    }
                    if self.config.use_cache {
                        self.cache.put(*rid, record.clone());
                    } else {
                        self.cache.evict(rid);
                    }
                }
                OperationKind::Deleted => {
                    self.cache.evict(rid);
                }
            }
        }
    }

    /// Rewrites links inside every pending record to the identities assigned so far.
    pub(crate) fn rewrite_links(&mut self) {
        let mapping = self.identity.mapping();
        if mapping.is_empty() {
            return;
        }
        for (rid, operation) in self.ledger.iter() {
            if operation.record().write().rewrite_links(mapping) {
                trace!("links of {} rewritten", rid);
            }
        }
    }

    /// Replaces identity `old` with `new` across every structure of the transaction.
    ///
    /// The record registered under `old`, if any, is rewritten in place
    /// between the two halves of the protocol. Afterwards the ledger, the
    /// callback queues and the index change log know the record only as
    /// `new`, and lookups by `old` are redirected.
    ///
    /// # Errors
    ///
    /// `Consistency` if `new` is already registered for another record or
    /// `old` is already changing.
    pub fn apply_identity_change(&mut self, old: Rid, new: Rid) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let record = self.ledger.get(&old).map(|op| op.record().clone());
        self.on_before_identity_change(old)?;
        if let Some(record) = &record {
            record.write().set_rid(new);
        }
        self.on_after_identity_change(old, new)
    }
}

impl IdentityChangeListener for Transaction {
    fn on_before_identity_change(&mut self, old: Rid) -> Result<()> {
        let transit = InTransit {
            operation: self.ledger.take(&old),
            before_queue: take_positions(&mut self.callbacks.before_queue, old),
            after_queue: take_positions(&mut self.callbacks.after_queue, old),
        };
        self.index_log.before_identity_change(old);
        self.identity.stash(old, transit)
    }

    fn on_after_identity_change(&mut self, old: Rid, new: Rid) -> Result<()> {
        let transit = self.identity.unstash(&old)?;
        if let Some(operation) = transit.operation {
            if self.ledger.contains(&new) {
                return Err(GraphTxError::Consistency(format!(
                    "identity {} is already taken by another pending record",
                    new
                )));
            }
            self.ledger.reinsert(new, operation);
        }
        restore_positions(&mut self.callbacks.before_queue, new, &transit.before_queue);
        restore_positions(&mut self.callbacks.after_queue, new, &transit.after_queue);
        self.index_log.after_identity_change(old, new);
        self.identity.record_change(old, new);
        self.cache.evict(&old);
        self.touched.insert(new);
        Ok(())
    }
}
