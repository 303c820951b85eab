//! Record operation ledger: at most one pending operation per record.

use ahash::AHashMap as HashMap;
use log::trace;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::data_store::record::RecordRef;
use crate::errors::{GraphTxError, Result};
use crate::identity::IdentityRemap;
use crate::rid::Rid;

/// Kind of a pending record operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    Created,
    Updated,
    Deleted,
}

impl OperationKind {
    /// Order in which a callback pass visits operations. Deletions come first.
    pub const fn callback_priority(self) -> u8 {
        match self {
            OperationKind::Deleted => 0,
            OperationKind::Created => 1,
            OperationKind::Updated => 2,
        }
    }
}

/// The pending operation on one record.
#[derive(Debug, Clone)]
pub struct RecordOperation {
    record: RecordRef,
    kind: OperationKind,
    /// First registered as `Created`: a later delete drops it instead of storing it.
    created_in_tx: bool,
    /// Dirty counter recorded by the last callback pass, `None` before the first.
    callback_dirty: Option<u64>,
    /// Dirty counter last seen on the peer during a client-server merge.
    peer_dirty: Option<u64>,
}

impl RecordOperation {
    fn new(record: RecordRef, kind: OperationKind) -> Self {
        Self {
            record,
            kind,
            created_in_tx: kind == OperationKind::Created,
            callback_dirty: None,
            peer_dirty: None,
        }
    }

    /// The live record this operation will store.
    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    /// Current identity of the record; changes when storage assigns the final one.
    pub fn rid(&self) -> Rid {
        self.record.rid()
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether the first touch in this transaction was a creation.
    ///
    /// Such an operation that ends up `Deleted` is dropped before commit.
    pub fn is_created_in_transaction(&self) -> bool {
        self.created_in_tx
    }

    /// Record dirty counter seen by the last callback pass, `None` before the first.
    pub fn callback_dirty_counter(&self) -> Option<u64> {
        self.callback_dirty
    }

    pub(crate) fn set_callback_dirty_counter(&mut self, dirty: u64) {
        self.callback_dirty = Some(dirty);
    }

    /// Record dirty counter last reported by the server, if a server log was merged.
    pub fn peer_dirty_counter(&self) -> Option<u64> {
        self.peer_dirty
    }

    pub(crate) fn set_peer_dirty_counter(&mut self, dirty: u64) {
        self.peer_dirty = Some(dirty);
    }

    /// The record changed (or the operation changed kind) since its last callback pass.
    pub fn needs_callbacks(&self) -> bool {
        self.callback_dirty != Some(self.record.dirty_counter())
    }

    /// Applies the merge table for a second touch of the same record.
    ///
    /// | current \ new | Created | Updated | Deleted |
    /// |---|---|---|---|
    /// | Created | error | Created | Deleted |
    /// | Updated | error | Updated | Deleted |
    /// | Deleted | error | error | error |
    pub(crate) fn merge(&mut self, kind: OperationKind) -> Result<()> {
        use OperationKind::*;
        let rid = self.record.rid();
        match (self.kind, kind) {
            (Deleted, _) => return Err(GraphTxError::RecordAlreadyDeleted(rid)),
            (Created, Created) | (Updated, Created) => {
                return Err(GraphTxError::DuplicateCreation(rid));
            }
            (Created, Updated) | (Updated, Updated) => {}
            (Created, Deleted) | (Updated, Deleted) => {
                self.kind = Deleted;
                self.callback_dirty = None;
            }
        }
        Ok(())
    }
}

/// Per-transaction map from record identity to its pending operation.
#[derive(Debug)]
pub struct Ledger {
    operations: HashMap<Rid, RecordOperation>,
    first_temporary_position: i64,
    next_temporary_position: i64,
}

impl Ledger {
    /// Creates an empty ledger.
    ///
    /// # Arguments
    ///
    /// * `first_temporary_position` - Position of the first temporary identity;
    ///   later ones decrease by one. Values above `-2` are clamped to `-2`.
    pub fn new(first_temporary_position: i64) -> Self {
        // -1 means "no position"; temporary positions start below it.
        let first = first_temporary_position.min(-2);
        Self {
            operations: HashMap::new(),
            first_temporary_position: first,
            next_temporary_position: first,
        }
    }

    /// Registers `kind` for `record`, merging with an existing operation.
    ///
    /// Records without an identity get a collection from `catalog` and a
    /// temporary position; the new identity is watched by `remap`. The
    /// record's identity is resolved through `remap` first, so a record
    /// renamed earlier in the transaction finds its operation.
    ///
    /// # Arguments
    ///
    /// * `record` - The record being touched.
    /// * `kind` - The requested operation.
    /// * `remap` - Identity changes of the owning transaction.
    /// * `catalog` - Chooses or checks the collection of a record that has none.
    ///
    /// # Returns
    ///
    /// The operation now registered for the record.
    ///
    /// # Errors
    ///
    /// * `InvalidState` when deleting a record that was never saved.
    /// * `RecordAlreadyDeleted` / `DuplicateCreation` for merge-table violations.
    /// * `Consistency` when another record instance holds the same identity.
    /// * Catalog errors for the collection.
    pub fn add_operation(
        &mut self,
        record: &RecordRef,
        kind: OperationKind,
        remap: &mut IdentityRemap,
        catalog: &dyn Catalog,
    ) -> Result<&RecordOperation> {
        let mut rid = remap.resolve(record.rid());

        if !rid.is_persistent() && !rid.is_temporary() {
            if kind == OperationKind::Deleted {
                return Err(GraphTxError::InvalidState(
                    "cannot delete a record that was never saved".to_string(),
                ));
            }
            let collection = {
                let guard = record.read();
                if rid.is_assigned() {
                    catalog.check_collection(&guard, rid.collection())?;
                    rid.collection()
                } else {
                    catalog.resolve_collection(&guard)?
                }
            };
            rid = Rid::new(collection, self.next_temporary_position);
            self.next_temporary_position -= 1;
            record.write().set_rid(rid);
            trace!("assigned temporary identity {}", rid);
        }

        if rid.is_new() {
            remap.watch(rid);
        }

        match self.operations.get_mut(&rid) {
            Some(operation) => {
                if !operation.record.ptr_eq(record) {
                    return Err(GraphTxError::Consistency(format!(
                        "two record instances share identity {}",
                        rid
                    )));
                }
                operation.merge(kind)?;
                trace!("merged {:?} into operation on {}", kind, rid);
            }
            None => {
                // A record that was never stored can only be created.
                let kind = if rid.is_new() && kind == OperationKind::Updated {
                    OperationKind::Created
                } else {
                    kind
                };
                self.operations
                    .insert(rid, RecordOperation::new(record.clone(), kind));
                trace!("registered {:?} on {}", kind, rid);
            }
        }
        self.operations
            .get(&rid)
            .ok_or_else(|| GraphTxError::Consistency(format!("operation on {} vanished", rid)))
    }

    /// Looks `rid` up directly, without following identity changes.
    pub fn get(&self, rid: &Rid) -> Option<&RecordOperation> {
        self.operations.get(rid)
    }

    pub(crate) fn get_mut(&mut self, rid: &Rid) -> Option<&mut RecordOperation> {
        self.operations.get_mut(rid)
    }

    /// Removes and returns the operation keyed by `rid`.
    pub(crate) fn take(&mut self, rid: &Rid) -> Option<RecordOperation> {
        self.operations.remove(rid)
    }

    pub(crate) fn reinsert(&mut self, rid: Rid, operation: RecordOperation) {
        self.operations.insert(rid, operation);
    }

    /// Inserts an operation that arrived from a peer rather than a local touch.
    pub(crate) fn insert_remote(&mut self, record: RecordRef, kind: OperationKind) -> Result<()> {
        let rid = record.rid();
        if self.operations.contains_key(&rid) {
            return Err(GraphTxError::Consistency(format!(
                "operation on {} already registered",
                rid
            )));
        }
        self.operations.insert(rid, RecordOperation::new(record, kind));
        Ok(())
    }

    /// Whether an operation is keyed by `rid`, without following identity changes.
    pub fn contains(&self, rid: &Rid) -> bool {
        self.operations.contains_key(rid)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&Rid, &RecordOperation)> {
        self.operations.iter()
    }

    /// Operations in callback order: kind priority, then identity.
    pub fn sorted(&self) -> Vec<&RecordOperation> {
        let mut operations: Vec<(&Rid, &RecordOperation)> = self.operations.iter().collect();
        operations.sort_by_key(|(rid, op)| (op.kind.callback_priority(), **rid));
        operations.into_iter().map(|(_, op)| op).collect()
    }

    /// Identities whose operation needs a callback pass, in callback order.
    pub fn dirty_since_last_pass(&self) -> Vec<Rid> {
        let mut dirty: Vec<(u8, Rid)> = self
            .operations
            .iter()
            .filter(|(_, op)| op.needs_callbacks())
            .map(|(rid, op)| (op.kind.callback_priority(), *rid))
            .collect();
        dirty.sort();
        dirty.into_iter().map(|(_, rid)| rid).collect()
    }

    /// Drops records created and deleted within this transaction.
    ///
    /// Returns the dropped operations ordered by identity.
    pub fn purge_created_then_deleted(&mut self) -> Vec<RecordOperation> {
        let mut purged: Vec<Rid> = self
            .operations
            .iter()
            .filter(|(_, op)| op.created_in_tx && op.kind == OperationKind::Deleted)
            .map(|(rid, _)| *rid)
            .collect();
        purged.sort();
        purged
            .iter()
            .filter_map(|rid| self.operations.remove(rid))
            .collect()
    }

    /// Drops every operation and restarts temporary positions.
    pub fn clear(&mut self) {
        self.operations.clear();
        self.next_temporary_position = self.first_temporary_position;
    }
}
