//! Folds the server's operation log for a transaction into the client's
//! in-flight copy of the same transaction.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::data_store::record::{RecordContent, RecordOwner, RecordRef};
use crate::errors::{GraphTxError, Result};
use crate::ledger::OperationKind;
use crate::remote::codec::WireCodec;
use crate::rid::Rid;
use crate::transaction::Transaction;

/// Record content attached to a server operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerPayload {
    /// The whole record in wire format.
    Full(Vec<u8>),
    /// Changes relative to the client's copy.
    Delta(Vec<u8>),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOperation {
    pub rid: Rid,
    pub kind: OperationKind,
    /// The record's dirty counter on the server.
    pub dirty_counter: u64,
    pub version: u64,
    pub payload: ServerPayload,
}

/// What the server sends back for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerTransactionLog {
    /// Identities the server assigned, old -> new, in assignment order.
    pub identity_changes: Vec<(Rid, Rid)>,
    pub operations: Vec<ServerOperation>,
}

impl ServerTransactionLog {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Transaction {
    /// Merges the server's log for this transaction into the local state.
    ///
    /// Operations on records the client already holds must be strictly ahead
    /// of the local dirty counter. Any failure rolls the transaction back.
    pub fn merge_server_log(
        &mut self,
        log: ServerTransactionLog,
        codec: &dyn WireCodec,
    ) -> Result<()> {
        self.ensure_active("merge a server log")?;
        debug!(
            "transaction {} merging {} server operations, {} identity changes",
            self.id(),
            log.operations.len(),
            log.identity_changes.len()
        );
        self.apply_server_log(log, codec)
            .map_err(|err| self.abort(err))
    }

    fn apply_server_log(&mut self, log: ServerTransactionLog, codec: &dyn WireCodec) -> Result<()> {
        for (old, new) in log.identity_changes {
            let old = self.identity.resolve(old);
            if self.ledger.contains(&old) || self.identity.is_watched(&old) {
                self.apply_identity_change(old, new)?;
            }
        }
        for operation in log.operations {
            self.merge_server_operation(operation, codec)?;
        }
        self.rewrite_links();
        Ok(())
    }

    fn merge_server_operation(
        &mut self,
        operation: ServerOperation,
        codec: &dyn WireCodec,
    ) -> Result<()> {
        let rid = self.identity.resolve(operation.rid);
        match self.ledger.get(&rid).map(|local| local.record().clone()) {
            Some(record) => self.merge_into_local(rid, record, operation, codec),
            None => self.register_remote(rid, operation, codec),
        }
    }

    fn merge_into_local(
        &mut self,
        rid: Rid,
        record: RecordRef,
        operation: ServerOperation,
        codec: &dyn WireCodec,
    ) -> Result<()> {
        {
            let mut guard = record.write();
            let local = guard.dirty_counter();
            if local >= operation.dirty_counter {
                return Err(GraphTxError::MergeConflict {
                    rid,
                    local,
                    remote: operation.dirty_counter,
                });
            }
            match &operation.payload {
                ServerPayload::Full(bytes) => guard.set_content(materialized_content(bytes, codec)?),
                ServerPayload::Delta(bytes) => codec.deserialize_delta(bytes, &mut guard)?,
                ServerPayload::None => {}
            }
            guard.set_dirty_counter(operation.dirty_counter);
            guard.set_version(operation.version);
        }

        let Some(local) = self.ledger.get_mut(&rid) else {
            return Err(GraphTxError::Consistency(format!(
                "operation on {} vanished during merge",
                rid
            )));
        };
        match (local.kind(), operation.kind) {
            (OperationKind::Deleted, OperationKind::Deleted) => {}
            (OperationKind::Deleted, _) => return Err(GraphTxError::RecordAlreadyDeleted(rid)),
            (_, OperationKind::Deleted) => local.merge(OperationKind::Deleted)?,
            _ => {}
        }
        // The server already ran the hooks for this state.
        local.set_peer_dirty_counter(operation.dirty_counter);
        local.set_callback_dirty_counter(operation.dirty_counter);
        trace!("merged server {:?} into {}", operation.kind, rid);
        Ok(())
    }

    fn register_remote(
        &mut self,
        rid: Rid,
        operation: ServerOperation,
        codec: &dyn WireCodec,
    ) -> Result<()> {
        let cached = self.cache.get(&rid);
        let record = match (cached, &operation.payload) {
            (Some(cached), ServerPayload::Full(bytes)) => {
                let content = materialized_content(bytes, codec)?;
                cached.write().set_content(content);
                cached
            }
            (None, ServerPayload::Full(bytes)) => {
                let mut incoming = codec.from_wire(bytes)?;
                codec.materialize(&mut incoming)?;
                incoming.set_rid(rid);
                incoming.bind(RecordOwner::Session(self.session_id()));
                RecordRef::new(incoming)
            }
            (Some(cached), ServerPayload::Delta(bytes)) => {
                codec.deserialize_delta(bytes, &mut cached.write())?;
                cached
            }
            (Some(cached), ServerPayload::None) => cached,
            (None, _) => {
                return Err(GraphTxError::Consistency(format!(
                    "server operation on {} carries no content and the record is not loaded",
                    rid
                )));
            }
        };
        {
            let mut guard = record.write();
            guard.set_dirty_counter(operation.dirty_counter);
            guard.set_version(operation.version);
        }

        self.ledger.insert_remote(record, operation.kind)?;
        if let Some(local) = self.ledger.get_mut(&rid) {
            local.set_peer_dirty_counter(operation.dirty_counter);
            local.set_callback_dirty_counter(operation.dirty_counter);
        }
        if rid.is_new() {
            self.identity.watch(rid);
        }
        self.touched.insert(rid);
        trace!("registered server {:?} on {}", operation.kind, rid);
        Ok(())
    }
}

fn materialized_content(bytes: &[u8], codec: &dyn WireCodec) -> Result<RecordContent> {
    let mut incoming = codec.from_wire(bytes)?;
    codec.materialize(&mut incoming)?;
    Ok(incoming.content().clone())
}
