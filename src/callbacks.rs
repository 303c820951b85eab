//! Callback fixpoint processor.
//!
//! Runs the before/after hooks of every operation whose record changed since
//! its last pass, and repeats until a pass leaves nothing newly dirtied.

use std::collections::VecDeque;

use log::debug;

use crate::data_store::record::RecordRef;
use crate::errors::{GraphTxError, Result};
use crate::ledger::OperationKind;
use crate::rid::{Rid, INVALID_POSITION};
use crate::transaction::Transaction;

/// Snapshot of a pending operation handed to hooks.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub rid: Rid,
    pub kind: OperationKind,
    pub record: RecordRef,
}

/// Mutation hook run during commit: validation, security, index upkeep.
///
/// Hooks receive the transaction and may register further operations or
/// index entries; records they dirty get a pass of their own. Calling
/// `commit` or `rollback` from a hook fails with a state error.
pub trait RecordHook: Send + Sync {
    fn name(&self) -> &str;

    fn before(&self, _tx: &mut Transaction, _operation: &PendingOperation) -> Result<()> {
        Ok(())
    }

    fn after(&self, _tx: &mut Transaction, _operation: &PendingOperation) -> Result<()> {
        Ok(())
    }
}

/// Processor state kept on the transaction.
#[derive(Debug, Default)]
pub(crate) struct CallbackState {
    pub(crate) in_progress: bool,
    /// Identities still waiting for their before-hooks in the current pass.
    pub(crate) before_queue: VecDeque<Rid>,
    /// Identities whose before-hooks ran and that wait for their after-hooks.
    pub(crate) after_queue: VecDeque<Rid>,
}

impl CallbackState {
    pub(crate) fn reset(&mut self) {
        self.in_progress = false;
        self.before_queue.clear();
        self.after_queue.clear();
    }
}

/// Removes every occurrence of `rid`, returning the positions it held.
pub(crate) fn take_positions(queue: &mut VecDeque<Rid>, rid: Rid) -> Vec<usize> {
    let positions: Vec<usize> = queue
        .iter()
        .enumerate()
        .filter(|(_, r)| **r == rid)
        .map(|(i, _)| i)
        .collect();
    for position in positions.iter().rev() {
        queue.remove(*position);
    }
    positions
}

/// Puts `rid` back at the positions returned by [`take_positions`].
pub(crate) fn restore_positions(queue: &mut VecDeque<Rid>, rid: Rid, positions: &[usize]) {
    for position in positions {
        let position = (*position).min(queue.len());
        queue.insert(position, rid);
    }
}

impl Transaction {
    /// Runs hooks to a fixpoint, then drops records created and deleted in this transaction.
    pub(crate) fn run_callbacks(&mut self) -> Result<()> {
        if self.callbacks.in_progress {
            return Err(GraphTxError::InvalidState(
                "callback processing re-entered from a hook".to_string(),
            ));
        }
        self.callbacks.in_progress = true;
        let result = self.run_callback_passes();
        self.callbacks.reset();
        result?;

        for operation in self.ledger.purge_created_then_deleted() {
            let rid = operation.rid();
            operation
                .record()
                .write()
                .set_rid(rid.with_position(INVALID_POSITION));
            debug!(
                "transaction {} drops {} created and deleted before commit",
                self.id(),
                rid
            );
            self.index_log.purge_value(rid);
            self.cache.evict(&rid);
        }
        Ok(())
    }

    fn run_callback_passes(&mut self) -> Result<()> {
        let hooks = self.hooks.clone();
        let mut passes = 0;
        loop {
            let dirty = self.ledger.dirty_since_last_pass();
            if dirty.is_empty() {
                return Ok(());
            }
            passes += 1;
            if passes > self.config.max_callback_passes {
                return Err(GraphTxError::Consistency(format!(
                    "hooks still dirtying records after {} passes",
                    self.config.max_callback_passes
                )));
            }
            debug!(
                "transaction {} callback pass {} over {} operations",
                self.id(),
                passes,
                dirty.len()
            );

            self.callbacks.before_queue = dirty.into();
            while let Some(rid) = self.callbacks.before_queue.pop_front() {
                let Some(operation) = self.pending_operation(rid) else {
                    continue;
                };
                for hook in hooks.iter() {
                    hook.before(self, &operation)?;
                    self.ensure_not_rolled_back_by_hooks()?;
                }
                let rid = self.identity.resolve(operation.rid);
                if let Some(current) = self.ledger.get_mut(&rid) {
                    // A kind change inside the hooks needs a pass of its own.
                    if current.kind() == operation.kind {
                        let dirty = current.record().dirty_counter();
                        current.set_callback_dirty_counter(dirty);
                    }
                }
                self.callbacks.after_queue.push_back(rid);
            }

            while let Some(rid) = self.callbacks.after_queue.pop_front() {
                let Some(operation) = self.pending_operation(rid) else {
                    continue;
                };
                for hook in hooks.iter() {
                    hook.after(self, &operation)?;
                    self.ensure_not_rolled_back_by_hooks()?;
                }
            }
        }
    }

    /// A hook that swallows the error of a failed registration leaves the
    /// transaction rolled back underneath the processor.
    pub(crate) fn ensure_not_rolled_back_by_hooks(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        Err(GraphTxError::InvalidState(format!(
            "transaction {} rolled back during callback processing",
            self.id()
        )))
    }

    fn pending_operation(&self, rid: Rid) -> Option<PendingOperation> {
        self.ledger
            .get(&self.identity.resolve(rid))
            .map(|operation| PendingOperation {
                rid: operation.rid(),
                kind: operation.kind(),
                record: operation.record().clone(),
            })
    }
}
