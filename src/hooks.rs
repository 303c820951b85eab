use std::sync::Arc;

use crate::callbacks::{PendingOperation, RecordHook};
use crate::catalog::Catalog;
use crate::errors::Result;
use crate::index::changes::IndexOperation;
use crate::index::definition::IndexDefinition;
use crate::index::key::IndexKey;
use crate::ledger::OperationKind;
use crate::transaction::Transaction;

/// Keeps the automatic indexes of a record's class in step with its fields.
///
/// Every pass first retracts what earlier passes emitted for the record, so
/// the buffered entries always describe original -> current.
pub struct IndexMaintenanceHook {
    catalog: Arc<dyn Catalog>,
}

impl IndexMaintenanceHook {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

struct KeyChange {
    definition: Arc<IndexDefinition>,
    original: Option<IndexKey>,
    current: Option<IndexKey>,
}

impl RecordHook for IndexMaintenanceHook {
    fn name(&self) -> &str {
        "index-maintenance"
    }

    fn before(&self, tx: &mut Transaction, operation: &PendingOperation) -> Result<()> {
        let changes: Vec<KeyChange> = {
            let record = operation.record.read();
            let Some(class) = record.class() else {
                return Ok(());
            };
            self.catalog
                .indexes_for_class(class)
                .into_iter()
                .filter(|definition| definition.is_automatic())
                .map(|definition| KeyChange {
                    original: definition.original_key_of(&record),
                    current: definition.key_of(&record),
                    definition,
                })
                .collect()
        };

        let rid = operation.rid;
        for change in changes {
            tx.index_changes_mut()
                .retract_value(change.definition.name(), rid);
            match operation.kind {
                OperationKind::Created => {
                    if let Some(key) = change.current {
                        tx.add_index_entry(&change.definition, Some(key), IndexOperation::Put, Some(rid))?;
                    }
                }
                OperationKind::Deleted => {
                    if let Some(key) = change.original {
                        tx.add_index_entry(&change.definition, Some(key), IndexOperation::Remove, Some(rid))?;
                    }
                }
                OperationKind::Updated => {
                    if change.original == change.current {
                        continue;
                    }
                    if let Some(key) = change.original {
                        tx.add_index_entry(&change.definition, Some(key), IndexOperation::Remove, Some(rid))?;
                    }
                    if let Some(key) = change.current {
                        tx.add_index_entry(&change.definition, Some(key), IndexOperation::Put, Some(rid))?;
                    }
                }
            }
        }
        Ok(())
    }
}
