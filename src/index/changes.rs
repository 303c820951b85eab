//! Per-transaction buffer of secondary-index mutations.
//!
//! Entries are grouped per index and per key, in arrival order. A secondary
//! map from the entry *value* (a record identity) to the `(index, key,
//! operation)` triples it appears in lets the identity remap protocol find
//! every entry that references a record without scanning all indexes.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use log::trace;

use crate::errors::{GraphTxError, Result};
use crate::index::definition::IndexDefinition;
use crate::index::key::IndexKey;
use crate::rid::Rid;

/// Operation requested through `Transaction::add_index_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOperation {
    Put,
    Remove,
    /// Discard every prior entry of the index and mark it cleared.
    Clear,
}

/// Operation recorded for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryOperation {
    Put,
    Remove,
}

/// One entry of a per-key change list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntryChange {
    /// `None` only for a remove of every value under the key.
    pub value: Option<Rid>,
    pub operation: EntryOperation,
}

/// Ordered change list for one key of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChangesPerKey {
    key: IndexKey,
    entries: Vec<IndexEntryChange>,
}

impl IndexChangesPerKey {
    pub fn new(key: IndexKey) -> Self {
        Self {
            key,
            entries: Vec::new(),
        }
    }

    /// The key these changes apply to.
    pub fn key(&self) -> &IndexKey {
        &self.key
    }

    /// Entries in the order they were added.
    pub fn entries(&self) -> &[IndexEntryChange] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, value: Option<Rid>, operation: EntryOperation) {
        self.entries.push(IndexEntryChange { value, operation });
    }

    fn replace_value(&mut self, old: Rid, new: Rid) {
        for entry in &mut self.entries {
            if entry.value == Some(old) {
                entry.value = Some(new);
            }
        }
    }
}

/// Buffered changes of one index.
#[derive(Debug, Clone)]
pub struct IndexChanges {
    definition: Arc<IndexDefinition>,
    cleared: bool,
    per_key: BTreeMap<IndexKey, IndexChangesPerKey>,
}

impl IndexChanges {
    fn new(definition: Arc<IndexDefinition>) -> Self {
        Self {
            definition,
            cleared: false,
            per_key: BTreeMap::new(),
        }
    }

    /// Definition of the index, used to interpret the changes at commit.
    pub fn definition(&self) -> &Arc<IndexDefinition> {
        &self.definition
    }

    /// The index was cleared in this transaction; storage must drop its content first.
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    pub fn changes_for_key(&self, key: &IndexKey) -> Option<&IndexChangesPerKey> {
        self.per_key.get(key)
    }

    /// Per-key change lists in key order.
    pub fn per_key(&self) -> impl Iterator<Item = &IndexChangesPerKey> {
        self.per_key.values()
    }

    /// Number of keys with buffered changes.
    pub fn len(&self) -> usize {
        self.per_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_key.is_empty()
    }

    /// Moves `changes` under its key, appending to an existing list for that key.
    fn reinsert(&mut self, changes: IndexChangesPerKey) {
        match self.per_key.get_mut(&changes.key) {
            Some(existing) => existing.entries.extend(changes.entries),
            None => {
                self.per_key.insert(changes.key.clone(), changes);
            }
        }
    }
}

/// One `(index, key, operation)` triple registered under an entry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIndexOperation {
    pub index: String,
    pub key: IndexKey,
    pub operation: EntryOperation,
}

/// Index state lifted out while a record identity is being rewritten.
#[derive(Debug, Default)]
struct InTransit {
    keyed: Vec<(String, IndexChangesPerKey)>,
    by_value: Vec<RecordIndexOperation>,
}

/// Secondary-index mutations buffered by one transaction.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use graphtx::prelude::*;
///
/// let names = Arc::new(IndexDefinition::manual(
///     "names",
///     vec![IndexField::new("name", FieldType::String)],
///     IndexCardinality::NotUnique,
/// ));
/// let ada = Rid::new(10, 0);
///
/// let mut log = IndexChangeLog::new();
/// log.add_entry(&names, Some("ada".into()), IndexOperation::Put, Some(ada))?;
/// assert_eq!(log.operations_for_value(&ada).len(), 1);
///
/// log.add_entry(&names, None, IndexOperation::Clear, None)?;
/// assert!(log.index_changes("names").unwrap().is_cleared());
/// assert!(log.operations_for_value(&ada).is_empty());
/// # Ok::<(), GraphTxError>(())
/// ```
#[derive(Debug, Default)]
pub struct IndexChangeLog {
    indexes: BTreeMap<String, IndexChanges>,
    by_value: HashMap<Rid, Vec<RecordIndexOperation>>,
    in_transit: HashMap<Rid, InTransit>,
}

impl IndexChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one index mutation.
    ///
    /// A `None` key is the null key. `Put` requires a value; `Remove` without
    /// a value removes every value under the key. `Clear` drops every earlier
    /// entry of the index, including its value registrations.
    ///
    /// # Arguments
    ///
    /// * `definition` - The index the entry belongs to.
    /// * `key` - The entry key.
    /// * `operation` - What to record.
    /// * `value` - The indexed record identity.
    ///
    /// # Errors
    ///
    /// `Consistency` for a `Put` without a value.
    pub fn add_entry(
        &mut self,
        definition: &Arc<IndexDefinition>,
        key: Option<IndexKey>,
        operation: IndexOperation,
        value: Option<Rid>,
    ) -> Result<()> {
        let name = definition.name().to_string();
        let changes = self
            .indexes
            .entry(name.clone())
            .or_insert_with(|| IndexChanges::new(Arc::clone(definition)));

        let operation = match operation {
            IndexOperation::Clear => {
                changes.cleared = true;
                changes.per_key.clear();
                for ops in self.by_value.values_mut() {
                    ops.retain(|op| op.index != name);
                }
                self.by_value.retain(|_, ops| !ops.is_empty());
                trace!("index '{}' cleared", name);
                return Ok(());
            }
            IndexOperation::Put => {
                if value.is_none() {
                    return Err(GraphTxError::Consistency(format!(
                        "put into index '{}' requires a value",
                        name
                    )));
                }
                EntryOperation::Put
            }
            IndexOperation::Remove => EntryOperation::Remove,
        };

        let key = key.unwrap_or_else(IndexKey::null);
        changes
            .per_key
            .entry(key.clone())
            .or_insert_with(|| IndexChangesPerKey::new(key.clone()))
            .add(value, operation);

        if let Some(rid) = value {
            self.by_value
                .entry(rid)
                .or_default()
                .push(RecordIndexOperation {
                    index: name.clone(),
                    key: key.clone(),
                    operation,
                });
        }
        trace!("index '{}' {:?} {} -> {:?}", name, operation, key, value);
        Ok(())
    }

    /// Buffered changes of the index named `index`.
    pub fn index_changes(&self, index: &str) -> Option<&IndexChanges> {
        self.indexes.get(index)
    }

    /// Buffered indexes in name order.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexChanges> {
        self.indexes.values()
    }

    /// Triples registered for entries whose value is `rid`.
    pub fn operations_for_value(&self, rid: &Rid) -> &[RecordIndexOperation] {
        self.by_value.get(rid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty() && self.by_value.is_empty() && self.in_transit.is_empty()
    }

    pub fn clear(&mut self) {
        self.indexes.clear();
        self.by_value.clear();
        self.in_transit.clear();
    }

    /// Removes every entry of `index` whose value is `rid`.
    ///
    /// Keys left without entries disappear from the index.
    pub fn retract_value(&mut self, index: &str, rid: Rid) {
        let Some(ops) = self.by_value.get_mut(&rid) else {
            return;
        };
        let mut keys = Vec::new();
        ops.retain(|op| {
            if op.index == index {
                keys.push(op.key.clone());
                false
            } else {
                true
            }
        });
        if ops.is_empty() {
            self.by_value.remove(&rid);
        }
        if let Some(changes) = self.indexes.get_mut(index) {
            for key in keys {
                if let Some(per_key) = changes.per_key.get_mut(&key) {
                    per_key.entries.retain(|entry| entry.value != Some(rid));
                    if per_key.is_empty() {
                        changes.per_key.remove(&key);
                    }
                }
            }
        }
    }

    /// Removes every entry, in every index, whose value is `rid`.
    pub fn purge_value(&mut self, rid: Rid) {
        let indexes: Vec<String> = self
            .operations_for_value(&rid)
            .iter()
            .map(|op| op.index.clone())
            .collect();
        for index in indexes {
            self.retract_value(&index, rid);
        }
    }

    /// First half of the identity remap: lift out every per-key list whose
    /// key embeds `old`, plus the value registrations of `old`.
    pub fn before_identity_change(&mut self, old: Rid) {
        let mut transit = InTransit::default();
        for (name, changes) in self.indexes.iter_mut() {
            if !changes.definition.may_depend_on_rid() {
                continue;
            }
            let stale: Vec<IndexKey> = changes
                .per_key
                .keys()
                .filter(|key| key.contains_rid(old))
                .cloned()
                .collect();
            for key in stale {
                if let Some(per_key) = changes.per_key.remove(&key) {
                    transit.keyed.push((name.clone(), per_key));
                }
            }
        }
        if let Some(ops) = self.by_value.remove(&old) {
            transit.by_value = ops;
        }
        if !transit.keyed.is_empty() || !transit.by_value.is_empty() {
            self.in_transit.insert(old, transit);
        }
    }

    /// Second half of the identity remap: put the lifted state back under
    /// `new`, rewriting keys and values that referenced `old`.
    pub fn after_identity_change(&mut self, old: Rid, new: Rid) {
        let Some(transit) = self.in_transit.remove(&old) else {
            return;
        };

        for (name, mut per_key) in transit.keyed {
            let old_key = per_key.key.clone();
            let new_key = old_key.with_rid_replaced(old, new).unwrap_or(old_key.clone());
            per_key.key = new_key.clone();
            per_key.replace_value(old, new);

            // Other values indexed under this key must follow the key.
            for entry in &per_key.entries {
                let Some(value) = entry.value else { continue };
                if value == old {
                    continue;
                }
                if let Some(ops) = self.by_value.get_mut(&value) {
                    for op in ops.iter_mut() {
                        if op.index == name && op.key == old_key {
                            op.key = new_key.clone();
                        }
                    }
                }
            }

            if let Some(changes) = self.indexes.get_mut(&name) {
                changes.reinsert(per_key);
            }
        }

        let mut moved = Vec::with_capacity(transit.by_value.len());
        for mut op in transit.by_value {
            if let Some(key) = op.key.with_rid_replaced(old, new) {
                op.key = key;
            }
            if let Some(per_key) = self
                .indexes
                .get_mut(&op.index)
                .and_then(|changes| changes.per_key.get_mut(&op.key))
            {
                per_key.replace_value(old, new);
            }
            moved.push(op);
        }
        if !moved.is_empty() {
            self.by_value.entry(new).or_default().extend(moved);
        }
        trace!("index changes moved from {} to {}", old, new);
    }

    /// Fails if any key, value or registration still references one of `stale`.
    ///
    /// # Errors
    ///
    /// * `StaleIdentity` naming the first index that still references a
    ///   stale identity.
    /// * `Consistency` if an identity change was started but never completed.
    pub fn verify_no_stale(&self, stale: &[Rid]) -> Result<()> {
        for (name, changes) in &self.indexes {
            for per_key in changes.per_key.values() {
                for rid in stale {
                    let referenced = per_key.key.contains_rid(*rid)
                        || per_key.entries.iter().any(|e| e.value == Some(*rid));
                    if referenced {
                        return Err(GraphTxError::StaleIdentity {
                            index: name.clone(),
                            rid: *rid,
                        });
                    }
                }
            }
        }
        for rid in stale {
            if let Some(op) = self.by_value.get(rid).and_then(|ops| ops.first()) {
                return Err(GraphTxError::StaleIdentity {
                    index: op.index.clone(),
                    rid: *rid,
                });
            }
        }
        if let Some(rid) = self.in_transit.keys().next() {
            return Err(GraphTxError::Consistency(format!(
                "identity change of {} was never completed",
                rid
            )));
        }
        Ok(())
    }
}
