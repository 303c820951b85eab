use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::errors::{GraphTxError, Result};
use crate::rid::Rid;
use crate::value::Value;

/// Identifier of the session a record is bound to.
pub type SessionId = u64;

/// Who owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOwner {
    /// Independently persisted record, bound to a session.
    Session(SessionId),
    /// Record owned by a parent record; never persisted on its own.
    Embedded(SessionId),
    /// Record materialized outside of any session (e.g. received from a peer).
    Detached,
}

/// Field storage of a record.
///
/// Records received over the wire keep their field bytes until something
/// asks for the fields; see `WireCodec::materialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordContent {
    Fields(BTreeMap<String, Value>),
    Serialized(Vec<u8>),
}

/// A document/graph record together with its version and dirty counter.
///
/// The dirty counter is bumped by every mutation and is what the callback
/// processor compares to decide whether a record needs another hook pass.
/// The version is the storage version the record was loaded at and is what
/// the optimistic check compares at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    rid: Rid,
    class: Option<String>,
    content: RecordContent,
    version: u64,
    dirty: u64,
    /// Original value of each field changed since the record was last clean.
    /// `None` means the field did not exist.
    changes: BTreeMap<String, Option<Value>>,
    owner: RecordOwner,
}

impl Record {
    /// Creates an empty, not yet persisted record.
    pub fn new(class: Option<&str>, owner: RecordOwner) -> Self {
        Self {
            rid: Rid::unassigned(),
            class: class.map(str::to_string),
            content: RecordContent::Fields(BTreeMap::new()),
            version: 0,
            dirty: 0,
            changes: BTreeMap::new(),
            owner,
        }
    }

    /// Creates a record as it was loaded from storage or received from a peer.
    pub fn loaded(
        rid: Rid,
        class: Option<String>,
        content: RecordContent,
        version: u64,
        owner: RecordOwner,
    ) -> Self {
        Self {
            rid,
            class,
            content,
            version,
            dirty: 0,
            changes: BTreeMap::new(),
            owner,
        }
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub(crate) fn set_rid(&mut self, rid: Rid) {
        self.rid = rid;
    }

    pub fn class(&self) -> Option<&str> {
        self.class.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn dirty_counter(&self) -> u64 {
        self.dirty
    }

    pub(crate) fn set_dirty_counter(&mut self, dirty: u64) {
        self.dirty = dirty;
    }

    /// Marks the record as modified without touching its fields.
    pub fn touch(&mut self) {
        self.dirty += 1;
    }

    pub fn owner(&self) -> RecordOwner {
        self.owner
    }

    pub(crate) fn bind(&mut self, owner: RecordOwner) {
        self.owner = owner;
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.owner, RecordOwner::Embedded(_))
    }

    pub fn content(&self) -> &RecordContent {
        &self.content
    }

    pub fn set_content(&mut self, content: RecordContent) {
        self.content = content;
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.content, RecordContent::Fields(_))
    }

    /// The record's fields, or `None` while they are still serialized.
    pub fn fields(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.content {
            RecordContent::Fields(fields) => Some(fields),
            RecordContent::Serialized(_) => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields().and_then(|fields| fields.get(name))
    }

    /// Value of `name` before the changes made since the record was last clean.
    pub fn original_field(&self, name: &str) -> Option<&Value> {
        match self.changes.get(name) {
            Some(original) => original.as_ref(),
            None => self.field(name),
        }
    }

    /// Names of the fields changed since the record was last clean.
    pub fn changed_fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn is_changed(&self) -> bool {
        !self.changes.is_empty()
    }

    fn fields_mut(&mut self) -> Result<&mut BTreeMap<String, Value>> {
        match &mut self.content {
            RecordContent::Fields(fields) => Ok(fields),
            RecordContent::Serialized(_) => Err(GraphTxError::InvalidState(format!(
                "record {} is not materialized",
                self.rid
            ))),
        }
    }

    /// Sets a field, remembering its original value and bumping the dirty counter.
    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let fields = self.fields_mut()?;
        let previous = fields.insert(name.to_string(), value);
        self.changes.entry(name.to_string()).or_insert(previous);
        self.dirty += 1;
        Ok(())
    }

    pub fn remove_field(&mut self, name: &str) -> Result<Option<Value>> {
        let fields = self.fields_mut()?;
        let previous = fields.remove(name);
        if previous.is_some() {
            self.changes
                .entry(name.to_string())
                .or_insert_with(|| previous.clone());
            self.dirty += 1;
        }
        Ok(previous)
    }

    /// Forgets the change tracking. Called once the record reached storage.
    pub fn mark_clean(&mut self) {
        self.changes.clear();
    }

    /// Rewrites links in both current and original field values.
    /// Does not count as a modification.
    pub fn rewrite_links(&mut self, mapping: &HashMap<Rid, Rid>) -> bool {
        let mut changed = false;
        if let RecordContent::Fields(fields) = &mut self.content {
            for value in fields.values_mut() {
                changed |= value.rewrite_links(mapping);
            }
        }
        for value in self.changes.values_mut().flatten() {
            changed |= value.rewrite_links(mapping);
        }
        changed
    }
}

/// Shared handle to a live record.
///
/// The same record instance is reachable from the application, the session
/// cache and the transaction ledger; all of them observe the identity change
/// applied at commit.
#[derive(Clone)]
pub struct RecordRef(Arc<RwLock<Record>>);

impl RecordRef {
    pub fn new(record: Record) -> Self {
        Self(Arc::new(RwLock::new(record)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Record> {
        self.0.write()
    }

    pub fn rid(&self) -> Rid {
        self.0.read().rid()
    }

    pub fn dirty_counter(&self) -> u64 {
        self.0.read().dirty_counter()
    }

    /// Same record instance, not merely equal contents.
    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.0.read();
        f.debug_struct("RecordRef")
            .field("rid", &record.rid())
            .field("dirty", &record.dirty_counter())
            .finish()
    }
}
