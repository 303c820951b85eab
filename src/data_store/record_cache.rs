use ahash::AHashMap as HashMap;
use parking_lot::RwLock;

use crate::data_store::record::RecordRef;
use crate::rid::Rid;

/// Session-level cache of live records, keyed by their current identity.
///
/// Transactions publish committed records here and evict whatever they
/// touched on rollback so no stale instance outlives its transaction.
#[derive(Default)]
pub struct RecordCache {
    records: RwLock<HashMap<Rid, RecordRef>>,
}

impl RecordCache {
    /// Creates a new, empty `RecordCache`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached record for `rid`, if any.
    pub fn get(&self, rid: &Rid) -> Option<RecordRef> {
        self.records.read().get(rid).cloned()
    }

    /// Inserts or replaces the record cached under `rid`.
    /// Returns the previously cached record.
    pub fn put(&self, rid: Rid, record: RecordRef) -> Option<RecordRef> {
        self.records.write().insert(rid, record)
    }

    /// Removes `rid` from the cache.
    pub fn evict(&self, rid: &Rid) -> Option<RecordRef> {
        self.records.write().remove(rid)
    }

    pub fn evict_all<'a>(&self, rids: impl IntoIterator<Item = &'a Rid>) {
        let mut records = self.records.write();
        for rid in rids {
            records.remove(rid);
        }
    }

    pub fn contains(&self, rid: &Rid) -> bool {
        self.records.read().contains_key(rid)
    }

    /// Whether this exact record instance is reachable from the cache.
    pub fn holds(&self, record: &RecordRef) -> bool {
        self.records.read().values().any(|r| r.ptr_eq(record))
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
