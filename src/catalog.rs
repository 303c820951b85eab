use std::sync::Arc;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};

use crate::data_store::record::Record;
use crate::errors::{GraphTxError, Result};
use crate::index::definition::IndexDefinition;
use crate::rid::CollectionId;

/// Schema and security metadata consumed by the transaction engine.
///
/// The engine asks it where new records go, whether an explicitly chosen
/// collection is acceptable, and which automatic indexes cover a class.
pub trait Catalog: Send + Sync {
    /// Picks the collection for a record that has none yet.
    fn resolve_collection(&self, record: &Record) -> Result<CollectionId>;

    /// Validates a collection the caller chose explicitly.
    fn check_collection(&self, record: &Record, collection: CollectionId) -> Result<()>;

    /// Automatic indexes maintained for records of `class`.
    fn indexes_for_class(&self, class: &str) -> Vec<Arc<IndexDefinition>>;
}

#[derive(Debug, Default, Clone)]
struct ClassInfo {
    collections: Vec<CollectionId>,
    indexes: Vec<Arc<IndexDefinition>>,
}

/// In-memory catalog with a fixed class layout.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    classes: HashMap<String, ClassInfo>,
    default_collection: Option<CollectionId>,
    denied: HashSet<CollectionId>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `class` stored in `collections`; the first one receives new records.
    pub fn with_class(mut self, class: &str, collections: &[CollectionId]) -> Self {
        self.classes
            .entry(class.to_string())
            .or_default()
            .collections
            .extend_from_slice(collections);
        self
    }

    /// Registers an automatic index on its class.
    pub fn with_index(mut self, definition: Arc<IndexDefinition>) -> Self {
        self.classes
            .entry(definition.class().to_string())
            .or_default()
            .indexes
            .push(definition);
        self
    }

    /// Collection for records without a class.
    pub fn with_default_collection(mut self, collection: CollectionId) -> Self {
        self.default_collection = Some(collection);
        self
    }

    /// Rejects writes to `collection`.
    pub fn deny_collection(mut self, collection: CollectionId) -> Self {
        self.denied.insert(collection);
        self
    }

    fn check_access(&self, collection: CollectionId) -> Result<()> {
        if self.denied.contains(&collection) {
            return Err(GraphTxError::Validation(format!(
                "write access to collection {} denied",
                collection
            )));
        }
        Ok(())
    }
}

impl Catalog for StaticCatalog {
    fn resolve_collection(&self, record: &Record) -> Result<CollectionId> {
        let collection = match record.class() {
            Some(class) => self
                .classes
                .get(class)
                .and_then(|info| info.collections.first().copied())
                .ok_or_else(|| {
                    GraphTxError::Validation(format!("class '{}' has no collection", class))
                })?,
            None => self.default_collection.ok_or_else(|| {
                GraphTxError::Validation("record has no class and no default collection".into())
            })?,
        };
        self.check_access(collection)?;
        Ok(collection)
    }

    fn check_collection(&self, record: &Record, collection: CollectionId) -> Result<()> {
        if let Some(info) = record.class().and_then(|class| self.classes.get(class)) {
            if !info.collections.contains(&collection) {
                return Err(GraphTxError::Validation(format!(
                    "collection {} does not belong to class '{}'",
                    collection,
                    record.class().unwrap_or_default()
                )));
            }
        }
        self.check_access(collection)
    }

    fn indexes_for_class(&self, class: &str) -> Vec<Arc<IndexDefinition>> {
        self.classes
            .get(class)
            .map(|info| info.indexes.clone())
            .unwrap_or_default()
    }
}
