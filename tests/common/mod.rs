//! Common utilities for graphtx integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use graphtx::prelude::*;
use parking_lot::Mutex;

pub const PERSON: CollectionId = 10;
pub const PERSON_ARCHIVE: CollectionId = 11;
pub const POST: CollectionId = 12;
pub const DEFAULT_COLLECTION: CollectionId = 9;

// --- MockStorage ---

#[derive(Debug, Default)]
struct MockState {
    records: HashMap<Rid, Record>,
    next_position: HashMap<CollectionId, i64>,
    batches: Vec<CommitBatch>,
    atomic_operations: Vec<(u64, bool)>,
    fail_commit: bool,
}

/// A mock implementation of the `Storage` trait for testing purposes.
/// Stores records in an in-memory HashMap and keeps every committed batch.
#[derive(Debug, Default)]
pub struct MockStorage {
    state: Mutex<MockState>,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next final position handed out in `collection` equal `position`.
    pub fn set_next_position(&self, collection: CollectionId, position: i64) {
        self.state.lock().next_position.insert(collection, position);
    }

    /// Stores a record directly, as if a previous transaction had committed it.
    pub fn insert(&self, record: Record) {
        let mut state = self.state.lock();
        let rid = record.rid();
        let next = state.next_position.entry(rid.collection()).or_insert(0);
        *next = (*next).max(rid.position() + 1);
        state.records.insert(rid, record);
    }

    pub fn get(&self, rid: &Rid) -> Option<Record> {
        self.state.lock().records.get(rid).cloned()
    }

    /// Simulates a concurrent writer by advancing the stored version.
    pub fn bump_version(&self, rid: &Rid) {
        if let Some(record) = self.state.lock().records.get_mut(rid) {
            let version = record.version();
            record.set_version(version + 1);
        }
    }

    pub fn fail_next_commit(&self) {
        self.state.lock().fail_commit = true;
    }

    pub fn batches(&self) -> Vec<CommitBatch> {
        self.state.lock().batches.clone()
    }

    pub fn last_batch(&self) -> Option<CommitBatch> {
        self.state.lock().batches.last().cloned()
    }

    pub fn atomic_operations(&self) -> Vec<(u64, bool)> {
        self.state.lock().atomic_operations.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }
}

impl Storage for MockStorage {
    fn assign_final_position(&self, record: &Record) -> Result<Rid> {
        let mut state = self.state.lock();
        let collection = record.rid().collection();
        let next = state.next_position.entry(collection).or_insert(0);
        let rid = Rid::new(collection, *next);
        *next += 1;
        Ok(rid)
    }

    fn read_current_version(&self, rid: Rid) -> Result<Option<u64>> {
        Ok(self.state.lock().records.get(&rid).map(Record::version))
    }

    fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_commit {
            state.fail_commit = false;
            return Err(GraphTxError::StorageError("disk full".to_string()));
        }
        for mutation in &batch.mutations {
            let expected = match mutation {
                StorageMutation::Create(_) => continue,
                StorageMutation::Update {
                    expected_version, ..
                }
                | StorageMutation::Delete {
                    expected_version, ..
                } => *expected_version,
            };
            let rid = mutation.rid();
            let actual = state.records.get(&rid).map(Record::version).unwrap_or(0);
            if actual != expected {
                return Err(GraphTxError::TransactionConflict {
                    rid,
                    expected,
                    actual,
                });
            }
        }
        for mutation in &batch.mutations {
            match mutation {
                StorageMutation::Create(record) | StorageMutation::Update { record, .. } => {
                    state.records.insert(record.rid(), record.clone());
                }
                StorageMutation::Delete { rid, .. } => {
                    state.records.remove(rid);
                }
            }
        }
        state.batches.push(batch);
        Ok(())
    }

    fn end_atomic_operation(&self, transaction_id: u64, rollback: bool) -> Result<()> {
        self.state
            .lock()
            .atomic_operations
            .push((transaction_id, rollback));
        Ok(())
    }
}

// --- Helper Functions ---

pub fn person_name_index() -> Arc<IndexDefinition> {
    Arc::new(IndexDefinition::new(
        "Person.name",
        "Person",
        vec![IndexField::new("name", FieldType::String)],
        IndexCardinality::Unique,
    ))
}

pub fn post_author_index() -> Arc<IndexDefinition> {
    Arc::new(IndexDefinition::new(
        "Post.author",
        "Post",
        vec![IndexField::new("author", FieldType::Link)],
        IndexCardinality::NotUnique,
    ))
}

pub fn test_catalog() -> StaticCatalog {
    StaticCatalog::new()
        .with_class("Person", &[PERSON, PERSON_ARCHIVE])
        .with_class("Post", &[POST])
        .with_default_collection(DEFAULT_COLLECTION)
        .with_index(person_name_index())
        .with_index(post_author_index())
}

/// Helper function to create a session over a fresh MockStorage.
pub fn setup_session() -> (Arc<MockStorage>, Session) {
    setup_session_with(TxConfig::default())
}

pub fn setup_session_with(config: TxConfig) -> (Arc<MockStorage>, Session) {
    let storage = Arc::new(MockStorage::new());
    let session = Session::new(storage.clone(), Arc::new(test_catalog()), config);
    (storage, session)
}

pub fn fields(values: &[(&str, Value)]) -> BTreeMap<String, Value> {
    values
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Stores a record at version 1 and loads it into `session`.
pub fn seed(
    storage: &MockStorage,
    session: &Session,
    rid: Rid,
    class: &str,
    values: &[(&str, Value)],
) -> RecordRef {
    storage.insert(Record::loaded(
        rid,
        Some(class.to_string()),
        RecordContent::Fields(fields(values)),
        1,
        RecordOwner::Detached,
    ));
    session.load_record(rid, Some(class), fields(values), 1)
}

/// A new `Person` record with its name set.
pub fn new_person(session: &Session, name: &str) -> RecordRef {
    let record = session.new_record(Some("Person"));
    record.write().set_field("name", name).unwrap();
    record
}

pub fn effects_of(batch: &CommitBatch, index: &str) -> Vec<IndexEffect> {
    batch
        .indexes
        .iter()
        .find(|commit| commit.index == index)
        .map(|commit| commit.effects.clone())
        .unwrap_or_default()
}
