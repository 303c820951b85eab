mod common;

use std::sync::Arc;

use common::*;
use graphtx::prelude::*;

fn tags_index() -> Arc<IndexDefinition> {
    Arc::new(IndexDefinition::manual(
        "tags",
        vec![IndexField::new("tag", FieldType::String)],
        IndexCardinality::NotUnique,
    ))
}

fn email_index() -> Arc<IndexDefinition> {
    Arc::new(IndexDefinition::manual(
        "email",
        vec![IndexField::new("email", FieldType::String)],
        IndexCardinality::Unique,
    ))
}

fn put(key: &str, value: Rid) -> IndexEffect {
    IndexEffect::Put {
        key: IndexKey::from(key),
        value,
    }
}

fn remove(key: &str, value: Rid) -> IndexEffect {
    IndexEffect::Remove {
        key: IndexKey::from(key),
        value: Some(value),
    }
}

#[test]
fn test_clear_discards_prior_entries() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let tags = tags_index();
    let (a, b) = (Rid::new(PERSON, 0), Rid::new(PERSON, 1));

    tx.add_index_entry(&tags, Some("red".into()), IndexOperation::Put, Some(a))
        .unwrap();
    tx.add_index_entry(&tags, None, IndexOperation::Clear, None)
        .unwrap();
    tx.add_index_entry(&tags, Some("blue".into()), IndexOperation::Put, Some(b))
        .unwrap();

    let changes = tx.index_changes("tags").unwrap();
    assert!(changes.is_cleared());
    assert_eq!(changes.len(), 1);
    assert!(changes.changes_for_key(&"red".into()).is_none());
    assert!(tx.index_change_log().operations_for_value(&a).is_empty());

    tx.commit(false).unwrap();
    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "tags"),
        vec![IndexEffect::Clear, put("blue", b)]
    );
}

#[test]
fn test_not_unique_index_reduces_to_net_delta() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let tags = tags_index();
    let (a, b, c) = (Rid::new(PERSON, 0), Rid::new(PERSON, 1), Rid::new(PERSON, 2));

    for (operation, value) in [
        (IndexOperation::Put, a),
        (IndexOperation::Put, b),
        (IndexOperation::Remove, a),
        (IndexOperation::Remove, c),
        (IndexOperation::Put, b),
    ] {
        tx.add_index_entry(&tags, Some("red".into()), operation, Some(value))
            .unwrap();
    }
    assert_eq!(
        tx.index_changes("tags")
            .unwrap()
            .changes_for_key(&"red".into())
            .unwrap()
            .entries()
            .len(),
        5
    );

    tx.commit(false).unwrap();
    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "tags"),
        vec![put("red", b), remove("red", c)]
    );
}

#[test]
fn test_remove_without_value_drops_whole_key() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let tags = tags_index();
    let a = Rid::new(PERSON, 0);

    tx.add_index_entry(&tags, Some("red".into()), IndexOperation::Put, Some(a))
        .unwrap();
    tx.add_index_entry(&tags, Some("red".into()), IndexOperation::Remove, None)
        .unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "tags"),
        vec![IndexEffect::Remove {
            key: "red".into(),
            value: None
        }]
    );
}

#[test]
fn test_unique_index_rejects_two_values_for_one_key() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let email = email_index();

    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(Rid::new(PERSON, 0)))
        .unwrap();
    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(Rid::new(PERSON, 1)))
        .unwrap();

    let err = tx.commit(false).unwrap_err();
    assert!(matches!(err, GraphTxError::DuplicateKey { ref index, .. } if index == "email"));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert!(storage.batches().is_empty());
}

#[test]
fn test_unique_index_accepts_value_replacement() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let email = email_index();
    let (old, new) = (Rid::new(PERSON, 0), Rid::new(PERSON, 1));

    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Remove, Some(old))
        .unwrap();
    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(new))
        .unwrap();
    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(new))
        .unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "email"),
        vec![remove("a@x", old), put("a@x", new)]
    );
}

#[test]
fn test_unique_put_then_remove_cancels() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let email = email_index();
    let (a, b) = (Rid::new(PERSON, 0), Rid::new(PERSON, 1));

    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(a))
        .unwrap();
    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Remove, Some(a))
        .unwrap();
    tx.add_index_entry(&email, Some("a@x".into()), IndexOperation::Put, Some(b))
        .unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert_eq!(effects_of(&batch, "email"), vec![put("a@x", b)]);
}

#[test]
fn test_put_without_value_is_rejected() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();

    let err = tx
        .add_index_entry(&tags_index(), Some("red".into()), IndexOperation::Put, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
}

#[test]
fn test_automatic_index_follows_field_update() {
    let (storage, session) = setup_session();
    let rid = Rid::new(PERSON, 0);
    let record = seed(&storage, &session, rid, "Person", &[("name", "ada".into())]);

    let mut tx = session.begin().unwrap();
    record.write().set_field("name", "grace").unwrap();
    tx.add_operation(&record, OperationKind::Updated).unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "Person.name"),
        vec![remove("ada", rid), put("grace", rid)]
    );
}

#[test]
fn test_automatic_index_ignores_unrelated_field() {
    let (storage, session) = setup_session();
    let rid = Rid::new(PERSON, 0);
    let record = seed(&storage, &session, rid, "Person", &[("name", "ada".into())]);

    let mut tx = session.begin().unwrap();
    record.write().set_field("age", 36i64).unwrap();
    tx.add_operation(&record, OperationKind::Updated).unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert!(effects_of(&batch, "Person.name").is_empty());
}

#[test]
fn test_automatic_index_removes_deleted_record() {
    let (storage, session) = setup_session();
    let rid = Rid::new(PERSON, 2);
    let record = seed(&storage, &session, rid, "Person", &[("name", "ada".into())]);

    let mut tx = session.begin().unwrap();
    tx.add_operation(&record, OperationKind::Deleted).unwrap();
    tx.commit(false).unwrap();

    let batch = storage.last_batch().unwrap();
    assert_eq!(effects_of(&batch, "Person.name"), vec![remove("ada", rid)]);
}

#[test]
fn test_duplicate_names_through_automatic_index() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    tx.add_operation(&new_person(&session, "ada"), OperationKind::Created)
        .unwrap();
    tx.add_operation(&new_person(&session, "ada"), OperationKind::Created)
        .unwrap();

    let err = tx.commit(false).unwrap_err();
    assert!(matches!(err, GraphTxError::DuplicateKey { .. }));
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert_eq!(storage.len(), 0);
}

#[test]
fn test_repeated_passes_replace_earlier_entries() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let record = new_person(&session, "first");
    tx.add_operation(&record, OperationKind::Created).unwrap();

    tx.process_callbacks().unwrap();
    record.write().set_field("name", "second").unwrap();
    tx.process_callbacks().unwrap();

    let changes = tx.index_changes("Person.name").unwrap();
    assert!(changes.changes_for_key(&"first".into()).is_none());
    let entries = changes.changes_for_key(&"second".into()).unwrap().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, EntryOperation::Put);
    assert_eq!(entries[0].value, Some(record.rid()));
    assert_eq!(
        tx.index_change_log()
            .operations_for_value(&record.rid())
            .len(),
        1
    );
}

#[test]
fn test_interpretation_follows_cardinality() {
    let rid = Rid::new(PERSON, 0);
    let other = Rid::new(PERSON, 1);
    let mut per_key = IndexChangesPerKey::new("k".into());
    per_key.add(Some(rid), EntryOperation::Put);
    per_key.add(Some(other), EntryOperation::Put);

    assert!(matches!(
        IndexCardinality::Unique.interpret("idx", &per_key),
        Err(GraphTxError::DuplicateKey { .. })
    ));
    assert_eq!(
        IndexCardinality::NotUnique.interpret("idx", &per_key).unwrap(),
        vec![put("k", rid), put("k", other)]
    );
}
