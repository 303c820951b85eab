mod common;

use std::sync::Arc;

use common::*;
use graphtx::prelude::*;

fn links_index() -> Arc<IndexDefinition> {
    Arc::new(IndexDefinition::manual(
        "links",
        vec![IndexField::new("target", FieldType::LinkList)],
        IndexCardinality::NotUnique,
    ))
}

#[test]
fn test_link_to_new_record_is_rewritten_on_commit() {
    let (storage, session) = setup_session();
    storage.set_next_position(PERSON, 5);
    let mut tx = session.begin().unwrap();

    let r1 = new_person(&session, "r1");
    tx.add_operation(&r1, OperationKind::Created).unwrap();
    let r1_temp = r1.rid();
    assert_eq!(r1_temp, Rid::new(PERSON, -2));

    let r2 = session.new_record(Some("Post"));
    r2.write().set_field("author", r1_temp).unwrap();
    tx.add_operation(&r2, OperationKind::Created).unwrap();
    let r2_temp = r2.rid();

    let links = links_index();
    tx.add_index_entry(&links, Some(IndexKey::from(r1_temp)), IndexOperation::Put, Some(r2_temp))
        .unwrap();

    let mapping = tx.commit(false).unwrap();
    let r1_final = Rid::new(PERSON, 5);
    let r2_final = Rid::new(POST, 0);
    assert_eq!(mapping.get(&r1_temp), Some(&r1_final));
    assert_eq!(mapping.get(&r2_temp), Some(&r2_final));

    assert_eq!(r1.rid(), r1_final);
    assert_eq!(r2.read().field("author"), Some(&Value::Link(r1_final)));
    let stored = storage.get(&r2_final).unwrap();
    assert_eq!(stored.field("author"), Some(&Value::Link(r1_final)));

    let batch = storage.last_batch().unwrap();
    assert_eq!(
        effects_of(&batch, "Post.author"),
        vec![IndexEffect::Put {
            key: IndexKey::from(r1_final),
            value: r2_final
        }]
    );
    assert_eq!(
        effects_of(&batch, "links"),
        vec![IndexEffect::Put {
            key: IndexKey::from(r1_final),
            value: r2_final
        }]
    );
    assert_eq!(
        effects_of(&batch, "Person.name"),
        vec![IndexEffect::Put {
            key: IndexKey::from("r1"),
            value: r1_final
        }]
    );
    for mutation in &batch.mutations {
        assert!(mutation.rid().is_persistent());
    }
}

#[test]
fn test_operation_is_found_by_old_and_new_identity() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();

    let record = new_person(&session, "ada");
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let old = record.rid();
    let new = Rid::new(PERSON, 7);

    tx.apply_identity_change(old, new).unwrap();

    let by_old = tx.get_operation(old).unwrap();
    let by_new = tx.get_operation(new).unwrap();
    assert!(by_old.record().ptr_eq(by_new.record()));
    assert_eq!(by_old.rid(), new);
    assert_eq!(record.rid(), new);
    assert_eq!(tx.identity_mapping().get(&old), Some(&new));
    assert_eq!(tx.operations().len(), 1);
}

#[test]
fn test_chained_identity_changes_collapse() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();

    let record = new_person(&session, "ada");
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let first = record.rid();
    let second = Rid::new(PERSON, -9);
    let last = Rid::new(PERSON, 4);

    tx.apply_identity_change(first, second).unwrap();
    tx.apply_identity_change(second, last).unwrap();

    assert_eq!(tx.identity_mapping().get(&first), Some(&last));
    assert_eq!(tx.identity_mapping().get(&second), Some(&last));
    assert_eq!(tx.get_operation(first).unwrap().rid(), last);
}

#[test]
fn test_index_entries_follow_identity_exactly_once() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let links = links_index();

    let record = session.new_record(Some("Post"));
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let old = record.rid();
    let other = Rid::new(POST, 40);

    // Keyed by the record and holding it as value.
    tx.add_index_entry(&links, Some(IndexKey::from(old)), IndexOperation::Put, Some(old))
        .unwrap();
    // Keyed by the record, holding another value.
    tx.add_index_entry(&links, Some(IndexKey::from(old)), IndexOperation::Put, Some(other))
        .unwrap();
    // Holding the record under an unrelated key.
    tx.add_index_entry(&links, Some(IndexKey::from(other)), IndexOperation::Put, Some(old))
        .unwrap();

    let new = Rid::new(POST, 2);
    tx.apply_identity_change(old, new).unwrap();

    let changes = tx.index_changes("links").unwrap();
    assert!(changes.changes_for_key(&IndexKey::from(old)).is_none());
    assert_eq!(changes.len(), 2);

    let moved = changes.changes_for_key(&IndexKey::from(new)).unwrap();
    let values: Vec<Option<Rid>> = moved.entries().iter().map(|e| e.value).collect();
    assert_eq!(values, vec![Some(new), Some(other)]);

    let unrelated = changes.changes_for_key(&IndexKey::from(other)).unwrap();
    let values: Vec<Option<Rid>> = unrelated.entries().iter().map(|e| e.value).collect();
    assert_eq!(values, vec![Some(new)]);

    let log = tx.index_change_log();
    assert!(log.operations_for_value(&old).is_empty());
    assert_eq!(log.operations_for_value(&new).len(), 2);
    assert!(
        log.operations_for_value(&other)
            .iter()
            .all(|op| op.key == IndexKey::from(new))
    );
}

#[test]
fn test_composite_key_with_link_is_remapped() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let pairs = Arc::new(IndexDefinition::manual(
        "pairs",
        vec![
            IndexField::new("owner", FieldType::Link),
            IndexField::new("label", FieldType::String),
        ],
        IndexCardinality::Unique,
    ));
    assert!(pairs.is_composite());
    assert!(pairs.may_depend_on_rid());

    let record = session.new_record(Some("Post"));
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let old = record.rid();
    let value = Rid::new(POST, 11);
    let key = IndexKey::from_parts(vec![KeyPart::Link(old), KeyPart::String("x".into())]);
    tx.add_index_entry(&pairs, Some(key), IndexOperation::Put, Some(value))
        .unwrap();

    let new = Rid::new(POST, 3);
    tx.apply_identity_change(old, new).unwrap();

    let expected_key = IndexKey::from_parts(vec![KeyPart::Link(new), KeyPart::String("x".into())]);
    let changes = tx.index_changes("pairs").unwrap();
    assert_eq!(changes.len(), 1);
    let entries = changes.changes_for_key(&expected_key).unwrap().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, Some(value));
}

#[test]
fn test_entries_added_after_change_resolve_old_identity() {
    let (_storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    let links = links_index();

    let record = session.new_record(Some("Post"));
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let old = record.rid();
    let new = Rid::new(POST, 8);
    tx.apply_identity_change(old, new).unwrap();

    tx.add_index_entry(&links, Some(IndexKey::from(old)), IndexOperation::Put, Some(old))
        .unwrap();
    let changes = tx.index_changes("links").unwrap();
    let entries = changes.changes_for_key(&IndexKey::from(new)).unwrap().entries();
    assert_eq!(entries[0].value, Some(new));
}

#[test]
fn test_mistyped_index_keeping_stale_key_fails_commit() {
    let (storage, session) = setup_session();
    let mut tx = session.begin().unwrap();
    // Declared as a string index but fed link keys: the remap skips it.
    let names = Arc::new(IndexDefinition::manual(
        "names",
        vec![IndexField::new("name", FieldType::String)],
        IndexCardinality::NotUnique,
    ));

    let record = new_person(&session, "ada");
    tx.add_operation(&record, OperationKind::Created).unwrap();
    let old = record.rid();
    tx.add_index_entry(&names, Some(IndexKey::from(old)), IndexOperation::Put, Some(Rid::new(PERSON, 90)))
        .unwrap();

    let err = tx.commit(false).unwrap_err();
    assert!(matches!(
        err,
        GraphTxError::StaleIdentity { ref index, rid } if index == "names" && rid == old
    ));
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert!(storage.batches().is_empty());
    assert_eq!(storage.atomic_operations(), vec![(tx.id(), true)]);
}

#[test]
fn test_collection_field_types_resolve_to_component() {
    assert_eq!(IndexField::new("tags", FieldType::LinkSet).field_type(), FieldType::Link);
    assert_eq!(
        IndexField::new("parts", FieldType::EmbeddedList).field_type(),
        FieldType::Embedded
    );
    assert!(FieldType::Link.may_depend_on_rid());
    assert!(FieldType::Embedded.may_depend_on_rid());
    assert!(!FieldType::String.may_depend_on_rid());
    assert!(!FieldType::Integer.may_depend_on_rid());
}
