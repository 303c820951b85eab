#![cfg(feature = "distributed")]

mod common;

use common::*;
use graphtx::prelude::*;

fn server_copy(rid: Rid, values: &[(&str, Value)]) -> Record {
    Record::loaded(
        rid,
        Some("Person".to_string()),
        RecordContent::Fields(fields(values)),
        1,
        RecordOwner::Detached,
    )
}

/// A loaded record dirtied `times` times and registered as updated.
fn dirty_update(session: &Session, tx: &mut Transaction, rid: Rid, times: u64) -> RecordRef {
    let record = session.load_record(rid, Some("Person"), fields(&[("name", "ada".into())]), 1);
    for i in 0..times {
        record.write().set_field("visits", i as i64).unwrap();
    }
    tx.add_operation(&record, OperationKind::Updated).unwrap();
    record
}

#[test]
fn test_server_operation_ahead_of_client_is_merged() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let rid = Rid::new(PERSON, 0);
    let mut tx = session.begin().unwrap();
    let record = dirty_update(&session, &mut tx, rid, 4);
    assert_eq!(record.dirty_counter(), 4);

    let mut server = server_copy(rid, &[("name", "ada".into())]);
    server.mark_clean();
    server.set_field("age", 36i64).unwrap();
    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid,
            kind: OperationKind::Updated,
            dirty_counter: 5,
            version: 1,
            payload: ServerPayload::Delta(codec.serialize_delta(&server).unwrap()),
        }],
    };

    tx.merge_server_log(log, &codec).unwrap();
    assert_eq!(record.dirty_counter(), 5);
    assert_eq!(record.read().field("age"), Some(&Value::Int(36)));
    assert_eq!(record.read().field("name"), Some(&Value::from("ada")));

    let operation = tx.get_operation(rid).unwrap();
    assert_eq!(operation.kind(), OperationKind::Updated);
    assert_eq!(operation.peer_dirty_counter(), Some(5));
    assert!(!operation.needs_callbacks());
}

#[test]
fn test_server_operation_not_ahead_is_a_conflict() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let rid = Rid::new(PERSON, 0);
    let mut tx = session.begin().unwrap();
    dirty_update(&session, &mut tx, rid, 5);

    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid,
            kind: OperationKind::Updated,
            dirty_counter: 5,
            version: 1,
            payload: ServerPayload::None,
        }],
    };

    let err = tx.merge_server_log(log, &codec).unwrap_err();
    assert!(matches!(
        err,
        GraphTxError::MergeConflict {
            local: 5,
            remote: 5,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
}

#[test]
fn test_unknown_record_is_materialized_from_wire() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let friend = Rid::new(PERSON, 0);
    let rid = Rid::new(PERSON, 3);
    let mut tx = session.begin().unwrap();

    let mut server = server_copy(rid, &[("name", "remote".into())]);
    server.set_field("friend", friend).unwrap();
    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid,
            kind: OperationKind::Created,
            dirty_counter: 2,
            version: 0,
            payload: ServerPayload::Full(codec.to_wire(&server).unwrap()),
        }],
    };
    tx.merge_server_log(log, &codec).unwrap();

    let operation = tx.get_operation(rid).unwrap();
    assert_eq!(operation.kind(), OperationKind::Created);
    let record = operation.record().read();
    assert!(record.is_materialized());
    assert_eq!(record.owner(), RecordOwner::Session(session.id()));
    assert_eq!(record.dirty_counter(), 2);
    assert_eq!(record.field("friend"), Some(&Value::Link(friend)));
    assert_eq!(record.field("name"), Some(&Value::from("remote")));
}

#[test]
fn test_server_identity_changes_are_applied() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let mut tx = session.begin().unwrap();

    let person = new_person(&session, "ada");
    tx.add_operation(&person, OperationKind::Created).unwrap();
    let temporary = person.rid();
    let post = session.new_record(Some("Post"));
    post.write().set_field("author", temporary).unwrap();
    tx.add_operation(&post, OperationKind::Created).unwrap();

    let assigned = Rid::new(PERSON, 8);
    let log = ServerTransactionLog {
        identity_changes: vec![(temporary, assigned)],
        operations: vec![ServerOperation {
            rid: assigned,
            kind: OperationKind::Created,
            dirty_counter: 2,
            version: 0,
            payload: ServerPayload::None,
        }],
    };
    let bytes = log.to_bytes().unwrap();
    tx.merge_server_log(ServerTransactionLog::from_bytes(&bytes).unwrap(), &codec)
        .unwrap();

    assert_eq!(person.rid(), assigned);
    assert_eq!(tx.get_operation(temporary).unwrap().rid(), assigned);
    assert_eq!(tx.identity_mapping().get(&temporary), Some(&assigned));
    assert_eq!(post.read().field("author"), Some(&Value::Link(assigned)));
    assert_eq!(person.dirty_counter(), 2);
}

#[test]
fn test_server_delete_overrides_local_update() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let rid = Rid::new(PERSON, 0);
    let mut tx = session.begin().unwrap();
    dirty_update(&session, &mut tx, rid, 1);

    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid,
            kind: OperationKind::Deleted,
            dirty_counter: 2,
            version: 1,
            payload: ServerPayload::None,
        }],
    };
    tx.merge_server_log(log, &codec).unwrap();
    assert!(tx.is_deleted(rid));
}

#[test]
fn test_server_update_of_cached_record_uses_loaded_instance() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let rid = Rid::new(PERSON, 1);
    let cached = session.load_record(rid, Some("Person"), fields(&[("name", "ada".into())]), 1);
    let mut tx = session.begin().unwrap();

    let mut server = server_copy(rid, &[("name", "ada".into())]);
    server.mark_clean();
    server.set_field("name", "grace").unwrap();
    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid,
            kind: OperationKind::Updated,
            dirty_counter: 1,
            version: 1,
            payload: ServerPayload::Delta(codec.serialize_delta(&server).unwrap()),
        }],
    };
    tx.merge_server_log(log, &codec).unwrap();

    let operation = tx.get_operation(rid).unwrap();
    assert!(operation.record().ptr_eq(&cached));
    assert_eq!(cached.read().field("name"), Some(&Value::from("grace")));
    assert_eq!(cached.read().original_field("name"), Some(&Value::from("ada")));
}

#[test]
fn test_server_operation_without_content_for_unknown_record_fails() {
    let (_storage, session) = setup_session();
    let codec = BincodeCodec::new();
    let mut tx = session.begin().unwrap();

    let log = ServerTransactionLog {
        identity_changes: Vec::new(),
        operations: vec![ServerOperation {
            rid: Rid::new(PERSON, 99),
            kind: OperationKind::Updated,
            dirty_counter: 1,
            version: 1,
            payload: ServerPayload::None,
        }],
    };
    let err = tx.merge_server_log(log, &codec).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Consistency);
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
}
