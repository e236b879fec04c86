//! Integration tests for submission, decisions and the record catalog.

use std::collections::HashSet;

use leadpool::config::DeletionPolicy;
use leadpool::engine::Engine;
use leadpool::error::Error;
use leadpool::event::EventKind;
use leadpool::model::*;
use serde_json::json;

fn test_engine() -> Engine {
    Engine::in_memory().expect("failed to create in-memory engine")
}

fn rows(n: usize) -> Vec<RowData> {
    (1..=n)
        .map(|i| {
            json!({"name": format!("Customer {i}"), "phone": format!("0900-{i:04}")})
                .as_object()
                .unwrap()
                .clone()
        })
        .collect()
}

fn seed(engine: &mut Engine, n: usize) -> DatabaseId {
    engine
        .create_database(NewDatabase::new("leads.xlsx", "admin"), rows(n))
        .unwrap()
        .id
}

fn staff(id: &str) -> StaffId {
    StaffId::new(id)
}

fn row_numbers(engine: &Engine, request_id: RequestId) -> Vec<u64> {
    engine
        .request_records(request_id)
        .unwrap()
        .iter()
        .map(|r| r.row_number)
        .collect()
}

fn assert_balanced(engine: &Engine, db: DatabaseId) -> StatusCounts {
    let counts = engine.status_counts(db).unwrap();
    assert!(counts.is_balanced(), "unbalanced counts: {counts:?}");
    counts
}

// ---------------------------------------------------------------------------
// Lifecycle: submit → approve / reject
// ---------------------------------------------------------------------------

#[test]
fn end_to_end_approve_then_insufficient() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 10);

    let request = engine.submit(&staff("alice"), db, 4).unwrap();
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.requested_count, 4);

    let counts = assert_balanced(&engine, db);
    assert_eq!(counts.requested, 4);
    assert_eq!(counts.available, 6);

    let approved = engine
        .decide(request.id, Decision::Approve, &staff("boss"))
        .unwrap();
    assert_eq!(approved.status, RequestStatus::Approved);
    assert_eq!(approved.decided_by, Some(Actor::Staff(staff("boss"))));
    assert!(approved.decided_at.is_some());

    for record in engine.request_records(request.id).unwrap() {
        assert_eq!(record.status, RecordStatus::Assigned);
        assert_eq!(record.assigned_to, Some(staff("alice")));
        assert_eq!(record.request_id, Some(request.id));
        assert!(record.assigned_at.is_some());
    }
    let counts = assert_balanced(&engine, db);
    assert_eq!(counts.assigned, 4);
    assert_eq!(counts.available, 6);

    let err = engine.submit(&staff("bob"), db, 8).unwrap_err();
    match err {
        Error::InsufficientAvailable {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, 8);
            assert_eq!(available, 6);
        }
        other => panic!("expected InsufficientAvailable, got {other:?}"),
    }
}

#[test]
fn reserve_takes_lowest_available_row_numbers() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 10);

    let first = engine.submit(&staff("alice"), db, 3).unwrap();
    assert_eq!(row_numbers(&engine, first.id), vec![1, 2, 3]);

    let second = engine.submit(&staff("bob"), db, 2).unwrap();
    assert_eq!(row_numbers(&engine, second.id), vec![4, 5]);

    // rejected rows go back to the front of the queue
    engine
        .decide(first.id, Decision::Reject, &staff("boss"))
        .unwrap();
    let third = engine.submit(&staff("carol"), db, 4).unwrap();
    assert_eq!(row_numbers(&engine, third.id), vec![1, 2, 3, 6]);
}

#[test]
fn reject_returns_records_to_pool() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 5);

    let request = engine.submit(&staff("alice"), db, 3).unwrap();
    let rejected = engine
        .decide(request.id, Decision::Reject, &staff("boss"))
        .unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    // the reserved set is remembered even after rejection
    assert_eq!(rejected.requested_count, 3);
    assert_eq!(engine.request_records(request.id).unwrap().len(), 3);

    for record in engine.request_records(request.id).unwrap() {
        assert_eq!(record.status, RecordStatus::Available);
        assert!(record.request_id.is_none());
        assert!(record.assigned_to.is_none());
    }
    assert_eq!(assert_balanced(&engine, db).available, 5);
}

#[test]
fn decisions_are_final() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 5);

    let request = engine.submit(&staff("alice"), db, 2).unwrap();
    engine
        .decide(request.id, Decision::Approve, &staff("boss"))
        .unwrap();

    for decision in [Decision::Approve, Decision::Reject] {
        let err = engine
            .decide(request.id, decision, &staff("boss"))
            .unwrap_err();
        assert!(
            matches!(
                err,
                Error::AlreadyDecided {
                    status: RequestStatus::Approved,
                    ..
                }
            ),
            "expected AlreadyDecided, got {err:?}"
        );
    }

    // the replayed reject did not release anything
    assert_eq!(assert_balanced(&engine, db).assigned, 2);
}

#[test]
fn failed_submission_creates_no_request() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 3);

    assert!(engine.submit(&staff("alice"), db, 4).is_err());
    assert!(
        engine
            .list_requests(&RequestFilter::default())
            .unwrap()
            .is_empty()
    );
    assert_eq!(assert_balanced(&engine, db).available, 3);
}

#[test]
fn submit_validates_input() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 3);

    assert!(matches!(
        engine.submit(&staff("alice"), db, 0),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        engine.submit(&staff("alice"), db, u64::MAX),
        Err(Error::InsufficientAvailable {
            requested: u64::MAX,
            available: 3,
            ..
        })
    ));
    assert!(
        engine
            .list_requests(&RequestFilter::default())
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        engine.submit(&staff("alice"), DatabaseId::new(), 1),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        engine.decide(RequestId::new(), Decision::Approve, &staff("boss")),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn concurrent_pending_requests_never_share_records() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 20);

    let mut seen = HashSet::new();
    for (i, count) in [3u64, 5, 1, 7].into_iter().enumerate() {
        let request = engine
            .submit(&staff(&format!("staff-{i}")), db, count)
            .unwrap();
        for record in engine.request_records(request.id).unwrap() {
            assert!(seen.insert(record.id), "record reserved twice");
            assert_eq!(record.request_id, Some(request.id));
        }
    }
    assert_eq!(assert_balanced(&engine, db).requested, 16);
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[test]
fn create_database_numbers_rows_in_upload_order() {
    let mut engine = test_engine();
    let database = engine
        .create_database(
            NewDatabase::new("march.csv", "admin").product("insurance"),
            rows(4),
        )
        .unwrap();
    assert_eq!(database.total_records, 4);
    assert_eq!(database.product_id.as_deref(), Some("insurance"));

    let records = engine
        .database_records(database.id, &RecordFilter::default())
        .unwrap();
    let numbers: Vec<u64> = records.iter().map(|r| r.row_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(records[2].row_data["name"], json!("Customer 3"));

    let page = engine
        .database_records(
            database.id,
            &RecordFilter {
                status: Some(RecordStatus::Available),
                offset: 1,
                limit: Some(2),
            },
        )
        .unwrap();
    assert_eq!(
        page.iter().map(|r| r.row_number).collect::<Vec<_>>(),
        vec![2, 3]
    );

    assert!(matches!(
        engine.create_database(NewDatabase::new("empty.csv", "admin"), Vec::new()),
        Err(Error::Validation(_))
    ));
}

#[test]
fn delete_database_cascades() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 5);
    let keep = seed(&mut engine, 2);
    let request = engine.submit(&staff("alice"), db, 2).unwrap();

    engine.delete_database(db, &staff("boss")).unwrap();

    assert!(matches!(engine.get_database(db), Err(Error::NotFound(_))));
    assert!(matches!(
        engine.get_request(request.id),
        Err(Error::NotFound(_))
    ));
    assert_eq!(engine.list_databases().unwrap().len(), 1);
    assert_eq!(engine.list_databases().unwrap()[0].id, keep);
}

#[test]
fn refuse_outstanding_policy_blocks_deletion_in_use() {
    let mut engine = test_engine();
    engine.deletion_policy = DeletionPolicy::RefuseOutstanding;
    let db = seed(&mut engine, 5);
    let request = engine.submit(&staff("alice"), db, 2).unwrap();

    let err = engine.delete_database(db, &staff("boss")).unwrap_err();
    assert!(matches!(
        err,
        Error::DatabaseInUse {
            requested: 2,
            assigned: 0,
            ..
        }
    ));

    engine
        .decide(request.id, Decision::Reject, &staff("boss"))
        .unwrap();
    engine.delete_database(db, &staff("boss")).unwrap();
}

// ---------------------------------------------------------------------------
// Admin record operations
// ---------------------------------------------------------------------------

#[test]
fn excluded_records_are_skipped_by_reservation() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 5);
    let records = engine
        .database_records(db, &RecordFilter::default())
        .unwrap();

    assert_eq!(
        engine
            .exclude_records(&[records[0].id, records[1].id])
            .unwrap(),
        2
    );
    let counts = assert_balanced(&engine, db);
    assert_eq!(counts.excluded, 2);
    assert_eq!(counts.available, 3);

    let request = engine.submit(&staff("alice"), db, 2).unwrap();
    assert_eq!(row_numbers(&engine, request.id), vec![3, 4]);

    // a requested record cannot be excluded
    let err = engine.exclude_records(&[records[2].id]).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: RecordStatus::Requested,
            to: RecordStatus::Excluded,
            ..
        }
    ));

    assert_eq!(engine.restore_records(&[records[0].id]).unwrap(), 1);
    assert_eq!(
        engine.get_record(records[0].id).unwrap().status,
        RecordStatus::Available
    );
}

#[test]
fn release_records_is_idempotent() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 4);
    let request = engine.submit(&staff("alice"), db, 2).unwrap();
    engine
        .decide(request.id, Decision::Approve, &staff("boss"))
        .unwrap();
    let ids: Vec<RecordId> = engine
        .request_records(request.id)
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();

    assert_eq!(engine.release_records(&ids).unwrap(), 2);
    assert_eq!(engine.release_records(&ids).unwrap(), 0);
    assert_eq!(assert_balanced(&engine, db).available, 4);

    assert!(matches!(
        engine.release_records(&[RecordId::new()]),
        Err(Error::NotFound(_))
    ));
}

// ---------------------------------------------------------------------------
// Reads and events
// ---------------------------------------------------------------------------

#[test]
fn list_requests_filters() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 10);
    let a = engine.submit(&staff("alice"), db, 1).unwrap();
    let b = engine.submit(&staff("bob"), db, 1).unwrap();
    engine.decide(b.id, Decision::Approve, &staff("boss")).unwrap();

    let alice = engine
        .list_requests(&RequestFilter {
            staff_id: Some(staff("alice")),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].id, a.id);

    let approved = engine
        .list_requests(&RequestFilter {
            status: Some(RequestStatus::Approved),
            database_id: Some(db),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].id, b.id);
}

#[test]
fn submit_and_decide_emit_events() {
    let mut engine = test_engine();
    let db = seed(&mut engine, 3);
    let request = engine.submit(&staff("alice"), db, 2).unwrap();
    engine
        .decide(request.id, Decision::Approve, &staff("boss"))
        .unwrap();

    let events = engine.get_events_since(0).unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::RequestSubmitted { request_id, requested_count: 2, .. } if *request_id == request.id
    )));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::RequestDecided { decision: Decision::Approve, decided_by: Actor::Staff(_), .. }
    )));
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::RecordsTransitioned {
            from: RecordStatus::Requested,
            to: RecordStatus::Assigned,
            record_ids,
            ..
        } if record_ids.len() == 2
    )));

    let last = events.last().unwrap().seq;
    assert!(engine.get_events_since(last).unwrap().is_empty());
}
