mod common;

use common::{pipeline, set};
use queryset::literal::{parse_document, Literals};
use queryset::persist::{Database, Index, PersistenceMode};
use queryset::query;
use queryset::store;
use queryset::QuerySetError;

fn basic(name: &str) -> queryset::query::Set {
    set(name, vec![pipeline("Basic", &[r#"{"$match": {"station_id" : "42021"}}"#])])
}

#[test]
fn upsert_then_read_back() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let s = basic("QTEST_basic");
    assert_eq!(query::upsert(&db, &s).unwrap(), 1);
    assert_eq!(query::get_by_name(&db, "QTEST_basic").unwrap(), s);
    let last = query::get_last_history_by_name(&db, "QTEST_basic").unwrap();
    assert_eq!(last.version, 1);
    assert_eq!(last.document, s);
}

#[test]
fn every_upsert_appends_a_version() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let mut s = basic("QTEST_basic");
    query::upsert(&db, &s).unwrap();
    s.desc = "second".into();
    assert_eq!(query::upsert(&db, &s).unwrap(), 2);
    s.desc = "third".into();
    assert_eq!(query::upsert(&db, &s).unwrap(), 3);

    let history = query::get_history(&db, "QTEST_basic").unwrap();
    let versions: Vec<i64> = history.iter().map(|h| h.version).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(query::get_by_name(&db, "QTEST_basic").unwrap().desc, "third");
    assert!(store::verify_history::<queryset::query::Set>(&db, "QTEST_basic").unwrap());
}

#[test]
fn names_are_listed_and_filtered() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    query::upsert(&db, &basic("QTEST_basic")).unwrap();
    query::upsert(&db, &basic("QTEST_basic2")).unwrap();
    let mut off = basic("other");
    off.enabled = false;
    query::upsert(&db, &off).unwrap();

    let names = query::get_names(&db, None).unwrap();
    assert_eq!(names.iter().filter(|n| n.starts_with("QTEST")).count(), 2);

    let enabled = parse_document(r#"{"enabled": true}"#, Literals::NONE).unwrap();
    assert_eq!(
        query::get_names(&db, Some(&enabled)).unwrap(),
        vec!["QTEST_basic".to_string(), "QTEST_basic2".to_string()]
    );
    assert_eq!(query::get_sets(&db, None).unwrap().len(), 3);
}

#[test]
fn delete_removes_current_but_keeps_history() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    query::upsert(&db, &basic("QTEST_basic")).unwrap();
    query::delete(&db, "QTEST_basic").unwrap();
    assert!(matches!(query::get_by_name(&db, "QTEST_basic"), Err(QuerySetError::NotFound(_))));
    assert!(matches!(query::delete(&db, "QTEST_basic"), Err(QuerySetError::NotFound(_))));
    assert_eq!(query::get_last_history_by_name(&db, "QTEST_basic").unwrap().version, 1);

    // Recreating continues the version sequence.
    assert_eq!(query::upsert(&db, &basic("QTEST_basic")).unwrap(), 2);
}

#[test]
fn invalid_sets_are_rejected() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let empty = set("QTEST_empty", vec![]);
    assert!(matches!(query::upsert(&db, &empty), Err(QuerySetError::Validation(_))));
    assert!(query::get_names(&db, None).unwrap().is_empty());
    assert!(matches!(
        query::get_last_history_by_name(&db, "QTEST_empty"),
        Err(QuerySetError::NotFound(_))
    ));
}

#[test]
fn closed_store_is_unavailable() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.close().unwrap();
    assert!(matches!(query::upsert(&db, &basic("x")), Err(QuerySetError::StoreUnavailable(_))));
    assert!(matches!(query::get_names(&db, None), Err(QuerySetError::StoreUnavailable(_))));
    assert!(matches!(query::delete(&db, "x"), Err(QuerySetError::StoreUnavailable(_))));
}

#[test]
fn file_mode_keeps_sets_across_reopen() {
    let path = "test_queryset_temp.db".to_string();
    let _ = std::fs::remove_file(&path);
    {
        let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
        query::upsert(&db, &basic("QTEST_durable")).unwrap();
        db.close().unwrap();
    }
    let db = Database::new(PersistenceMode::File(path.clone())).expect("db");
    assert_eq!(query::get_by_name(&db, "QTEST_durable").unwrap().name, "QTEST_durable");
    drop(db);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn indexes_are_ensured_for_the_set() {
    let db = common::seeded();
    let mut s = basic("QTEST_indexed");
    s.queries[0].indexes = vec![Index { key: vec!["station_id".into()], unique: true }];
    query::upsert(&db, &s).unwrap();
    query::ensure_indexes(&db, "QTEST_indexed").unwrap();

    let duplicate = parse_document(r#"{"station_id": "42021"}"#, Literals::NONE).unwrap();
    assert!(db.insert(common::STATIONS, duplicate).is_err());
    assert!(matches!(query::ensure_indexes(&db, "missing"), Err(QuerySetError::NotFound(_))));
}
