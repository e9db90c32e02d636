#![allow(dead_code)]

use queryset::document::{Document, Value};
use queryset::literal::{parse_script, Literals};
use queryset::persist::{Database, PersistenceMode};
use queryset::query::{Query, QueryType, Set};

pub const STATIONS: &str = "test_query";

pub fn stations() -> Vec<Document> {
    let text = include_str!("../fixtures/stations.json");
    match parse_script(text, Literals::ALL).expect("fixture parses") {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::Object(doc) => doc,
                other => panic!("fixture entry is not a document: {other:?}"),
            })
            .collect(),
        other => panic!("fixture is not an array: {other:?}"),
    }
}

/// An in-memory database with the station fixture loaded.
pub fn seeded() -> Database {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    db.insert_many(STATIONS, stations()).expect("seed");
    db
}

pub fn pipeline(name: &str, scripts: &[&str]) -> Query {
    Query {
        name: name.to_string(),
        query_type: QueryType::Pipeline,
        collection: STATIONS.to_string(),
        ret: true,
        scripts: scripts.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn set(name: &str, queries: Vec<Query>) -> Set {
    Set {
        name: name.to_string(),
        enabled: true,
        queries,
        ..Default::default()
    }
}
