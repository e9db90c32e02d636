mod common;

use std::sync::Mutex;

use common::{pipeline, set};
use queryset::exec::{exec_on_view, ExecResult};
use queryset::literal::{parse_document, Literals};
use queryset::persist::{Database, PersistenceMode};
use queryset::query::Param;
use queryset::substitute::Vars;
use queryset::view::{ViewParams, ViewRunner};
use queryset::{QuerySetError, Result};

/// Writes one document per call, tagged with the item key.
#[derive(Default)]
struct RecordingView {
    seen: Mutex<Vec<ViewParams>>,
}

impl ViewRunner for RecordingView {
    fn run(&self, db: &Database, view: &ViewParams) -> Result<()> {
        self.seen.lock()?.push(view.clone());
        let collection = view.results_collection.clone().unwrap_or_default();
        let doc = parse_document(
            &format!(r#"{{"item": "{}", "view": "{}"}}"#, view.item_key, view.view_name),
            Literals::NONE,
        )?;
        db.insert(&collection, doc)?;
        Ok(())
    }
}

fn view(results_collection: Option<&str>) -> ViewParams {
    ViewParams {
        view_name: "user comments".into(),
        item_key: "80aa936a-f618-4234-a7be-df59a14cf8de".into(),
        results_collection: results_collection.map(str::to_string),
    }
}

#[test]
fn view_writes_to_the_first_collection_by_default() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let runner = RecordingView::default();
    let mut q = pipeline("Items", &[r#"{"$project": {"_id": 0, "item": 1}}"#]);
    q.collection = "view_results".into();
    let result = exec_on_view(&db, &runner, &set("OnView", vec![q]), &view(None), &Vars::new()).unwrap();

    assert_eq!(
        serde_json::to_string(&result).unwrap(),
        r#"{"results":[{"Name":"Items","Docs":[{"item":"80aa936a-f618-4234-a7be-df59a14cf8de"}]}],"error":false}"#
    );
    let seen = runner.seen.lock().unwrap();
    assert_eq!(seen[0].results_collection.as_deref(), Some("view_results"));
}

#[test]
fn named_results_collection_wins() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let runner = RecordingView::default();
    let mut q = pipeline("Items", &[r#"{"$match": {}}"#]);
    q.collection = "view_results".into();
    let result = exec_on_view(&db, &runner, &set("OnView", vec![q]), &view(Some("elsewhere")), &Vars::new()).unwrap();

    // The set reads a collection the view never wrote to.
    assert_eq!(result, ExecResult::Failure("No result".into()));
    assert_eq!(db.count("elsewhere", &Default::default()).unwrap(), 1);
}

#[test]
fn disabled_set_never_materialises_the_view() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let runner = RecordingView::default();
    let mut q = pipeline("Items", &[r#"{"$match": {}}"#]);
    q.collection = "view_results".into();
    let mut s = set("Off", vec![q]);
    s.enabled = false;

    let err = exec_on_view(&db, &runner, &s, &view(None), &Vars::new()).unwrap_err();
    assert!(matches!(err, QuerySetError::SetDisabled(_)));
    assert!(runner.seen.lock().unwrap().is_empty());
    assert_eq!(db.count("view_results", &Default::default()).unwrap(), 0);
}

#[test]
fn missing_variable_never_materialises_the_view() {
    let db = Database::new(PersistenceMode::InMemory).expect("db");
    let runner = RecordingView::default();
    let mut q = pipeline("Items", &[r##"{"$match": {"item": "#item#"}}"##]);
    q.collection = "view_results".into();
    let mut s = set("NeedsItem", vec![q]);
    s.params = vec![Param { name: "item".into(), ..Default::default() }];

    let err = exec_on_view(&db, &runner, &s, &view(None), &Vars::new()).unwrap_err();
    assert_eq!(err.to_string(), "Variable item not included with the call");
    assert!(runner.seen.lock().unwrap().is_empty());
    assert_eq!(db.count("view_results", &Default::default()).unwrap(), 0);
}
