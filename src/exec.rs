//! Execution of query sets.
//!
//! A set runs all or nothing: variables are checked up front, the queries
//! then run in the declared order, and the first failure discards whatever
//! earlier queries returned.

use std::time::Instant;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::document::Document;
use crate::error::{QuerySetError, Result};
use crate::literal::{parse_document, Literals};
use crate::persist::Database;
use crate::query::{self, Query, QueryType, Set};
use crate::substitute::{self, Vars};
use crate::view::{ViewParams, ViewRunner};

/// Documents returned by one query of a set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDocs {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Docs")]
    pub docs: Vec<Document>,
}

/// The envelope a set execution produces.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecResult {
    Success(Vec<QueryDocs>),
    Failure(String),
}

impl ExecResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ExecResult::Failure(_))
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<R> {
    results: R,
    #[serde(default)]
    error: bool,
}

#[derive(Serialize, Deserialize)]
struct FailureBody<S> {
    error: S,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireResults {
    Docs(Vec<QueryDocs>),
    Failure(FailureBody<String>),
}

impl Serialize for ExecResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ExecResult::Success(results) => Envelope { results, error: false }.serialize(serializer),
            ExecResult::Failure(message) => Envelope {
                results: FailureBody { error: message.as_str() },
                error: true,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ExecResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = Envelope::<WireResults>::deserialize(deserializer)?;
        Ok(match envelope.results {
            WireResults::Docs(results) => ExecResult::Success(results),
            WireResults::Failure(body) => ExecResult::Failure(body.error),
        })
    }
}

/// Runs a set. Failures that happen while queries run come back inside
/// [`ExecResult::Failure`]; a disabled set, a missing variable or a closed
/// database are returned as errors before anything runs.
pub fn exec(db: &Database, set: &Set, vars: &Vars) -> Result<ExecResult> {
    let started = Instant::now();
    precheck(db, set, vars)?;

    let mut results = Vec::with_capacity(set.queries.len());
    for query in &set.queries {
        match run_query(db, set, query, vars) {
            Ok(docs) => {
                if query.ret {
                    results.push(QueryDocs { name: query.name.clone(), docs });
                }
            }
            Err(e) if e.is_execution_failure() => {
                let ms = started.elapsed().as_secs_f64() * 1000.0;
                warn!(set = %set.name, query = %query.name, ms, error = %e, "set failed");
                return Ok(ExecResult::Failure(e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(set = %set.name, queries = set.queries.len(), ms, "set complete");
    Ok(ExecResult::Success(results))
}

/// Everything that must hold before a set may touch the database.
fn precheck(db: &Database, set: &Set, vars: &Vars) -> Result<()> {
    if !db.is_open() {
        return Err(QuerySetError::StoreUnavailable(
            "the database connection is closed".to_string(),
        ));
    }
    set.validate()?;
    if !set.enabled {
        return Err(QuerySetError::SetDisabled(set.name.clone()));
    }
    substitute::validate(set, vars)
}

/// Loads the named set and runs it.
pub fn exec_by_name(db: &Database, name: &str, vars: &Vars) -> Result<ExecResult> {
    let set = query::get_by_name(db, name)?;
    exec(db, &set, vars)
}

/// Materialises a view and then runs the set over its output. The view
/// writes to the first query's collection unless another one is named.
pub fn exec_on_view(
    db: &Database,
    runner: &dyn ViewRunner,
    set: &Set,
    view: &ViewParams,
    vars: &Vars,
) -> Result<ExecResult> {
    precheck(db, set, vars)?;
    let results_collection = match &view.results_collection {
        Some(collection) if !collection.is_empty() => collection.clone(),
        _ => set
            .queries
            .first()
            .map(|q| q.collection.clone())
            .ok_or_else(|| QuerySetError::Validation(format!("set {} has no queries", set.name)))?,
    };
    let resolved = ViewParams {
        results_collection: Some(results_collection),
        ..view.clone()
    };
    runner.run(db, &resolved)?;
    info!(set = %set.name, view = %resolved.view_name, item = %resolved.item_key, "view materialised");
    exec(db, set, vars)
}

fn run_query(db: &Database, set: &Set, query: &Query, vars: &Vars) -> Result<Vec<Document>> {
    let literals = Literals::from(query);
    let mut stages = Vec::with_capacity(query.scripts.len());
    for script in &query.scripts {
        let text = substitute::substitute(script, &set.params, vars)?;
        stages.push(parse_document(&text, literals)?);
    }

    let docs = match query.query_type {
        QueryType::Pipeline => db.aggregate(&query.collection, &stages)?,
        QueryType::Find => {
            let filter = stages.first().cloned().unwrap_or_default();
            db.find(&query.collection, &filter, stages.get(1))?
        }
    };
    if query.ret && docs.is_empty() {
        return Err(QuerySetError::EmptyResult { query: query.name.clone() });
    }
    Ok(docs)
}
