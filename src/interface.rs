//! Synchronous facade over the store and the execution engine.
//!
//! Every operation the HTTP layer exposes goes through a [`QueryInterface`].
//! Calls are blocking and self-contained; the server runs them on the
//! blocking pool.

use std::sync::Arc;

use crate::document::Document;
use crate::error::{QuerySetError, Result};
use crate::exec::{self, ExecResult};
use crate::persist::Database;
use crate::query::{self, Set};
use crate::regexdef::{self, RegexDef};
use crate::store::History;
use crate::substitute::Vars;
use crate::view::{ViewParams, ViewRunner};

/// Listing of definitions: either their names or the full records.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Names(Vec<String>),
    Full(Vec<T>),
}

pub struct QueryInterface {
    db: Arc<Database>,
    views: Option<Arc<dyn ViewRunner>>,
}

impl QueryInterface {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, views: None }
    }

    /// Enables execution on views.
    pub fn with_views(mut self, runner: Arc<dyn ViewRunner>) -> Self {
        self.views = Some(runner);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn list_sets(&self, names_only: bool, filter: Option<&Document>) -> Result<Listing<Set>> {
        Ok(if names_only {
            Listing::Names(query::get_names(&self.db, filter)?)
        } else {
            Listing::Full(query::get_sets(&self.db, filter)?)
        })
    }

    pub fn get_set(&self, name: &str) -> Result<Set> {
        query::get_by_name(&self.db, name)
    }

    pub fn upsert_set(&self, set: &Set) -> Result<i64> {
        query::upsert(&self.db, set)
    }

    pub fn delete_set(&self, name: &str) -> Result<()> {
        query::delete(&self.db, name)
    }

    pub fn set_history(&self, name: &str) -> Result<Vec<History<Set>>> {
        query::get_history(&self.db, name)
    }

    pub fn ensure_indexes(&self, name: &str) -> Result<()> {
        query::ensure_indexes(&self.db, name)
    }

    pub fn list_regexes(&self, names_only: bool, filter: Option<&Document>) -> Result<Listing<RegexDef>> {
        Ok(if names_only {
            Listing::Names(regexdef::get_names(&self.db, filter)?)
        } else {
            Listing::Full(regexdef::get_regexes(&self.db, filter)?)
        })
    }

    pub fn get_regex(&self, name: &str) -> Result<RegexDef> {
        regexdef::get_by_name(&self.db, name)
    }

    pub fn upsert_regex(&self, def: &RegexDef) -> Result<i64> {
        regexdef::upsert(&self.db, def)
    }

    pub fn delete_regex(&self, name: &str) -> Result<()> {
        regexdef::delete(&self.db, name)
    }

    pub fn exec_name(&self, name: &str, vars: &Vars) -> Result<ExecResult> {
        exec::exec_by_name(&self.db, name, vars)
    }

    pub fn exec_set(&self, set: &Set, vars: &Vars) -> Result<ExecResult> {
        exec::exec(&self.db, set, vars)
    }

    pub fn exec_name_on_view(&self, name: &str, view: &ViewParams, vars: &Vars) -> Result<ExecResult> {
        let set = query::get_by_name(&self.db, name)?;
        self.exec_set_on_view(&set, view, vars)
    }

    pub fn exec_set_on_view(&self, set: &Set, view: &ViewParams, vars: &Vars) -> Result<ExecResult> {
        let runner = self
            .views
            .as_deref()
            .ok_or_else(|| QuerySetError::Config("no view runner is configured".to_string()))?;
        exec::exec_on_view(&self.db, runner, set, view, vars)
    }
}
