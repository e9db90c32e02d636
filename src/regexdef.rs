//! Named regular expressions, stored with the same versioning as sets.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::error::{QuerySetError, Result};
use crate::persist::Database;
use crate::store::{self, History, Named};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegexDef {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub expr: String,
    #[serde(skip)]
    pub compiled: Option<Regex>,
}

impl RegexDef {
    pub fn new(name: impl Into<String>, expr: impl Into<String>) -> Self {
        RegexDef {
            name: name.into(),
            desc: String::new(),
            expr: expr.into(),
            compiled: None,
        }
    }

    pub fn is_match(&self, text: &str) -> Result<bool> {
        match &self.compiled {
            Some(re) => Ok(re.is_match(text)),
            None => Ok(compile(&self.expr)?.is_match(text)),
        }
    }
}

impl PartialEq for RegexDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.desc == other.desc && self.expr == other.expr
    }
}

fn compile(expr: &str) -> Result<Regex> {
    Regex::new(expr).map_err(|e| QuerySetError::Validation(format!("invalid expression: {e}")))
}

impl Named for RegexDef {
    const CURRENT: &'static str = "Regex";
    const HISTORY: &'static str = "Regex_History";
    const KIND: &'static str = "Regex";

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QuerySetError::Validation("a regex needs a name".to_string()));
        }
        if self.expr.is_empty() {
            return Err(QuerySetError::Validation(format!(
                "regex {} has no expression",
                self.name
            )));
        }
        compile(&self.expr).map(|_| ())
    }

    fn restore(mut self) -> Result<Self> {
        self.compiled = Some(
            Regex::new(&self.expr)
                .map_err(|e| QuerySetError::Persistence(format!("stored regex {} no longer compiles: {e}", self.name)))?,
        );
        Ok(self)
    }
}

pub fn upsert(db: &Database, def: &RegexDef) -> Result<i64> {
    store::upsert(db, def)
}

pub fn get_by_name(db: &Database, name: &str) -> Result<RegexDef> {
    store::get_by_name(db, name)
}

pub fn get_names(db: &Database, filter: Option<&Document>) -> Result<Vec<String>> {
    store::get_names::<RegexDef>(db, filter)
}

pub fn get_regexes(db: &Database, filter: Option<&Document>) -> Result<Vec<RegexDef>> {
    store::get_all(db, filter)
}

pub fn get_last_history_by_name(db: &Database, name: &str) -> Result<History<RegexDef>> {
    store::get_last_history_by_name(db, name)
}

pub fn delete(db: &Database, name: &str) -> Result<()> {
    store::delete::<RegexDef>(db, name)
}
