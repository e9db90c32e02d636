//! Query sets: named, parameterised sequences of database queries.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::document::Document;
use crate::error::{QuerySetError, Result};
use crate::literal::Literals;
use crate::persist::{Database, Index};
use crate::store::{self, History, Named};

/// A variable a set accepts at execution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Pipeline,
    Find,
}

/// One query of a set. `scripts` are the pipeline stages, or the filter and
/// optional projection of a `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(rename = "type", default)]
    pub query_type: QueryType,
    pub collection: String,
    #[serde(rename = "return", default)]
    pub ret: bool,
    #[serde(default)]
    pub has_date: bool,
    #[serde(default)]
    pub has_objectid: bool,
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Index>,
}

impl From<&Query> for Literals {
    fn from(query: &Query) -> Self {
        Literals {
            date: query.has_date,
            object_id: query.has_objectid,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Set {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub queries: Vec<Query>,
}

impl Set {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(QuerySetError::Validation("a set needs a name".to_string()));
        }
        if self.queries.is_empty() {
            return Err(QuerySetError::Validation(format!(
                "set {} has no queries",
                self.name
            )));
        }
        for (i, param) in self.params.iter().enumerate() {
            if param.name.trim().is_empty() {
                return Err(QuerySetError::Validation(format!(
                    "set {} has a param without a name",
                    self.name
                )));
            }
            if self.params[..i].iter().any(|p| p.name == param.name) {
                return Err(QuerySetError::Validation(format!(
                    "set {} declares param {} twice",
                    self.name, param.name
                )));
            }
        }
        for query in &self.queries {
            query.validate(&self.name)?;
        }
        Ok(())
    }
}

impl Query {
    fn validate(&self, set: &str) -> Result<()> {
        let fail = |reason: &str| {
            Err(QuerySetError::Validation(format!(
                "query {:?} of set {set} {reason}",
                self.name
            )))
        };
        if self.name.trim().is_empty() {
            return fail("needs a name");
        }
        if self.collection.trim().is_empty() {
            return fail("needs a collection");
        }
        if self.scripts.is_empty() {
            return fail("needs at least one script");
        }
        if self.query_type == QueryType::Find && self.scripts.len() > 2 {
            return fail("is a find and takes a filter and an optional projection only");
        }
        if self.indexes.iter().any(|i| i.key.is_empty()) {
            return fail("has an index without keys");
        }
        Ok(())
    }
}

impl Named for Set {
    const CURRENT: &'static str = "Query_Set";
    const HISTORY: &'static str = "Query_Set_History";
    const KIND: &'static str = "Set";

    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<()> {
        Set::validate(self)
    }
}

pub fn upsert(db: &Database, set: &Set) -> Result<i64> {
    store::upsert(db, set)
}

pub fn get_by_name(db: &Database, name: &str) -> Result<Set> {
    store::get_by_name(db, name)
}

pub fn get_names(db: &Database, filter: Option<&Document>) -> Result<Vec<String>> {
    store::get_names::<Set>(db, filter)
}

pub fn get_sets(db: &Database, filter: Option<&Document>) -> Result<Vec<Set>> {
    store::get_all(db, filter)
}

pub fn get_last_history_by_name(db: &Database, name: &str) -> Result<History<Set>> {
    store::get_last_history_by_name(db, name)
}

pub fn get_history(db: &Database, name: &str) -> Result<Vec<History<Set>>> {
    store::get_history(db, name)
}

pub fn delete(db: &Database, name: &str) -> Result<()> {
    store::delete::<Set>(db, name)
}

/// Creates the indexes every query of the named set declares.
pub fn ensure_indexes(db: &Database, name: &str) -> Result<()> {
    let set = get_by_name(db, name)?;
    let mut ensured = 0;
    for query in &set.queries {
        for index in &query.indexes {
            db.ensure_index(&query.collection, index)?;
            ensured += 1;
        }
    }
    info!(set = %set.name, ensured, "indexes ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> Set {
        serde_json::from_str(
            r##"{
                "name": "QTEST_basic",
                "enabled": true,
                "params": [{"name": "stationid"}],
                "queries": [{
                    "name": "Basic",
                    "type": "pipeline",
                    "collection": "test_query",
                    "return": true,
                    "scripts": ["{\"$match\": {\"station_id\": \"#stationid#\"}}"]
                }]
            }"##,
        )
        .unwrap()
    }

    #[test]
    fn wire_names_follow_the_document_shape() {
        let s = set();
        assert_eq!(s.queries[0].query_type, QueryType::Pipeline);
        assert!(s.queries[0].ret);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["queries"][0]["type"], "pipeline");
        assert_eq!(json["queries"][0]["return"], true);
    }

    #[test]
    fn validation_rejects_bad_sets() {
        assert!(set().validate().is_ok());

        let mut unnamed = set();
        unnamed.name.clear();
        assert!(unnamed.validate().is_err());

        let mut twice = set();
        twice.params.push(Param { name: "stationid".into(), ..Default::default() });
        assert!(twice.validate().is_err());

        let mut find = set();
        find.queries[0].query_type = QueryType::Find;
        find.queries[0].scripts = vec!["{}".into(), "{}".into(), "{}".into()];
        assert!(find.validate().is_err());
    }
}
