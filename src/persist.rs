// used for persistence
//
// Documents live in a single SQLite table, one row per document, with the
// body stored as extended JSON so that dates and object ids survive a round
// trip. Filters and pipelines are evaluated in process after the collection
// has been loaded; indexes are expression indexes over the JSON body.
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::document::{document_from_extended, document_to_extended, Document, ObjectId, Value};
use crate::error::{QuerySetError, Result};
use crate::pipeline;

/// Where the database keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

/// An index a query wants on its collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Index {
    pub key: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl Index {
    // The readable part is lossy, so a digest of the exact keys keeps
    // distinct indexes apart.
    fn name(&self, collection: &str) -> String {
        let readable: String = format!("Index_{}_{}", collection, self.key.join("_"))
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let mut hasher = blake3::Hasher::new();
        hasher.update(collection.as_bytes());
        for key in &self.key {
            hasher.update(b"\0");
            hasher.update(key.as_bytes());
        }
        hasher.update(&[0, u8::from(self.unique)]);
        let digest = hasher.finalize().to_hex();
        format!("{readable}_{}", &digest.as_str()[..12])
    }
}

pub struct Database {
    connection: Mutex<Option<Connection>>,
    mode: PersistenceMode,
}

/// Exclusive access to the open connection for the length of one operation.
pub struct Session<'db> {
    guard: MutexGuard<'db, Option<Connection>>,
}

impl Session<'_> {
    pub fn connection(&self) -> Result<&Connection> {
        self.guard.as_ref().ok_or_else(closed)
    }
    pub fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.guard.as_mut().ok_or_else(closed)
    }
}

fn closed() -> QuerySetError {
    QuerySetError::StoreUnavailable("the database connection is closed".to_string())
}

fn decode(body: &str) -> Result<Document> {
    document_from_extended(body).map_err(|e| QuerySetError::Persistence(format!("corrupt document: {e}")))
}

impl Database {
    pub fn new(mode: PersistenceMode) -> Result<Self> {
        let connection = match &mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        // The "STRICT" keyword is left out so external tools can still open the file
        connection.execute_batch(
            "
            create table if not exists Document (
                Document_Identity integer primary key autoincrement,
                Collection text not null,
                Body text not null
            );
            create index if not exists Document_by_Collection on Document (
                Collection,
                Document_Identity
            );
            ",
        )?;
        info!(?mode, "database opened");
        Ok(Database {
            connection: Mutex::new(Some(connection)),
            mode,
        })
    }

    pub fn mode(&self) -> &PersistenceMode {
        &self.mode
    }

    /// Closes the connection. Every later operation fails with
    /// [`QuerySetError::StoreUnavailable`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.connection.lock()?;
        if let Some(connection) = guard.take() {
            connection
                .close()
                .map_err(|(_, e)| QuerySetError::Persistence(e.to_string()))?;
            info!("database closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.connection.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn session(&self) -> Result<Session<'_>> {
        let guard = self.connection.lock()?;
        if guard.is_none() {
            return Err(closed());
        }
        Ok(Session { guard })
    }

    /// Stores a document, giving it a fresh `_id` first when it has none.
    /// Returns the `_id` of the stored document.
    pub fn insert(&self, collection: &str, doc: Document) -> Result<Value> {
        let session = self.session()?;
        insert_into(session.connection()?, collection, doc)
    }

    pub fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<Vec<Value>> {
        let mut session = self.session()?;
        let tx = session.connection_mut()?.transaction()?;
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(insert_into(&tx, collection, doc)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    fn load(&self, collection: &str) -> Result<Vec<Document>> {
        let session = self.session()?;
        load_from(session.connection()?, collection)
    }

    /// Documents of `collection` matching `filter`, in insertion order, with
    /// the optional projection applied.
    pub fn find(&self, collection: &str, filter: &Document, projection: Option<&Document>) -> Result<Vec<Document>> {
        let mut found = Vec::new();
        for doc in self.load(collection)? {
            if crate::filter::matches(&doc, filter)? {
                found.push(match projection {
                    Some(spec) => pipeline::project(&doc, spec)?,
                    None => doc,
                });
            }
        }
        debug!(collection, found = found.len(), "find");
        Ok(found)
    }

    /// Runs an aggregation pipeline over `collection`. A trailing `$out`
    /// replaces the target collection with the output and yields no documents.
    pub fn aggregate(&self, collection: &str, stages: &[Document]) -> Result<Vec<Document>> {
        let evaluated = pipeline::evaluate(self.load(collection)?, stages)?;
        debug!(collection, stages = stages.len(), produced = evaluated.docs.len(), "aggregate");
        match evaluated.out {
            None => Ok(evaluated.docs),
            Some(target) => {
                let mut session = self.session()?;
                let tx = session.connection_mut()?.transaction()?;
                tx.execute("delete from Document where Collection = ?", params![&target])?;
                for doc in evaluated.docs {
                    insert_into(&tx, &target, doc)?;
                }
                tx.commit()?;
                Ok(Vec::new())
            }
        }
    }

    pub fn count(&self, collection: &str, filter: &Document) -> Result<usize> {
        Ok(self.find(collection, filter, None)?.len())
    }

    /// Removes every document of a collection. Returns how many were removed.
    pub fn drop_collection(&self, collection: &str) -> Result<usize> {
        let session = self.session()?;
        let removed = session
            .connection()?
            .execute("delete from Document where Collection = ?", params![collection])?;
        Ok(removed)
    }

    pub fn collections(&self) -> Result<Vec<String>> {
        let session = self.session()?;
        let connection = session.connection()?;
        let mut statement = connection.prepare(
            "
            select distinct Collection
                from Document
                order by Collection
            ",
        )?;
        let names = statement
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Creates the index if it is not there yet. Unique indexes reject later
    /// inserts that repeat a key within the collection.
    pub fn ensure_index(&self, collection: &str, index: &Index) -> Result<()> {
        if index.key.is_empty() {
            return Err(QuerySetError::Validation(format!(
                "an index on {collection} needs at least one key"
            )));
        }
        let mut columns = Vec::with_capacity(index.key.len());
        for key in &index.key {
            if key.is_empty()
                || key.starts_with('$')
                || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(QuerySetError::Validation(format!("invalid index key \"{key}\"")));
            }
            columns.push(format!("json_extract(Body, '$.{key}')"));
        }
        let sql = format!(
            "
            create {unique}index if not exists {name} on Document (
                {columns}
            ) where Collection = '{collection}'
            ",
            unique = if index.unique { "unique " } else { "" },
            name = index.name(collection),
            columns = columns.join(",\n                "),
            collection = collection.replace('\'', "''"),
        );
        let session = self.session()?;
        session.connection()?.execute_batch(&sql)?;
        debug!(collection, keys = ?index.key, unique = index.unique, "index ensured");
        Ok(())
    }
}

fn insert_into(connection: &Connection, collection: &str, doc: Document) -> Result<Value> {
    let doc = if doc.contains_key("_id") {
        doc
    } else {
        let mut with_id = Document::with_capacity(doc.len() + 1);
        with_id.insert("_id".to_string(), Value::ObjectId(ObjectId::new()));
        with_id.extend(doc);
        with_id
    };
    let id = doc.get("_id").cloned().unwrap_or(Value::Null);
    connection.execute(
        "
        insert into Document (
            Collection,
            Body
        ) values (?, ?)
        ",
        params![collection, document_to_extended(&doc)],
    )?;
    Ok(id)
}

fn load_from(connection: &Connection, collection: &str) -> Result<Vec<Document>> {
    let mut statement = connection.prepare(
        "
        select Body
            from Document
            where Collection = ?
            order by Document_Identity
        ",
    )?;
    let bodies = statement
        .query_map(params![collection], |r| r.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    bodies.iter().map(|b| decode(b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{parse_document, Literals};

    fn doc(text: &str) -> Document {
        parse_document(text, Literals::ALL).unwrap()
    }

    #[test]
    fn insert_assigns_an_id_first() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let id = db.insert("c", doc(r#"{"a": 1}"#)).unwrap();
        assert!(matches!(id, Value::ObjectId(_)));
        let all = db.find("c", &Document::new(), None).unwrap();
        assert_eq!(all[0].keys().next().map(String::as_str), Some("_id"));
        assert_eq!(all[0]["_id"], id);
    }

    #[test]
    fn dates_survive_storage() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        db.insert("c", doc(r#"{"_id": 1, "at": ISODate("2013-03-01")}"#)).unwrap();
        let found = db
            .find("c", &doc(r#"{"at": {"$gte": ISODate("2013-01-01")}}"#), None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0]["at"], Value::Timestamp(_)));
    }

    #[test]
    fn out_replaces_the_target() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        db.insert_many("src", vec![doc(r#"{"_id": 1}"#), doc(r#"{"_id": 2}"#)]).unwrap();
        db.insert("dst", doc(r#"{"_id": 9}"#)).unwrap();
        let out = db.aggregate("src", &[doc(r#"{"$out": "dst"}"#)]).unwrap();
        assert!(out.is_empty());
        assert_eq!(db.count("dst", &Document::new()).unwrap(), 2);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        let index = Index { key: vec!["station_id".into()], unique: true };
        db.ensure_index("stations", &index).unwrap();
        db.ensure_index("stations", &index).unwrap();
        db.insert("stations", doc(r#"{"station_id": "42021"}"#)).unwrap();
        assert!(db.insert("stations", doc(r#"{"station_id": "42021"}"#)).is_err());
        db.insert("other", doc(r#"{"station_id": "42021"}"#)).unwrap();
    }

    #[test]
    fn similar_keys_get_their_own_indexes() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        db.ensure_index("c", &Index { key: vec!["a.b".into()], unique: false }).unwrap();
        db.ensure_index("c", &Index { key: vec!["a_b".into()], unique: true }).unwrap();
        let created: i64 = db
            .session()
            .unwrap()
            .connection()
            .unwrap()
            .query_row(
                "select count(*) from sqlite_master where type = 'index' and name like 'Index_c_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(created, 2);
        db.insert("c", doc(r#"{"a_b": 1}"#)).unwrap();
        assert!(db.insert("c", doc(r#"{"a_b": 1}"#)).is_err());
    }

    #[test]
    fn closed_database_is_unavailable() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(
            db.find("c", &Document::new(), None),
            Err(QuerySetError::StoreUnavailable(_))
        ));
    }
}
