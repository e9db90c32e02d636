//! Queryset – versioned, parameterised query templates over an embedded document database.
//!
//! Operators describe analytical queries once, as a named *set*, and callers
//! execute them by name with a handful of variables instead of writing
//! database queries themselves:
//! * A [`query::Set`] is a named, enabled or disabled list of queries plus the
//!   [`query::Param`]s it accepts.
//! * A [`query::Query`] targets one collection and is either an aggregation
//!   pipeline or a `find` (filter and optional projection). Each of its scripts
//!   is written in database-shell syntax.
//! * Scripts may contain `#name#` tokens, replaced by the caller's variables or
//!   the param defaults ([`substitute`]), and shell literals such as
//!   `ISODate("2013-01-16")` or `ObjectId("…")`, turned into typed values by
//!   the [`literal`] parser.
//!
//! ## Modules
//! * [`document`] – The ordered, typed document tree and its JSON renderings.
//! * [`literal`] – Script parsing with `ISODate`/`ObjectId` markers.
//! * [`substitute`] – `#name#` variable substitution and the pre-run variable check.
//! * [`filter`] / [`pipeline`] – The `$match` predicate language and the pipeline stages.
//! * [`persist`] – SQLite persistence of document collections.
//! * [`store`] – Versioned storage of named definitions with a hash-chained history.
//! * [`query`] / [`regexdef`] – The two definition kinds kept in the store.
//! * [`exec`] – The all-or-nothing execution engine and its result envelope.
//! * [`view`] – The contract for materialising graph views before a run.
//! * [`interface`] / [`server`] – The synchronous facade and the HTTP routes over it.
//!
//! ## Result envelope
//! A run either returns every `return: true` query's documents,
//! `{"results":[{"Name":…,"Docs":[…]}],"error":false}`, or a single error,
//! `{"results":{"error":"…"},"error":true}`. A query that should return
//! documents but finds none fails the whole run with `No result`.
//!
//! ## Quick Start
//! ```
//! use queryset::persist::{Database, PersistenceMode};
//! use queryset::literal::{parse_document, Literals};
//! use queryset::{exec, query, substitute::Vars};
//!
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! db.insert("stations", parse_document(r#"{"station_id": "42021", "name": "Pasco"}"#, Literals::NONE).unwrap()).unwrap();
//! let set: query::Set = serde_json::from_str(r##"{
//!     "name": "station", "enabled": true,
//!     "params": [{"name": "id"}],
//!     "queries": [{"name": "s", "type": "pipeline", "collection": "stations", "return": true,
//!                  "scripts": ["{\"$match\": {\"station_id\": \"#id#\"}}", "{\"$project\": {\"_id\": 0, \"name\": 1}}"]}]
//! }"##).unwrap();
//! query::upsert(&db, &set).unwrap();
//! let mut vars = Vars::new();
//! vars.insert("id".into(), "42021".into());
//! let result = exec::exec_by_name(&db, "station", &vars).unwrap();
//! assert_eq!(
//!     serde_json::to_string(&result).unwrap(),
//!     r#"{"results":[{"Name":"s","Docs":[{"name":"Pasco"}]}],"error":false}"#
//! );
//! ```
//!
//! ## Configuration
//! The binary reads `queryset.toml` and `QUERYSET__*` environment variables
//! (see [`settings`]); `RUST_LOG` overrides the configured log filter.

pub mod document;
pub mod error;
pub mod exec;
pub mod filter;
pub mod interface;
pub mod literal;
pub mod persist;
pub mod pipeline;
pub mod query;
pub mod regexdef;
pub mod server;
pub mod settings;
pub mod store;
pub mod substitute;
pub mod view;

pub use error::{QuerySetError, Result};
