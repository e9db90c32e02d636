//! Versioned storage of named definitions.
//!
//! Every definition kind keeps two tables: one holding the current body per
//! name, and an append-only history with one row per upsert. History rows are
//! chained with BLAKE3: each digest covers the previous digest of the same
//! name followed by the new body, so a rewritten history is detectable.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::document::{Document, Value};
use crate::error::{QuerySetError, Result};
use crate::filter;
use crate::persist::Database;

/// A definition that can be kept in the versioned store.
pub trait Named: Serialize + DeserializeOwned {
    /// Table with the current body per name.
    const CURRENT: &'static str;
    /// Append-only table with every stored version.
    const HISTORY: &'static str;
    /// Used in error messages.
    const KIND: &'static str;

    fn name(&self) -> &str;

    /// Rejects a definition before anything is written.
    fn validate(&self) -> Result<()>;

    /// Called on every definition read back from storage.
    fn restore(self) -> Result<Self> {
        Ok(self)
    }
}

/// One stored version of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History<T> {
    pub name: String,
    pub version: i64,
    pub digest: String,
    pub created: DateTime<Utc>,
    pub document: T,
}

fn ensure_tables<T: Named>(connection: &Connection) -> Result<()> {
    connection.execute_batch(&format!(
        "
        create table if not exists {current} (
            Name text not null,
            Body text not null,
            Updated text not null,
            constraint referenceable_{current}_Name primary key (
                Name
            )
        );
        create table if not exists {history} (
            Name text not null,
            Version integer not null,
            Body text not null,
            Digest text not null,
            Created text not null,
            constraint unique_{history}_Version unique (
                Name,
                Version
            )
        );
        ",
        current = T::CURRENT,
        history = T::HISTORY,
    ))?;
    Ok(())
}

fn decode<T: Named>(body: &str) -> Result<T> {
    let item: T = serde_json::from_str(body)
        .map_err(|e| QuerySetError::Persistence(format!("corrupt {}: {e}", T::KIND)))?;
    item.restore()
}

fn chain(previous: Option<&str>, body: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(body.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Validates and stores `item`, replacing the current version and appending
/// to its history. Returns the version number just written.
pub fn upsert<T: Named>(db: &Database, item: &T) -> Result<i64> {
    item.validate()?;
    let body = serde_json::to_string(item)
        .map_err(|e| QuerySetError::Persistence(e.to_string()))?;
    let now = Utc::now();

    let mut session = db.session()?;
    let connection = session.connection_mut()?;
    ensure_tables::<T>(connection)?;
    let tx = connection.transaction()?;
    let latest: Option<(i64, String)> = tx
        .query_row(
            &format!(
                "
                select Version, Digest
                    from {history}
                    where Name = ?
                    order by Version desc
                    limit 1
                ",
                history = T::HISTORY
            ),
            params![item.name()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let version = latest.as_ref().map_or(1, |(v, _)| v + 1);
    let digest = chain(latest.as_ref().map(|(_, d)| d.as_str()), &body);

    tx.execute(
        &format!(
            "
            insert into {current} (
                Name,
                Body,
                Updated
            ) values (?1, ?2, ?3)
            on conflict (Name) do update set
                Body = excluded.Body,
                Updated = excluded.Updated
            ",
            current = T::CURRENT
        ),
        params![item.name(), &body, &now],
    )?;
    tx.execute(
        &format!(
            "
            insert into {history} (
                Name,
                Version,
                Body,
                Digest,
                Created
            ) values (?, ?, ?, ?, ?)
            ",
            history = T::HISTORY
        ),
        params![item.name(), version, &body, &digest, &now],
    )?;
    tx.commit()?;
    info!(kind = T::KIND, name = item.name(), version, "upserted");
    Ok(version)
}

pub fn get_by_name<T: Named>(db: &Database, name: &str) -> Result<T> {
    let session = db.session()?;
    let connection = session.connection()?;
    ensure_tables::<T>(connection)?;
    let body: Option<String> = connection
        .query_row(
            &format!("select Body from {} where Name = ?", T::CURRENT),
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    match body {
        Some(body) => decode(&body),
        None => Err(QuerySetError::NotFound(format!("{} {name}", T::KIND))),
    }
}

/// All current definitions ordered by name, limited to those whose stored
/// form satisfies `filter` when one is given.
pub fn get_all<T: Named>(db: &Database, filter: Option<&Document>) -> Result<Vec<T>> {
    let bodies: Vec<String> = {
        let session = db.session()?;
        let connection = session.connection()?;
        ensure_tables::<T>(connection)?;
        let mut statement = connection.prepare(&format!(
            "
            select Body
                from {}
                order by Name
            ",
            T::CURRENT
        ))?;
        statement
            .query_map([], |r| r.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    let mut items = Vec::with_capacity(bodies.len());
    for body in bodies {
        if let Some(filter) = filter {
            let json: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| QuerySetError::Persistence(format!("corrupt {}: {e}", T::KIND)))?;
            let stored = match Value::from_json(json) {
                Value::Object(doc) => doc,
                _ => Document::new(),
            };
            if !filter::matches(&stored, filter)? {
                continue;
            }
        }
        items.push(decode(&body)?);
    }
    debug!(kind = T::KIND, count = items.len(), "listed");
    Ok(items)
}

pub fn get_names<T: Named>(db: &Database, filter: Option<&Document>) -> Result<Vec<String>> {
    Ok(get_all::<T>(db, filter)?
        .iter()
        .map(|item| item.name().to_string())
        .collect())
}

fn history_rows<T: Named>(db: &Database, name: &str, latest_only: bool) -> Result<Vec<History<T>>> {
    let rows: Vec<(i64, String, String, DateTime<Utc>)> = {
        let session = db.session()?;
        let connection = session.connection()?;
        ensure_tables::<T>(connection)?;
        let mut statement = connection.prepare(&format!(
            "
            select Version, Body, Digest, Created
                from {}
                where Name = ?
                order by Version {}
            ",
            T::HISTORY,
            if latest_only { "desc limit 1" } else { "asc" }
        ))?;
        statement
            .query_map(params![name], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    rows.into_iter()
        .map(|(version, body, digest, created)| {
            Ok(History {
                name: name.to_string(),
                version,
                digest,
                created,
                document: decode(&body)?,
            })
        })
        .collect()
}

/// The most recent history record for `name`. History outlives deletion.
pub fn get_last_history_by_name<T: Named>(db: &Database, name: &str) -> Result<History<T>> {
    history_rows(db, name, true)?
        .pop()
        .ok_or_else(|| QuerySetError::NotFound(format!("history of {} {name}", T::KIND)))
}

/// Every stored version of `name`, oldest first.
pub fn get_history<T: Named>(db: &Database, name: &str) -> Result<Vec<History<T>>> {
    let rows = history_rows(db, name, false)?;
    if rows.is_empty() {
        return Err(QuerySetError::NotFound(format!("history of {} {name}", T::KIND)));
    }
    Ok(rows)
}

/// Recomputes the digest chain of `name`. True when every stored digest
/// matches the bodies it covers.
pub fn verify_history<T: Named>(db: &Database, name: &str) -> Result<bool> {
    let session = db.session()?;
    let connection = session.connection()?;
    ensure_tables::<T>(connection)?;
    let mut statement = connection.prepare(&format!(
        "
        select Body, Digest
            from {}
            where Name = ?
            order by Version
        ",
        T::HISTORY
    ))?;
    let rows = statement
        .query_map(params![name], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut previous: Option<String> = None;
    for (body, digest) in rows {
        if chain(previous.as_deref(), &body) != digest {
            return Ok(false);
        }
        previous = Some(digest);
    }
    Ok(true)
}

/// Removes the current definition. Its history is kept.
pub fn delete<T: Named>(db: &Database, name: &str) -> Result<()> {
    let session = db.session()?;
    let connection = session.connection()?;
    ensure_tables::<T>(connection)?;
    let removed = connection.execute(
        &format!("delete from {} where Name = ?", T::CURRENT),
        params![name],
    )?;
    if removed == 0 {
        return Err(QuerySetError::NotFound(format!("{} {name}", T::KIND)));
    }
    info!(kind = T::KIND, name, "deleted");
    Ok(())
}
