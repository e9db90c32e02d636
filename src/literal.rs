//! Parsing of stage scripts written in database-shell syntax.
//!
//! Scripts are JSON, except that authors paste shell constructors such as
//! `ISODate("2013-01-16T00:00:00.000Z")` or `ObjectId("5660bc6e16908cae692e0593")`
//! straight into them, sometimes bare and sometimes inside a quoted string.
//! Each marker is swapped for a quoted placeholder, the text is parsed as
//! JSON, and the placeholders are then replaced by typed [`Value`]s.
//!
//! A marker must stand for a whole value: either bare or as the entire
//! content of a string. One embedded in longer string text is rejected.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::{Captures, Regex};

use crate::document::{Document, ObjectId, Value};
use crate::error::{QuerySetError, Result};

lazy_static::lazy_static! {
    // Keyword("argument"), optionally wrapped in the quotes of the enclosing
    // JSON string and with the argument quotes optionally escaped.
    static ref MARKER: Regex =
        Regex::new(r#""?\b(ISODate|ObjectId)\(\s*\\?["']([^"'\\]*)\\?["']\s*\)"?"#).unwrap();
}

/// Which literal markers a script may contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Literals {
    pub date: bool,
    pub object_id: bool,
}

impl Literals {
    pub const NONE: Literals = Literals { date: false, object_id: false };
    pub const ALL: Literals = Literals { date: true, object_id: true };

    fn allows(&self, keyword: &str) -> bool {
        match keyword {
            "ISODate" => self.date,
            "ObjectId" => self.object_id,
            _ => false,
        }
    }
}

struct Marker {
    keyword: String,
    argument: String,
}

/// Parses a script into a value tree, resolving the enabled literal markers.
/// Markers of a disabled kind are left untouched.
pub fn parse_script(text: &str, literals: Literals) -> Result<Value> {
    let mut markers: HashMap<String, Marker> = HashMap::new();
    let mut misplaced: Option<QuerySetError> = None;
    let rewritten = if literals == Literals::NONE {
        text.to_string()
    } else {
        let prefix = placeholder_prefix(text);
        MARKER
            .replace_all(text, |caps: &Captures| {
                let keyword = &caps[1];
                if !literals.allows(keyword) {
                    return caps[0].to_string();
                }
                let whole = &caps[0];
                let opens = whole.starts_with('"');
                let closes = whole.ends_with('"');
                let start = caps.get(0).map_or(0, |m| m.start());
                if opens != closes || (!opens && inside_string(&text[..start])) {
                    misplaced.get_or_insert_with(|| QuerySetError::Literal {
                        kind: if keyword == "ISODate" { "ISODate" } else { "ObjectId" },
                        argument: caps[2].to_string(),
                        reason: "a marker must be a whole value, not part of a string".to_string(),
                    });
                    return whole.to_string();
                }
                let token = format!("{prefix}{}", markers.len());
                markers.insert(
                    token.clone(),
                    Marker {
                        keyword: keyword.to_string(),
                        argument: caps[2].to_string(),
                    },
                );
                format!("\"{token}\"")
            })
            .into_owned()
    };
    if let Some(e) = misplaced {
        return Err(e);
    }

    let json: serde_json::Value = serde_json::from_str(&rewritten).map_err(QuerySetError::parse)?;
    let tree = Value::from_json(json);
    if markers.is_empty() {
        return Ok(tree);
    }

    let mut typed = HashMap::with_capacity(markers.len());
    for (token, marker) in markers {
        typed.insert(token, convert(&marker)?);
    }
    Ok(replace_placeholders(tree, &typed))
}

/// Parses a script that must be a single document, such as one pipeline stage.
pub fn parse_document(text: &str, literals: Literals) -> Result<Document> {
    match parse_script(text, literals)? {
        Value::Object(doc) => Ok(doc),
        other => Err(QuerySetError::Parse {
            message: format!("expected a document, found {}", other.type_name()),
            line: None,
            col: None,
        }),
    }
}

// Whether `prefix` ends inside an open JSON string.
fn inside_string(prefix: &str) -> bool {
    let mut open = false;
    let mut escaped = false;
    for c in prefix.chars() {
        match c {
            _ if escaped => escaped = false,
            '\\' if open => escaped = true,
            '"' => open = !open,
            _ => {}
        }
    }
    open
}

// A prefix that cannot collide with anything the author wrote.
fn placeholder_prefix(text: &str) -> String {
    let mut prefix = String::from("__literal_");
    while text.contains(&prefix) {
        prefix.push('_');
    }
    prefix
}

fn convert(marker: &Marker) -> Result<Value> {
    match marker.keyword.as_str() {
        "ISODate" => parse_iso_date(&marker.argument).map(Value::Timestamp),
        "ObjectId" => ObjectId::parse_str(&marker.argument)
            .map(Value::ObjectId)
            .map_err(|reason| QuerySetError::Literal {
                kind: "ObjectId",
                argument: marker.argument.clone(),
                reason,
            }),
        other => Err(QuerySetError::Literal {
            kind: "unknown",
            argument: marker.argument.clone(),
            reason: format!("unsupported literal {other}"),
        }),
    }
}

/// Parses the argument of an `ISODate(..)` marker. Offsets are honoured;
/// timestamps without one are taken as UTC.
pub fn parse_iso_date(argument: &str) -> Result<DateTime<Utc>> {
    let argument = argument.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(argument) {
        return Ok(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(argument, format) {
            return Ok(t.and_utc());
        }
    }
    if let Some(t) = NaiveDate::parse_from_str(argument, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(t.and_utc());
    }
    Err(QuerySetError::Literal {
        kind: "ISODate",
        argument: argument.to_string(),
        reason: "not an ISO-8601 timestamp".to_string(),
    })
}

fn replace_placeholders(value: Value, typed: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => match typed.get(&s) {
            Some(v) => v.clone(),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| replace_placeholders(v, typed))
                .collect(),
        ),
        Value::Object(doc) => Value::Object(
            doc.into_iter()
                .map(|(k, v)| (k, replace_placeholders(v, typed)))
                .collect(),
        ),
        other => other,
    }
}
