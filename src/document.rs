//! The typed document tree shared by the literal parser, the document database
//! and the result envelope.
//!
//! A [`Document`] is an ordered map of field names to [`Value`]s. Unlike plain
//! JSON a value may also be a [`Value::Timestamp`] or a [`Value::ObjectId`],
//! which is what the `ISODate(..)` / `ObjectId(..)` literal markers turn into.
//!
//! Two JSON renderings exist:
//! * the *relaxed* form (the [`Serialize`] impl) is what callers see:
//!   timestamps become RFC 3339 strings and identifiers become hex strings;
//! * the *extended* form (`{"$date": ..}`, `{"$oid": ..}`) is what the
//!   database stores so typed values survive a round trip.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value as Json};

pub type Document = IndexMap<String, Value>;

// ------------- ObjectId -------------
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

lazy_static::lazy_static! {
    static ref OID_COUNTER: AtomicU32 = AtomicU32::new(
        Utc::now().timestamp_subsec_nanos() & 0x00ff_ffff
    );
}

impl ObjectId {
    /// Generates a fresh identifier: 4 bytes of unix seconds, the 4 byte
    /// process id and a 4 byte counter.
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let seconds = Utc::now().timestamp() as u32;
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        let pid = std::process::id();
        bytes[4..8].copy_from_slice(&pid.to_be_bytes());
        let count = OID_COUNTER.fetch_add(1, AtomicOrdering::SeqCst);
        bytes[8] = (count >> 24) as u8;
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        ObjectId(bytes)
    }
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }
    pub fn parse_str(s: &str) -> Result<Self, String> {
        if s.len() != 24 {
            return Err(format!("expected 24 hex characters, found {}", s.len()));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| e.to_string())?;
        Ok(ObjectId(bytes))
    }
    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ObjectId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_str(s)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId(\"{}\")", self.to_hex())
    }
}

// ------------- Value -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Object(Document),
    Timestamp(DateTime<Utc>),
    ObjectId(ObjectId),
}

impl Value {
    /// Converts plain JSON. Objects that look like extended JSON stay objects.
    pub fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => number(&n),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts JSON written by [`Value::to_extended_json`], restoring
    /// timestamps and object identifiers.
    pub fn from_extended_json(json: Json) -> Value {
        match json {
            Json::Array(items) => Value::Array(
                items.into_iter().map(Value::from_extended_json).collect(),
            ),
            Json::Object(map) => {
                if map.len() == 1 {
                    if let Some(Json::String(s)) = map.get("$date") {
                        if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                            return Value::Timestamp(t.with_timezone(&Utc));
                        }
                    }
                    if let Some(Json::String(s)) = map.get("$oid") {
                        if let Ok(oid) = ObjectId::parse_str(s) {
                            return Value::ObjectId(oid);
                        }
                    }
                }
                Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_extended_json(v)))
                        .collect(),
                )
            }
            other => Value::from_json(other),
        }
    }

    pub fn to_extended_json(&self) -> Json {
        match self {
            Value::Timestamp(t) => {
                let mut map = Map::new();
                map.insert("$date".into(), Json::String(rfc3339(t)));
                Json::Object(map)
            }
            Value::ObjectId(oid) => {
                let mut map = Map::new();
                map.insert("$oid".into(), Json::String(oid.to_hex()));
                Json::Object(map)
            }
            Value::Array(items) => Json::Array(items.iter().map(Value::to_extended_json).collect()),
            Value::Object(doc) => Json::Object(
                doc.iter()
                    .map(|(k, v)| (k.clone(), v.to_extended_json()))
                    .collect(),
            ),
            scalar => scalar.to_relaxed_json(),
        }
    }

    pub fn to_relaxed_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::Number((*i).into()),
            Value::Double(d) => Number::from_f64(*d).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_relaxed_json).collect()),
            Value::Object(doc) => Json::Object(
                doc.iter()
                    .map(|(k, v)| (k.clone(), v.to_relaxed_json()))
                    .collect(),
            ),
            Value::Timestamp(t) => Json::String(rfc3339(t)),
            Value::ObjectId(oid) => Json::String(oid.to_hex()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Timestamp(_) => "date",
            Value::ObjectId(_) => "objectId",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Object(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_))
    }

    /// Truthiness as used by `$project` specs (`1`, `true`) and `$exists`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Double(d) => *d != 0.0,
            _ => true,
        }
    }

    // canonical ordering between types, lowest first
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 1,
            Value::Int(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::ObjectId(_) => 7,
            Value::Bool(_) => 8,
            Value::Timestamp(_) => 9,
        }
    }

    /// Total order over values: first by type rank, then by value.
    /// Numbers compare across int and double.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_number() && b.is_number() => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Null, Value::Null) => Ordering::Equal,
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Equality used by filters: numerically equal ints and doubles match.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

fn number(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_relaxed_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Json::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}
impl From<ObjectId> for Value {
    fn from(oid: ObjectId) -> Self {
        Value::ObjectId(oid)
    }
}
impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc)
    }
}

// ------------- Paths -------------

/// Follows a dotted path through nested objects (and numeric array indexes).
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(inner) => inner.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Every value reachable by a dotted path, descending into arrays of
/// documents the way a filter does (`"tags.name"` over an array of tags).
pub fn values_at<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(first) = doc.get(parts[0]) {
        collect(first, &parts[1..], &mut out);
    }
    out
}

fn collect<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = parts.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(inner) => {
            if let Some(next) = inner.get(*head) {
                collect(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    collect(next, rest, out);
                }
            } else {
                for item in items {
                    if matches!(item, Value::Object(_)) {
                        collect(item, parts, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Sets a dotted path, creating intermediate documents and replacing
/// non-document values that are in the way.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => doc.shift_remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(Value::Object(inner)) => remove_path(inner, rest),
            _ => None,
        },
    }
}

/// Parses extended JSON text into a document.
pub fn document_from_extended(text: &str) -> serde_json::Result<Document> {
    let json: Json = serde_json::from_str(text)?;
    match Value::from_extended_json(json) {
        Value::Object(doc) => Ok(doc),
        other => Err(serde::de::Error::custom(format!(
            "expected a document, found {}",
            other.type_name()
        ))),
    }
}

pub fn document_to_extended(doc: &Document) -> String {
    Value::Object(doc.clone()).to_extended_json().to_string()
}
