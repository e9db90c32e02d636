//! In-process evaluation of aggregation pipelines.
//!
//! The document database loads a collection and hands the documents to
//! [`evaluate`] together with the parsed stages. Stages run strictly in the
//! order given; each consumes the output of the previous one.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::document::{get_path, remove_path, set_path, Document, Value};
use crate::error::{QuerySetError, Result};
use crate::filter;

/// Output of a pipeline run. `out` names the collection a trailing `$out`
/// stage asked to write to; the caller persists `docs` there.
#[derive(Debug, Default)]
pub struct Evaluated {
    pub docs: Vec<Document>,
    pub out: Option<String>,
}

pub fn evaluate(mut docs: Vec<Document>, stages: &[Document]) -> Result<Evaluated> {
    for (index, stage) in stages.iter().enumerate() {
        let (name, spec) = single_entry(stage)?;
        docs = match name {
            "$match" => {
                let f = spec_document(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if filter::matches(&doc, f)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => {
                let spec = spec_document(name, spec)?;
                docs.iter().map(|d| project(d, spec)).collect::<Result<_>>()?
            }
            "$addFields" | "$set" => {
                let spec = spec_document(name, spec)?;
                let mut out = Vec::with_capacity(docs.len());
                for mut doc in docs {
                    for (path, expr) in spec {
                        let value = eval(expr, &doc)?;
                        set_path(&mut doc, path, value);
                    }
                    out.push(doc);
                }
                out
            }
            "$limit" => {
                let n = count_operand(name, spec)?;
                docs.truncate(n);
                docs
            }
            "$skip" => {
                let n = count_operand(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$sort" => {
                let keys = sort_keys(spec_document(name, spec)?)?;
                docs.sort_by(|a, b| compare_by(a, b, &keys));
                docs
            }
            "$unwind" => unwind(docs, spec)?,
            "$group" => group(docs, spec_document(name, spec)?)?,
            "$count" => {
                let field = spec.as_str().filter(|s| !s.is_empty() && !s.starts_with('$')).ok_or_else(|| {
                    QuerySetError::Execution("$count needs a nonempty field name".to_string())
                })?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut counted = Document::new();
                    counted.insert(field.to_string(), Value::Int(docs.len() as i64));
                    vec![counted]
                }
            }
            "$out" => {
                if index + 1 != stages.len() {
                    return Err(QuerySetError::Execution(
                        "$out can only be the final stage in the pipeline".to_string(),
                    ));
                }
                let target = spec.as_str().filter(|s| !s.is_empty()).ok_or_else(|| {
                    QuerySetError::Execution("$out needs a collection name".to_string())
                })?;
                return Ok(Evaluated { docs, out: Some(target.to_string()) });
            }
            other => {
                return Err(QuerySetError::Execution(format!(
                    "Unrecognized pipeline stage name: '{other}'"
                )));
            }
        };
    }
    Ok(Evaluated { docs, out: None })
}

/// Applies a `find` style projection.
pub fn project(doc: &Document, spec: &Document) -> Result<Document> {
    let exclusion = spec
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .all(|(_, v)| matches!(v, Value::Int(0) | Value::Bool(false)) || (v.is_number() && !v.is_truthy()));
    let keep_id = spec.get("_id").is_none_or(Value::is_truthy);

    if exclusion && spec.keys().any(|k| k != "_id") || spec.keys().all(|k| k == "_id") {
        let mut out = doc.clone();
        for (path, _) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            remove_path(&mut out, path);
        }
        if !keep_id {
            out.shift_remove("_id");
        }
        return Ok(out);
    }

    let mut out = Document::new();
    if keep_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, rule) in spec {
        if path == "_id" {
            if !matches!(rule, Value::Int(_) | Value::Double(_) | Value::Bool(_)) {
                out.insert("_id".to_string(), eval(rule, doc)?);
            }
            continue;
        }
        match rule {
            Value::Int(_) | Value::Double(_) | Value::Bool(_) => {
                if !rule.is_truthy() {
                    return Err(QuerySetError::Execution(format!(
                        "Cannot do exclusion on field {path} in inclusion projection"
                    )));
                }
                if let Some(value) = get_path(doc, path) {
                    set_path(&mut out, path, value.clone());
                }
            }
            expr => {
                let value = eval(expr, doc)?;
                set_path(&mut out, path, value);
            }
        }
    }
    Ok(out)
}

fn single_entry(stage: &Document) -> Result<(&str, &Value)> {
    if stage.len() != 1 {
        return Err(QuerySetError::Execution(format!(
            "A pipeline stage specification object must contain exactly one field, found {}",
            stage.len()
        )));
    }
    stage
        .iter()
        .next()
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| QuerySetError::Execution("empty pipeline stage".to_string()))
}

fn spec_document<'a>(stage: &str, spec: &'a Value) -> Result<&'a Document> {
    spec.as_document()
        .ok_or_else(|| QuerySetError::Execution(format!("{stage} specification must be an object")))
}

fn count_operand(stage: &str, spec: &Value) -> Result<usize> {
    match spec {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        Value::Double(d) if *d >= 0.0 && d.fract() == 0.0 => Ok(*d as usize),
        _ => Err(QuerySetError::Execution(format!(
            "{stage} needs a non-negative whole number"
        ))),
    }
}

fn sort_keys(spec: &Document) -> Result<Vec<(String, bool)>> {
    spec.iter()
        .map(|(path, dir)| match dir.as_f64() {
            Some(d) if d == 1.0 => Ok((path.clone(), true)),
            Some(d) if d == -1.0 => Ok((path.clone(), false)),
            _ => Err(QuerySetError::Execution(format!(
                "$sort key ordering must be 1 (for ascending) or -1 (for descending): {path}"
            ))),
        })
        .collect()
}

fn compare_by(a: &Document, b: &Document, keys: &[(String, bool)]) -> Ordering {
    for (path, ascending) in keys {
        let x = get_path(a, path).unwrap_or(&Value::Null);
        let y = get_path(b, path).unwrap_or(&Value::Null);
        let ord = x.compare(y);
        if ord != Ordering::Equal {
            return if *ascending { ord } else { ord.reverse() };
        }
    }
    Ordering::Equal
}

fn field_reference(expr: &Value) -> Option<&str> {
    match expr {
        Value::String(s) if s.starts_with('$') && !s.starts_with("$$") => Some(&s[1..]),
        _ => None,
    }
}

fn unwind(docs: Vec<Document>, spec: &Value) -> Result<Vec<Document>> {
    let (path_expr, preserve) = match spec {
        Value::Object(options) => (
            options.get("path").cloned().unwrap_or(Value::Null),
            options
                .get("preserveNullAndEmptyArrays")
                .is_some_and(Value::is_truthy),
        ),
        other => (other.clone(), false),
    };
    let path = field_reference(&path_expr)
        .ok_or_else(|| QuerySetError::Execution("$unwind path must be a field path starting with '$'".to_string()))?
        .to_string();

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, &path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, &path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

enum Accumulator {
    Sum(Value),
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum(Value::Int(0)),
            "$avg" => Accumulator::Avg { total: 0.0, count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Value::Null),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            other => {
                return Err(QuerySetError::Execution(format!(
                    "unknown group operator '{other}'"
                )));
            }
        })
    }

    fn add(&mut self, value: Value) {
        match self {
            Accumulator::Sum(total) => {
                if value.is_number() {
                    *total = add_numbers(total, &value);
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(v) = value.as_f64() {
                    *total += v;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if !matches!(value, Value::Null)
                    && current.as_ref().is_none_or(|c| value.compare(c) == Ordering::Less)
                {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if !matches!(value, Value::Null)
                    && current.as_ref().is_none_or(|c| value.compare(c) == Ordering::Greater)
                {
                    *current = Some(value);
                }
            }
            Accumulator::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            Accumulator::Last(current) => *current = value,
            Accumulator::Push(items) => items.push(value),
            Accumulator::AddToSet(items) => {
                if !items.iter().any(|i| i.loosely_equals(&value)) {
                    items.push(value);
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Double(total / count as f64)
                }
            }
            Accumulator::Min(v) | Accumulator::Max(v) | Accumulator::First(v) => v.unwrap_or(Value::Null),
            Accumulator::Last(v) => v,
            Accumulator::Push(items) | Accumulator::AddToSet(items) => Value::Array(items),
        }
    }
}

fn group(docs: Vec<Document>, spec: &Document) -> Result<Vec<Document>> {
    let key_expr = spec.get("_id").ok_or_else(|| {
        QuerySetError::Execution("a group specification must include an _id".to_string())
    })?;
    let mut fields: Vec<(&str, &str, &Value)> = Vec::new();
    for (field, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, expr) = acc
            .as_document()
            .filter(|d| d.len() == 1)
            .and_then(|d| d.iter().next())
            .ok_or_else(|| {
                QuerySetError::Execution(format!("The field '{field}' must be an accumulator object"))
            })?;
        fields.push((field.as_str(), op.as_str(), expr));
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Value, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = eval(key_expr, doc)?;
        let slot = key.to_extended_json().to_string();
        let position = match index.get(&slot) {
            Some(p) => *p,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>>>()?;
                groups.push((key, accs));
                index.insert(slot, groups.len() - 1);
                groups.len() - 1
            }
        };
        for (i, (_, _, expr)) in fields.iter().enumerate() {
            let value = eval(expr, doc)?;
            groups[position].1[i].add(value);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Document::new();
            out.insert("_id".to_string(), key);
            for ((field, _, _), acc) in fields.iter().zip(accs) {
                out.insert(field.to_string(), acc.finish());
            }
            out
        })
        .collect())
}

fn add_numbers(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x
            .checked_add(*y)
            .map_or(Value::Double(*x as f64 + *y as f64), Value::Int),
        _ => Value::Double(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
    }
}

/// Evaluates an aggregation expression against a document.
pub fn eval(expr: &Value, doc: &Document) -> Result<Value> {
    if let Some(path) = field_reference(expr) {
        return Ok(get_path(doc, path).cloned().unwrap_or(Value::Null));
    }
    match expr {
        Value::Object(spec) if spec.len() == 1 && spec.keys().all(|k| k.starts_with('$')) => {
            let Some((op, arg)) = spec.iter().next() else {
                return Ok(Value::Null);
            };
            operator(op, arg, doc)
        }
        Value::Object(spec) => {
            let mut out = Document::new();
            for (k, v) in spec {
                out.insert(k.clone(), eval(v, doc)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|v| eval(v, doc)).collect::<Result<_>>()?,
        )),
        literal => Ok(literal.clone()),
    }
}

fn arguments(arg: &Value, doc: &Document) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) => items.iter().map(|v| eval(v, doc)).collect(),
        single => Ok(vec![eval(single, doc)?]),
    }
}

fn operator(op: &str, arg: &Value, doc: &Document) -> Result<Value> {
    if op == "$literal" {
        return Ok(arg.clone());
    }
    let args = arguments(arg, doc)?;
    let numbers = || -> Result<Vec<Value>> {
        if args.iter().all(|a| a.is_number() || matches!(a, Value::Null)) {
            Ok(args.clone())
        } else {
            Err(QuerySetError::Execution(format!("{op} only supports numeric types")))
        }
    };
    Ok(match op {
        "$concat" => {
            if args.iter().any(|a| matches!(a, Value::Null)) {
                return Ok(Value::Null);
            }
            let mut text = String::new();
            for a in &args {
                text.push_str(a.as_str().ok_or_else(|| {
                    QuerySetError::Execution(format!("$concat only supports strings, not {}", a.type_name()))
                })?);
            }
            Value::String(text)
        }
        "$add" => numbers()?.iter().fold(Value::Int(0), |acc, v| add_numbers(&acc, v)),
        "$multiply" => numbers()?.iter().fold(Value::Int(1), |acc, v| match (&acc, v) {
            (Value::Int(x), Value::Int(y)) => x.checked_mul(*y).map_or(Value::Double(*x as f64 * *y as f64), Value::Int),
            _ => Value::Double(acc.as_f64().unwrap_or(0.0) * v.as_f64().unwrap_or(0.0)),
        }),
        "$subtract" | "$divide" => {
            let n = numbers()?;
            if n.len() != 2 {
                return Err(QuerySetError::Execution(format!("{op} takes exactly 2 arguments")));
            }
            match (op, &n[0], &n[1]) {
                ("$subtract", Value::Int(x), Value::Int(y)) => x
                    .checked_sub(*y)
                    .map_or(Value::Double(*x as f64 - *y as f64), Value::Int),
                ("$subtract", x, y) => Value::Double(x.as_f64().unwrap_or(0.0) - y.as_f64().unwrap_or(0.0)),
                (_, _, y) if y.as_f64() == Some(0.0) => {
                    return Err(QuerySetError::Execution("can't $divide by zero".to_string()));
                }
                (_, x, y) => Value::Double(x.as_f64().unwrap_or(0.0) / y.as_f64().unwrap_or(0.0)),
            }
        }
        "$toUpper" | "$toLower" => {
            let text = args.first().and_then(Value::as_str).unwrap_or("");
            if op == "$toUpper" {
                Value::String(text.to_uppercase())
            } else {
                Value::String(text.to_lowercase())
            }
        }
        "$size" => match args.first() {
            Some(Value::Array(items)) => Value::Int(items.len() as i64),
            _ => return Err(QuerySetError::Execution("The argument to $size must be an array".to_string())),
        },
        "$ifNull" => args
            .iter()
            .find(|a| !matches!(a, Value::Null))
            .cloned()
            .unwrap_or(Value::Null),
        other => {
            return Err(QuerySetError::Execution(format!(
                "Unrecognized expression '{other}'"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{parse_document, Literals};

    fn docs(texts: &[&str]) -> Vec<Document> {
        texts.iter().map(|t| parse_document(t, Literals::ALL).unwrap()).collect()
    }

    #[test]
    fn project_inclusion_drops_id_on_request() {
        let input = docs(&[r#"{"_id": 1, "name": "a", "x": 2}"#]);
        let out = evaluate(input, &docs(&[r#"{"$project": {"_id": 0, "name": 1}}"#])).unwrap();
        assert_eq!(serde_json::to_string(&out.docs).unwrap(), r#"[{"name":"a"}]"#);
    }

    #[test]
    fn project_exclusion_keeps_the_rest() {
        let input = docs(&[r#"{"_id": 1, "name": "a", "x": 2}"#]);
        let out = evaluate(input, &docs(&[r#"{"$project": {"x": 0}}"#])).unwrap();
        assert_eq!(serde_json::to_string(&out.docs).unwrap(), r#"[{"_id":1,"name":"a"}]"#);
    }

    #[test]
    fn group_sort_and_count() {
        let input = docs(&[
            r#"{"state": "FL", "n": 1}"#,
            r#"{"state": "NH", "n": 4}"#,
            r#"{"state": "FL", "n": 2}"#,
        ]);
        let stages = docs(&[
            r#"{"$group": {"_id": "$state", "total": {"$sum": "$n"}, "seen": {"$sum": 1}}}"#,
            r#"{"$sort": {"total": -1}}"#,
        ]);
        let out = evaluate(input.clone(), &stages).unwrap();
        assert_eq!(
            serde_json::to_string(&out.docs).unwrap(),
            r#"[{"_id":"NH","total":4,"seen":1},{"_id":"FL","total":3,"seen":2}]"#
        );
        let counted = evaluate(input, &docs(&[r#"{"$count": "stations"}"#])).unwrap();
        assert_eq!(serde_json::to_string(&counted.docs).unwrap(), r#"[{"stations":3}]"#);
    }

    #[test]
    fn unwind_and_add_fields() {
        let input = docs(&[r#"{"name": "a", "tags": ["x", "y"]}"#, r#"{"name": "b", "tags": []}"#]);
        let stages = docs(&[
            r#"{"$unwind": "$tags"}"#,
            r#"{"$addFields": {"label": {"$concat": ["$name", "-", "$tags"]}}}"#,
            r#"{"$project": {"_id": 0, "label": 1}}"#,
        ]);
        let out = evaluate(input, &stages).unwrap();
        assert_eq!(
            serde_json::to_string(&out.docs).unwrap(),
            r#"[{"label":"a-x"},{"label":"a-y"}]"#
        );
    }

    #[test]
    fn out_must_be_last() {
        let stages = docs(&[r#"{"$out": "copy"}"#, r#"{"$limit": 1}"#]);
        assert!(evaluate(Vec::new(), &stages).is_err());
        let out = evaluate(Vec::new(), &docs(&[r#"{"$out": "copy"}"#])).unwrap();
        assert_eq!(out.out.as_deref(), Some("copy"));
    }

    #[test]
    fn unknown_stage_is_reported() {
        let err = evaluate(Vec::new(), &docs(&[r#"{"$teleport": {}}"#])).unwrap_err();
        assert!(err.to_string().contains("$teleport"));
    }
}
