//! Filter documents: the `$match` / `find` predicate language.

use std::cmp::Ordering;

use regex::RegexBuilder;

use crate::document::{values_at, Document, Value};
use crate::error::{QuerySetError, Result};

/// Whether `doc` satisfies `filter`. All top-level clauses must hold.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let holds = match key.as_str() {
            "$and" => clauses(condition, key)?
                .iter()
                .try_fold(true, |acc, f| Ok::<_, QuerySetError>(acc && matches(doc, f)?))?,
            "$or" => {
                let mut any = false;
                for f in clauses(condition, key)? {
                    if matches(doc, f)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for f in clauses(condition, key)? {
                    if matches(doc, f)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            op if op.starts_with('$') => {
                return Err(QuerySetError::Execution(format!(
                    "unknown top level operator: {op}"
                )));
            }
            path => field_matches(&values_at(doc, path), condition)?,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(condition: &'a Value, op: &str) -> Result<Vec<&'a Document>> {
    match condition {
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_document().ok_or_else(|| {
                    QuerySetError::Execution(format!("{op} entries must be documents"))
                })
            })
            .collect(),
        _ => Err(QuerySetError::Execution(format!(
            "{op} must be a nonempty array"
        ))),
    }
}

fn is_operator_document(condition: &Value) -> Option<&Document> {
    match condition {
        Value::Object(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => Some(doc),
        _ => None,
    }
}

fn field_matches(candidates: &[&Value], condition: &Value) -> Result<bool> {
    match is_operator_document(condition) {
        Some(ops) => {
            for (op, operand) in ops {
                if op == "$options" {
                    continue;
                }
                if !operator_matches(candidates, op, operand, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        None => Ok(equals_any(candidates, condition)),
    }
}

// Equality against a field: a missing field equals null, and an array field
// matches when it equals the operand or one of its elements does.
fn equals_any(candidates: &[&Value], operand: &Value) -> bool {
    if candidates.is_empty() {
        return matches!(operand, Value::Null);
    }
    candidates.iter().any(|candidate| {
        candidate.loosely_equals(operand)
            || matches!(candidate, Value::Array(items) if items.iter().any(|i| i.loosely_equals(operand)))
    })
}

// Ordered comparison only within the same type bracket, like the shell.
fn compares_any(candidates: &[&Value], operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    let comparable = |v: &Value| {
        (v.is_number() && operand.is_number())
            || std::mem::discriminant(v) == std::mem::discriminant(operand)
    };
    candidates.iter().any(|candidate| {
        let direct = comparable(*candidate) && accept(candidate.compare(operand));
        direct
            || matches!(candidate, Value::Array(items) if items.iter().any(|i| comparable(i) && accept(i.compare(operand))))
    })
}

fn operator_matches(candidates: &[&Value], op: &str, operand: &Value, ops: &Document) -> Result<bool> {
    Ok(match op {
        "$eq" => equals_any(candidates, operand),
        "$ne" => !equals_any(candidates, operand),
        "$gt" => compares_any(candidates, operand, |o| o == Ordering::Greater),
        "$gte" => compares_any(candidates, operand, |o| o != Ordering::Less),
        "$lt" => compares_any(candidates, operand, |o| o == Ordering::Less),
        "$lte" => compares_any(candidates, operand, |o| o != Ordering::Greater),
        "$in" => in_list(candidates, operand, op)?,
        "$nin" => !in_list(candidates, operand, op)?,
        "$exists" => candidates.is_empty() != operand.is_truthy(),
        "$size" => {
            let wanted = operand.as_f64().ok_or_else(|| {
                QuerySetError::Execution("$size needs a number".to_string())
            })?;
            candidates
                .iter()
                .any(|c| matches!(c, Value::Array(items) if items.len() as f64 == wanted))
        }
        "$regex" => {
            let options = ops.get("$options").and_then(Value::as_str).unwrap_or("");
            regex_matches(candidates, operand, options)?
        }
        "$not" => match operand {
            Value::Object(_) => !field_matches(candidates, operand)?,
            Value::String(_) => !regex_matches(candidates, operand, "")?,
            _ => {
                return Err(QuerySetError::Execution(
                    "$not needs a regex or a document".to_string(),
                ));
            }
        },
        other => {
            return Err(QuerySetError::Execution(format!("unknown operator: {other}")));
        }
    })
}

fn in_list(candidates: &[&Value], operand: &Value, op: &str) -> Result<bool> {
    match operand {
        Value::Array(options) => Ok(options.iter().any(|o| equals_any(candidates, o))),
        _ => Err(QuerySetError::Execution(format!("{op} needs an array"))),
    }
}

fn regex_matches(candidates: &[&Value], pattern: &Value, options: &str) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| QuerySetError::Execution("$regex has to be a string".to_string()))?;
    let re = RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .build()
        .map_err(|e| QuerySetError::Execution(format!("invalid $regex: {e}")))?;
    let hit = |v: &Value| v.as_str().is_some_and(|s| re.is_match(s));
    Ok(candidates.iter().any(|c| {
        hit(*c) || matches!(c, Value::Array(items) if items.iter().any(hit))
    }))
}
