//! Query filter evaluation for the in-memory backend.

use crate::document::{compare_values, lookup_path, values_equal, Document};
use crate::error::StoreError;
use serde_json::Value;
use std::cmp::Ordering;

/// Whether `doc` satisfies every clause of `filter`.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        if !matches_clause(doc, key, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_clause(doc: &Document, key: &str, condition: &Value) -> Result<bool, StoreError> {
    match key {
        "$and" => {
            for clause in sub_filters(key, condition)? {
                if !matches(doc, clause)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$or" => {
            for clause in sub_filters(key, condition)? {
                if matches(doc, clause)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "$nor" => {
            for clause in sub_filters(key, condition)? {
                if matches(doc, clause)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        op if op.starts_with('$') => Err(StoreError::InvalidFilter(format!(
            "unknown top-level operator `{op}`"
        ))),
        path => {
            let found = lookup_path(doc, path);
            matches_condition(&found, condition)
        }
    }
}

fn sub_filters<'a>(op: &str, condition: &'a Value) -> Result<Vec<&'a Document>, StoreError> {
    let clauses = condition
        .as_array()
        .filter(|clauses| !clauses.is_empty())
        .ok_or_else(|| StoreError::InvalidFilter(format!("`{op}` needs a non-empty array")))?;
    clauses
        .iter()
        .map(|clause| {
            clause
                .as_object()
                .ok_or_else(|| StoreError::InvalidFilter(format!("`{op}` entries must be documents")))
        })
        .collect()
}

/// `{"$gt": 1, "$lt": 5}` style condition, as opposed to a literal sub-document.
pub(crate) fn is_operator_expression(map: &Document) -> bool {
    !map.is_empty() && map.keys().all(|key| key.starts_with('$'))
}

fn matches_condition(found: &[&Value], condition: &Value) -> Result<bool, StoreError> {
    match condition {
        Value::Object(ops) if is_operator_expression(ops) => matches_operators(found, ops),
        _ => Ok(equals_any(found, condition)),
    }
}

fn matches_operators(found: &[&Value], ops: &Document) -> Result<bool, StoreError> {
    for (op, operand) in ops {
        if !apply_operator(found, op, operand)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_operator(found: &[&Value], op: &str, operand: &Value) -> Result<bool, StoreError> {
    let outcome = match op {
        "$eq" => equals_any(found, operand),
        "$ne" => !equals_any(found, operand),
        "$gt" => compares(found, operand, |ord| ord == Ordering::Greater),
        "$gte" => compares(found, operand, |ord| ord != Ordering::Less),
        "$lt" => compares(found, operand, |ord| ord == Ordering::Less),
        "$lte" => compares(found, operand, |ord| ord != Ordering::Greater),
        "$in" => candidates(op, operand)?
            .iter()
            .any(|candidate| equals_any(found, candidate)),
        "$nin" => !candidates(op, operand)?
            .iter()
            .any(|candidate| equals_any(found, candidate)),
        "$exists" => truthy(operand) == !found.is_empty(),
        "$elemMatch" => {
            if !operand.is_object() {
                return Err(StoreError::InvalidFilter("`$elemMatch` needs a document".into()));
            }
            for element in found.iter().filter_map(|value| value.as_array()).flatten() {
                if element_matches(element, operand)? {
                    return Ok(true);
                }
            }
            false
        }
        other => {
            return Err(StoreError::InvalidFilter(format!("unknown operator `{other}`")));
        }
    };
    Ok(outcome)
}

/// Whether one array element satisfies `condition`; shared by `$elemMatch`
/// and `$pull`.
pub(crate) fn element_matches(element: &Value, condition: &Value) -> Result<bool, StoreError> {
    match (condition, element) {
        (Value::Object(ops), _) if is_operator_expression(ops) => matches_operators(&[element], ops),
        (Value::Object(filter), Value::Object(sub)) => matches(sub, filter),
        (Value::Object(_), _) => Ok(false),
        _ => Ok(values_equal(element, condition)),
    }
}

fn candidates<'a>(op: &str, operand: &'a Value) -> Result<&'a Vec<Value>, StoreError> {
    operand
        .as_array()
        .ok_or_else(|| StoreError::InvalidFilter(format!("`{op}` needs an array")))
}

/// Equality against a field, where an array field also matches when any of
/// its elements is equal, and `null` matches a missing field.
fn equals_any(found: &[&Value], target: &Value) -> bool {
    if target.is_null() && found.is_empty() {
        return true;
    }
    found.iter().any(|value| {
        values_equal(value, target)
            || value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(item, target)))
    })
}

fn compares(found: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    found
        .iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            other => vec![*other],
        })
        .any(|value| compare_values(value, operand).is_some_and(&accept))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

/// Field values an upsert copies from `filter` into the document it inserts:
/// plain equality clauses, `$eq` operators and the same inside `$and`.
pub(crate) fn equality_fields(filter: &Document) -> Vec<(String, Value)> {
    let mut fields = Vec::new();
    for (key, condition) in filter {
        if key == "$and" {
            if let Some(clauses) = condition.as_array() {
                for clause in clauses.iter().filter_map(Value::as_object) {
                    fields.extend(equality_fields(clause));
                }
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }
        match condition {
            Value::Object(ops) if is_operator_expression(ops) => {
                if let Some(value) = ops.get("$eq") {
                    fields.push((key.clone(), value.clone()));
                }
            }
            value => fields.push((key.clone(), value.clone())),
        }
    }
    fields
}
