//! Update document evaluation for the in-memory backend.

use super::filter::{element_matches, equality_fields};
use crate::document::{compare_values, values_equal, Document};
use crate::error::StoreError;
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Apply `update` to `doc`, returning whether the document changed.
///
/// `update` is either made only of operators (`$set`, `$push` ...) or is a
/// replacement document; mixing the two is rejected. `inserting` enables
/// `$setOnInsert`.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) -> Result<bool, StoreError> {
    if update.is_empty() {
        return Err(StoreError::InvalidUpdate("update document is empty".into()));
    }
    let operators = update.keys().filter(|key| key.starts_with('$')).count();
    if operators == 0 {
        return Ok(replace(doc, update));
    }
    if operators != update.len() {
        return Err(StoreError::InvalidUpdate(
            "update mixes operators and replacement fields".into(),
        ));
    }

    let before = doc.clone();
    for (op, fields) in update {
        let fields = fields
            .as_object()
            .ok_or_else(|| StoreError::InvalidUpdate(format!("`{op}` needs a document")))?;
        for (path, operand) in fields {
            apply_operator(doc, op, path, operand, inserting)?;
        }
    }
    Ok(*doc != before)
}

/// Document an upsert starts from when nothing matched `selector`.
pub fn upsert_seed(selector: &Document) -> Result<Document, StoreError> {
    let mut seed = Document::new();
    for (path, value) in equality_fields(selector) {
        set_path(&mut seed, &path, value)?;
    }
    Ok(seed)
}

fn replace(doc: &mut Document, replacement: &Document) -> bool {
    let id = doc.get("_id").cloned();
    let mut next = Document::new();
    if let Some(id) = id {
        next.insert("_id".into(), id);
    }
    for (key, value) in replacement {
        if key != "_id" || !next.contains_key("_id") {
            next.insert(key.clone(), value.clone());
        }
    }
    let changed = *doc != next;
    *doc = next;
    changed
}

fn apply_operator(
    doc: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
    inserting: bool,
) -> Result<(), StoreError> {
    match op {
        "$set" => set_path(doc, path, operand.clone()),
        "$setOnInsert" => {
            if inserting {
                set_path(doc, path, operand.clone())?;
            }
            Ok(())
        }
        "$unset" => {
            remove_path(doc, path)?;
            Ok(())
        }
        "$inc" => increment(doc, path, operand),
        "$min" => keep_extreme(doc, path, operand, Ordering::Less),
        "$max" => keep_extreme(doc, path, operand, Ordering::Greater),
        "$push" => append(doc, path, operand, false),
        "$addToSet" => append(doc, path, operand, true),
        "$pull" => pull(doc, path, operand),
        other => Err(StoreError::InvalidUpdate(format!("unknown update operator `{other}`"))),
    }
}

/// Parent document of the last segment of `path`, plus that segment.
/// Missing parents are created when `create` is set, otherwise `None`.
fn locate<'d, 'p>(
    doc: &'d mut Document,
    path: &'p str,
    create: bool,
) -> Result<Option<(&'d mut Document, &'p str)>, StoreError> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    if leaf.is_empty() {
        return Err(StoreError::InvalidUpdate(format!("invalid field path `{path}`")));
    }

    let mut current = doc;
    for segment in parents.into_iter().flat_map(|parents| parents.split('.')) {
        let child = if create {
            current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Document::new()))
        } else {
            match current.get_mut(segment) {
                Some(child) => child,
                None => return Ok(None),
            }
        };
        match child {
            Value::Object(map) => current = map,
            _ => {
                return Err(StoreError::InvalidUpdate(format!(
                    "cannot traverse non-document field `{segment}` of `{path}`"
                )));
            }
        }
    }
    Ok(Some((current, leaf)))
}

pub(crate) fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    if let Some((parent, leaf)) = locate(doc, path, true)? {
        parent.insert(leaf.to_string(), value);
    }
    Ok(())
}

fn remove_path(doc: &mut Document, path: &str) -> Result<Option<Value>, StoreError> {
    Ok(locate(doc, path, false)?.and_then(|(parent, leaf)| parent.remove(leaf)))
}

fn increment(doc: &mut Document, path: &str, operand: &Value) -> Result<(), StoreError> {
    let Value::Number(delta) = operand else {
        return Err(StoreError::InvalidUpdate(format!("`$inc` on `{path}` needs a number")));
    };
    let Some((parent, leaf)) = locate(doc, path, true)? else {
        return Ok(());
    };
    let next = match parent.get(leaf) {
        None => Value::Number(delta.clone()),
        Some(Value::Number(current)) => add(current, delta),
        Some(_) => {
            return Err(StoreError::InvalidUpdate(format!(
                "cannot `$inc` non-numeric field `{path}`"
            )));
        }
    };
    parent.insert(leaf.to_string(), next);
    Ok(())
}

fn add(left: &Number, right: &Number) -> Value {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Value::from(sum);
        }
    }
    let sum = left.as_f64().unwrap_or(0.0) + right.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map_or(Value::Null, Value::Number)
}

fn keep_extreme(doc: &mut Document, path: &str, operand: &Value, keep: Ordering) -> Result<(), StoreError> {
    let Some((parent, leaf)) = locate(doc, path, true)? else {
        return Ok(());
    };
    let replace = match parent.get(leaf) {
        None => true,
        Some(current) => compare_values(operand, current) == Some(keep),
    };
    if replace {
        parent.insert(leaf.to_string(), operand.clone());
    }
    Ok(())
}

fn append(doc: &mut Document, path: &str, operand: &Value, unique: bool) -> Result<(), StoreError> {
    let items: Vec<Value> = match operand {
        Value::Object(spec) if spec.contains_key("$each") => match spec.get("$each") {
            Some(Value::Array(each)) => each.clone(),
            _ => {
                return Err(StoreError::InvalidUpdate(format!(
                    "`$each` on `{path}` needs an array"
                )));
            }
        },
        single => vec![single.clone()],
    };

    let Some((parent, leaf)) = locate(doc, path, true)? else {
        return Ok(());
    };
    let slot = parent
        .entry(leaf.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(target) = slot else {
        return Err(StoreError::InvalidUpdate(format!(
            "cannot append to non-array field `{path}`"
        )));
    };
    for item in items {
        if unique && target.iter().any(|existing| values_equal(existing, &item)) {
            continue;
        }
        target.push(item);
    }
    Ok(())
}

fn pull(doc: &mut Document, path: &str, condition: &Value) -> Result<(), StoreError> {
    let Some((parent, leaf)) = locate(doc, path, false)? else {
        return Ok(());
    };
    match parent.get_mut(leaf) {
        None => Ok(()),
        Some(Value::Array(items)) => {
            let mut kept = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                if !element_matches(&item, condition)? {
                    kept.push(item);
                }
            }
            *items = kept;
            Ok(())
        }
        Some(_) => Err(StoreError::InvalidUpdate(format!(
            "cannot `$pull` from non-array field `{path}`"
        ))),
    }
}
