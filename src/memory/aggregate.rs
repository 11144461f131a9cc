//! Aggregation stages supported by the in-memory backend.

use super::filter::matches;
use super::update::set_path;
use crate::document::{compare_values, lookup_path, Document};
use crate::error::StoreError;
use serde_json::Value;
use std::cmp::Ordering;

/// Run `stages` over `documents` in order.
pub fn run_pipeline(documents: Vec<Document>, stages: &[Document]) -> Result<Vec<Document>, StoreError> {
    stages.iter().try_fold(documents, |docs, stage| run_stage(docs, stage))
}

fn run_stage(docs: Vec<Document>, stage: &Document) -> Result<Vec<Document>, StoreError> {
    let mut entries = stage.iter();
    let (name, body) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(StoreError::InvalidPipeline(
                "each stage must hold exactly one operator".into(),
            ));
        }
    };

    match name.as_str() {
        "$match" => {
            let filter = as_document(name, body)?;
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, filter)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$project" => {
            let projection = as_document(name, body)?;
            docs.into_iter().map(|doc| project(&doc, projection)).collect()
        }
        "$unwind" => unwind(docs, body),
        "$sort" => {
            let keys = as_document(name, body)?;
            sort(docs, keys)
        }
        "$skip" => Ok(docs.into_iter().skip(as_count(name, body)?).collect()),
        "$limit" => Ok(docs.into_iter().take(as_count(name, body)?).collect()),
        "$count" => {
            let field = body
                .as_str()
                .filter(|field| !field.is_empty() && !field.starts_with('$'))
                .ok_or_else(|| StoreError::InvalidPipeline("`$count` needs a field name".into()))?;
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut counted = Document::new();
            counted.insert(field.to_string(), Value::from(docs.len() as u64));
            Ok(vec![counted])
        }
        other => Err(StoreError::InvalidPipeline(format!("unsupported stage `{other}`"))),
    }
}

fn as_document<'a>(stage: &str, body: &'a Value) -> Result<&'a Document, StoreError> {
    body.as_object()
        .ok_or_else(|| StoreError::InvalidPipeline(format!("`{stage}` needs a document")))
}

fn as_count(stage: &str, body: &Value) -> Result<usize, StoreError> {
    body.as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| StoreError::InvalidPipeline(format!("`{stage}` needs a non-negative integer")))
}

fn field_reference(value: &Value) -> Option<&str> {
    value.as_str().and_then(|text| text.strip_prefix('$'))
}

fn first_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    lookup_path(doc, path).into_iter().next()
}

fn project(doc: &Document, projection: &Document) -> Result<Document, StoreError> {
    let include_id = projection.get("_id").map_or(true, is_inclusion);
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && (is_inclusion(value) || field_reference(value).is_some()));

    if !inclusive {
        let mut out = doc.clone();
        for (key, value) in projection {
            if !is_inclusion(value) {
                out.remove(key.as_str());
            }
        }
        return Ok(out);
    }

    let mut out = Document::new();
    if include_id {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".into(), id.clone());
        }
    }
    for (key, value) in projection {
        if key == "_id" {
            continue;
        }
        let projected = match field_reference(value) {
            Some(source) => first_value(doc, source),
            None if is_inclusion(value) => first_value(doc, key),
            None => {
                return Err(StoreError::InvalidPipeline(format!(
                    "cannot exclude `{key}` in an inclusion projection"
                )));
            }
        };
        if let Some(projected) = projected {
            set_path(&mut out, key, projected.clone())
                .map_err(|err| StoreError::InvalidPipeline(err.to_string()))?;
        }
    }
    Ok(out)
}

fn is_inclusion(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

fn unwind(docs: Vec<Document>, body: &Value) -> Result<Vec<Document>, StoreError> {
    let (reference, preserve) = match body {
        Value::Object(options) => (
            options.get("path"),
            options
                .get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        other => (Some(other), false),
    };
    let path = reference
        .and_then(field_reference)
        .ok_or_else(|| StoreError::InvalidPipeline("`$unwind` needs a `$field` path".into()))?;

    let mut out = Vec::new();
    for doc in docs {
        match first_value(&doc, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, path, item)
                        .map_err(|err| StoreError::InvalidPipeline(err.to_string()))?;
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

fn sort(mut docs: Vec<Document>, keys: &Document) -> Result<Vec<Document>, StoreError> {
    let mut order = Vec::with_capacity(keys.len());
    for (field, direction) in keys {
        match direction.as_i64() {
            Some(1) => order.push((field.as_str(), false)),
            Some(-1) => order.push((field.as_str(), true)),
            _ => {
                return Err(StoreError::InvalidPipeline(format!(
                    "`$sort` direction for `{field}` must be 1 or -1"
                )));
            }
        }
    }

    docs.sort_by(|left, right| {
        for (field, descending) in &order {
            let ordering = match (first_value(left, field), first_value(right, field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
            };
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    Ok(docs)
}
