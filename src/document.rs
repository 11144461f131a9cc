//! # Documents
//!
//! The document representation shared by every component, plus the wire-size
//! estimate the bulk writer batches against.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// An ordered, JSON-like document. Key order is preserved.
pub type Document = Map<String, Value>;

/// Build a [`Document`] with `serde_json::json!` object syntax.
///
/// ```
/// let selector = flowsink::document! { "ip": "10.0.0.1", "network_uuid": "ffff" };
/// assert_eq!(selector.len(), 2);
/// ```
#[macro_export]
macro_rules! document {
    ($($body:tt)*) => {
        match ::serde_json::json!({ $($body)* }) {
            ::serde_json::Value::Object(map) => map,
            _ => unreachable!("json! object literal always yields an object"),
        }
    };
}

/// Identifier of one rolling analysis window.
///
/// Every persisted statistic or history entry is stamped with the chunk that
/// produced it, which is what makes a window removable later on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk {}", self.0)
    }
}

impl From<ChunkId> for Value {
    fn from(chunk: ChunkId) -> Self {
        Value::from(chunk.0)
    }
}

/// Length of `doc` once BSON-encoded.
///
/// This is the figure the target store compares against its per-operation
/// ceiling. Callers that sum it over selector and payload still underestimate
/// the real operation size, since the operation envelope is not included.
pub fn encoded_len(doc: &Document) -> usize {
    4 + doc
        .iter()
        .map(|(key, value)| element_len(key.len(), value))
        .sum::<usize>()
        + 1
}

fn element_len(key_len: usize, value: &Value) -> usize {
    // type tag + cstring key + value
    1 + key_len + 1 + value_len(value)
}

fn value_len(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(number) => match number.as_i64() {
            Some(int) if i32::try_from(int).is_ok() => 4,
            _ => 8,
        },
        Value::String(text) => 4 + text.len() + 1,
        Value::Array(items) => {
            4 + items
                .iter()
                .enumerate()
                .map(|(index, item)| element_len(decimal_len(index), item))
                .sum::<usize>()
                + 1
        }
        Value::Object(map) => encoded_len(map),
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Values reachable from `doc` at the dotted `path`.
///
/// Arrays met along the path are traversed element-wise unless the next
/// segment is a numeric index, so `dat.cid` yields the `cid` of every element
/// of the `dat` history array.
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut found = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*head) {
            collect_path(value, rest, &mut found);
        }
    }
    found
}

fn collect_path<'a>(value: &'a Value, segments: &[&str], found: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        found.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_path(child, rest, found);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect_path(child, rest, found);
                }
            } else {
                for item in items.iter().filter(|item| item.is_object()) {
                    collect_path(item, segments, found);
                }
            }
        }
        _ => {}
    }
}

/// Value equality with numeric normalisation (`1 == 1.0`).
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => left == right,
    }
}

/// Ordering between two values of comparable type; `None` across types.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
