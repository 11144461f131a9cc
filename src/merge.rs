//! # Document Merge
//!
//! Combines partial update documents computed independently (for example a
//! host's observed peers and its blacklist flag) into one document, so each
//! entity gets a single atomic write.
//!
//! Merge rules, applied left to right:
//! - a key seen for the first time is inserted as-is
//! - two nested documents under the same key are merged recursively
//! - two arrays of documents under the same key are concatenated
//! - any other collision is a [`MergeConflict`]; values are never overwritten

use crate::document::Document;
use serde_json::map::Entry;
use serde_json::Value;
use thiserror::Error;

/// Two documents define the same key with values that cannot be merged.
///
/// Callers are expected to build fragments whose keys only collide on nested
/// documents or arrays of documents, so this signals a bug in the caller.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot merge key `{key}`: existing value {existing} conflicts with {incoming}")]
pub struct MergeConflict {
    /// Dotted path of the colliding key.
    pub key: String,
    pub existing: Value,
    pub incoming: Value,
}

/// Deep-merge `docs` into one document.
pub fn merge_documents<I>(docs: I) -> Result<Document, MergeConflict>
where
    I: IntoIterator<Item = Document>,
{
    let mut merged = Document::new();
    for doc in docs {
        merge_at(&mut merged, doc, "")?;
    }
    Ok(merged)
}

/// Merge `incoming` into `target` in place. On conflict `target` is left
/// untouched.
pub fn merge_into(target: &mut Document, incoming: Document) -> Result<(), MergeConflict> {
    let mut merged = target.clone();
    merge_at(&mut merged, incoming, "")?;
    *target = merged;
    Ok(())
}

fn merge_at(target: &mut Document, incoming: Document, prefix: &str) -> Result<(), MergeConflict> {
    for (key, value) in incoming {
        let path = join_path(prefix, &key);
        let mut slot = match target.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                continue;
            }
            Entry::Occupied(occupied) => occupied,
        };

        match (slot.get_mut(), value) {
            (Value::Object(current), Value::Object(next)) => {
                merge_at(current, next, &path)?;
            }
            (Value::Array(current), Value::Array(next))
                if is_document_array(current.as_slice()) && is_document_array(&next) =>
            {
                current.extend(next);
            }
            (current, next) => {
                return Err(MergeConflict {
                    key: path,
                    existing: current.clone(),
                    incoming: next,
                });
            }
        }
    }
    Ok(())
}

fn is_document_array(items: &[Value]) -> bool {
    items.iter().all(Value::is_object)
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use serde_json::json;

    #[test]
    fn test_disjoint_top_level_operators() {
        let blacklist = document! { "$set": { "blacklisted": true } };
        let history = document! { "$push": { "dat": { "$each": [{ "ips": ["1.2.3.4"] }] } } };

        let merged = merge_documents([blacklist.clone(), history.clone()]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["$set"], blacklist["$set"]);
        assert_eq!(merged["$push"], history["$push"]);
    }

    #[test]
    fn test_nested_documents_are_unioned() {
        let main = document! { "$set": { "cid": 4 }, "$push": { "dat": { "cid": 4 } } };
        let flag = document! { "$set": { "blacklisted": false } };

        let merged = merge_documents([main, flag]).unwrap();
        assert_eq!(merged["$set"], json!({ "cid": 4, "blacklisted": false }));
        assert_eq!(merged["$push"], json!({ "dat": { "cid": 4 } }));
    }

    #[test]
    fn test_document_arrays_are_concatenated_in_order() {
        let first = document! { "$push": { "dat": { "$each": [{ "cid": 1 }] } } };
        let second = document! { "$push": { "dat": { "$each": [{ "cid": 2 }, { "cid": 3 }] } } };

        let merged = merge_documents([first, second]).unwrap();
        assert_eq!(
            merged["$push"]["dat"]["$each"],
            json!([{ "cid": 1 }, { "cid": 2 }, { "cid": 3 }])
        );
    }

    #[test]
    fn test_scalar_collision_is_a_conflict() {
        let left = document! { "$set": { "blacklisted": true } };
        let right = document! { "$set": { "blacklisted": false } };

        let err = merge_documents([left, right]).unwrap_err();
        assert_eq!(err.key, "$set.blacklisted");
        assert_eq!(err.existing, json!(true));
        assert_eq!(err.incoming, json!(false));
    }

    #[test]
    fn test_type_mismatch_is_a_conflict() {
        let err = merge_documents([document! { "ip": { "v4": "a" } }, document! { "ip": "a" }])
            .unwrap_err();
        assert_eq!(err.key, "ip");

        // arrays of scalars are not arrays of documents
        let err = merge_documents([document! { "ips": ["a"] }, document! { "ips": ["b"] }])
            .unwrap_err();
        assert_eq!(err.key, "ips");
    }

    #[test]
    fn test_conflict_leaves_target_untouched() {
        let mut target = document! { "k": 1 };
        let err = merge_into(&mut target, document! { "$set": { "b": 2 }, "k": 2 }).unwrap_err();
        assert_eq!(err.key, "k");
        assert_eq!(target, document! { "k": 1 });

        merge_into(&mut target, document! { "$set": { "b": 2 } }).unwrap();
        assert_eq!(target, document! { "k": 1, "$set": { "b": 2 } });
    }

    #[test]
    fn test_empty_inputs() {
        assert!(merge_documents(Vec::new()).unwrap().is_empty());
        let only = document! { "host": "example.com" };
        assert_eq!(merge_documents([only.clone()]).unwrap(), only);
    }
}
