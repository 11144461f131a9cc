//! # Changes
//!
//! Mutations produced by analysis workers and consumed by the bulk writer.

use crate::document::{encoded_len, Document};
use serde::{Deserialize, Serialize};

/// How a [`Change`] is applied to its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Update the first match, inserting a new document when nothing matches.
    UpsertOne,
    /// Update the first match only.
    UpdateOne,
    /// Update every match, inserting a new document when nothing matches.
    UpdateMany,
    DeleteOne,
    DeleteMany,
}

impl ChangeMode {
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeMode::DeleteOne | ChangeMode::DeleteMany)
    }
}

/// One mutation against one destination collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub selector: Document,
    pub payload: Option<Document>,
    pub mode: ChangeMode,
}

impl Change {
    pub fn upsert(selector: Document, payload: Document) -> Self {
        Self {
            selector,
            payload: Some(payload),
            mode: ChangeMode::UpsertOne,
        }
    }

    pub fn update(selector: Document, payload: Document) -> Self {
        Self {
            selector,
            payload: Some(payload),
            mode: ChangeMode::UpdateOne,
        }
    }

    pub fn update_many(selector: Document, payload: Document) -> Self {
        Self {
            selector,
            payload: Some(payload),
            mode: ChangeMode::UpdateMany,
        }
    }

    pub fn delete_one(selector: Document) -> Self {
        Self {
            selector,
            payload: None,
            mode: ChangeMode::DeleteOne,
        }
    }

    pub fn delete_many(selector: Document) -> Self {
        Self {
            selector,
            payload: None,
            mode: ChangeMode::DeleteMany,
        }
    }

    /// A change that cannot be applied safely: it has no selector, or it is an
    /// update without a payload. Inert changes are dropped, never sent.
    pub fn is_inert(&self) -> bool {
        self.selector.is_empty() || (!self.mode.is_removal() && self.payload.is_none())
    }

    /// Estimated serialized size: selector plus payload.
    pub fn encoded_len(&self) -> usize {
        encoded_len(&self.selector) + self.payload.as_ref().map_or(0, encoded_len)
    }
}

/// Pending changes grouped by destination collection.
///
/// Destinations keep the order they were first added in, and changes keep
/// their order within a destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    entries: Vec<(String, Vec<Change>)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A change set holding a single change.
    pub fn single(destination: impl Into<String>, change: Change) -> Self {
        let mut set = Self::new();
        set.push(destination, change);
        set
    }

    /// Append a change to `destination`.
    pub fn push(&mut self, destination: impl Into<String>, change: Change) {
        self.destination_mut(destination.into()).push(change);
    }

    /// Append several changes to `destination`.
    pub fn extend(&mut self, destination: impl Into<String>, changes: impl IntoIterator<Item = Change>) {
        self.destination_mut(destination.into()).extend(changes);
    }

    fn destination_mut(&mut self, destination: String) -> &mut Vec<Change> {
        let position = match self.entries.iter().position(|(name, _)| *name == destination) {
            Some(position) => position,
            None => {
                self.entries.push((destination, Vec::new()));
                self.entries.len() - 1
            }
        };
        &mut self.entries[position].1
    }

    pub fn get(&self, destination: &str) -> Option<&[Change]> {
        self.entries
            .iter()
            .find(|(name, _)| name == destination)
            .map(|(_, changes)| changes.as_slice())
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Total number of changes across all destinations.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, changes)| changes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Change])> {
        self.entries
            .iter()
            .map(|(name, changes)| (name.as_str(), changes.as_slice()))
    }
}

impl IntoIterator for ChangeSet {
    type Item = (String, Vec<Change>);
    type IntoIter = std::vec::IntoIter<(String, Vec<Change>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Change)> for ChangeSet {
    fn from_iter<T: IntoIterator<Item = (String, Change)>>(iter: T) -> Self {
        let mut set = Self::new();
        for (destination, change) in iter {
            set.push(destination, change);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;

    #[test]
    fn test_change_set_preserves_order() {
        let mut set = ChangeSet::new();
        set.push("host", Change::upsert(document! { "ip": "a" }, document! { "$set": { "x": 1 } }));
        set.push("uconn", Change::delete_one(document! { "src": "a" }));
        set.push("host", Change::upsert(document! { "ip": "b" }, document! { "$set": { "x": 2 } }));

        assert_eq!(set.destinations().collect::<Vec<_>>(), vec!["host", "uconn"]);
        assert_eq!(set.len(), 3);
        let hosts = set.get("host").unwrap();
        assert_eq!(hosts[0].selector, document! { "ip": "a" });
        assert_eq!(hosts[1].selector, document! { "ip": "b" });
    }

    #[test]
    fn test_inert_changes() {
        assert!(Change::delete_many(Document::new()).is_inert());
        assert!(Change::upsert(Document::new(), document! { "$set": { "a": 1 } }).is_inert());
        let no_payload = Change {
            selector: document! { "ip": "a" },
            payload: None,
            mode: ChangeMode::UpsertOne,
        };
        assert!(no_payload.is_inert());
        assert!(!Change::delete_one(document! { "ip": "a" }).is_inert());
    }

    #[test]
    fn test_encoded_len_sums_selector_and_payload() {
        let change = Change::upsert(document! { "a": 1 }, document! { "hello": "world" });
        assert_eq!(change.encoded_len(), 12 + 22);
        assert_eq!(Change::delete_one(document! { "a": 1 }).encoded_len(), 12);
    }
}
