//! Entity and collection references.
//!
//! Paths alternate collection and identifier segments:
//! `notifications` is a collection, `notifications/n1` a document,
//! `courses/c1/lessons` a nested collection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

fn split(raw: &str) -> SyncResult<Vec<String>> {
    let segments: Vec<String> = raw
        .trim_matches('/')
        .split('/')
        .map(str::to_string)
        .collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SyncError::InvalidPath(format!("empty segment in '{raw}'")));
    }
    Ok(segments)
}

/// Reference to one addressable remote document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// Parse a slash-separated document path (even segment count).
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let segments = split(raw)?;
        if segments.len() % 2 != 0 {
            return Err(SyncError::InvalidPath(format!(
                "'{raw}' names a collection, not a document"
            )));
        }
        Ok(Self { segments })
    }

    /// Collection containing this document.
    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    /// Document identifier (last segment).
    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Nested collection under this document.
    pub fn collection(&self, name: &str) -> SyncResult<CollectionPath> {
        let mut segments = self.segments.clone();
        segments.extend(split(name)?);
        CollectionPath::from_segments(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for DocPath {
    type Error = SyncError;

    fn try_from(value: String) -> SyncResult<Self> {
        Self::parse(&value)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.to_string()
    }
}

/// Reference to a collection of documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    /// Parse a slash-separated collection path (odd segment count).
    pub fn parse(raw: &str) -> SyncResult<Self> {
        Self::from_segments(split(raw)?)
    }

    fn from_segments(segments: Vec<String>) -> SyncResult<Self> {
        if segments.len() % 2 != 1 {
            return Err(SyncError::InvalidPath(format!(
                "'{}' names a document, not a collection",
                segments.join("/")
            )));
        }
        Ok(Self { segments })
    }

    /// Document with the given identifier inside this collection.
    pub fn doc(&self, id: &str) -> SyncResult<DocPath> {
        if id.is_empty() || id.contains('/') {
            return Err(SyncError::InvalidPath(format!("bad document id '{id}'")));
        }
        let mut segments = self.segments.clone();
        segments.push(id.to_string());
        Ok(DocPath { segments })
    }

    /// Whether `doc` is a direct child of this collection.
    pub fn contains(&self, doc: &DocPath) -> bool {
        doc.segments.len() == self.segments.len() + 1
            && doc.segments[..self.segments.len()] == self.segments[..]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for CollectionPath {
    type Error = SyncError;

    fn try_from(value: String) -> SyncResult<Self> {
        Self::parse(&value)
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_doc_and_collection() {
        let doc = DocPath::parse("users/u1/notes/n1").unwrap();
        assert_eq!(doc.id(), "n1");
        assert_eq!(doc.parent().to_string(), "users/u1/notes");

        let col = CollectionPath::parse("/notifications/").unwrap();
        assert_eq!(col.to_string(), "notifications");
    }

    #[test]
    fn test_wrong_shape_rejected() {
        assert!(DocPath::parse("notifications").is_err());
        assert!(CollectionPath::parse("notifications/n1").is_err());
        assert!(DocPath::parse("a//b").is_err());
    }

    #[test]
    fn test_contains_direct_children_only() {
        let col = CollectionPath::parse("courses").unwrap();
        assert!(col.contains(&col.doc("c1").unwrap()));

        let nested = DocPath::parse("courses/c1/lessons/l1").unwrap();
        assert!(!col.contains(&nested));
        assert!(nested.parent().contains(&nested));
    }

    #[test]
    fn test_doc_rejects_slash_id() {
        let col = CollectionPath::parse("presence").unwrap();
        assert!(col.doc("a/b").is_err());
        assert!(col.doc("").is_err());
    }

    #[test]
    fn test_nested_collection() {
        let doc = DocPath::parse("courses/c1").unwrap();
        let lessons = doc.collection("lessons").unwrap();
        assert_eq!(lessons.doc("l1").unwrap().to_string(), "courses/c1/lessons/l1");
    }
}
