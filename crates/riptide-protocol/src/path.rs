//! Hierarchical path model.
//!
//! A path is a `/`-separated sequence alternating collection segment and
//! document id. An odd number of segments names a collection, an even number
//! names a document. Sub-collections continue the path:
//! `users/u1/posts` is a collection nested under document `users/u1`.
//!
//! References come in two flavors, [`CollectionPath`] and [`DocumentPath`],
//! which share validation and support chaining in both directions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ids::DocumentId;

fn split_segments(raw: &str) -> EngineResult<Vec<String>> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Err(EngineError::malformed("empty path"));
    }
    let segments: Vec<String> = trimmed.split('/').map(str::to_owned).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(EngineError::malformed(format!(
            "path contains an empty segment: {raw:?}"
        )));
    }
    Ok(segments)
}

/// Path naming a collection (odd segment count).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionPath {
    segments: Vec<String>,
}

impl CollectionPath {
    /// Parse and validate a collection path.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let segments = split_segments(raw)?;
        if segments.len() % 2 == 0 {
            return Err(EngineError::malformed(format!(
                "{raw:?} has an even number of segments and names a document, not a collection"
            )));
        }
        Ok(Self { segments })
    }

    /// A top-level collection directly under the workspace root.
    pub fn root(name: impl Into<String>) -> EngineResult<Self> {
        Self::parse(&name.into())
    }

    /// Resolve a collection name against an optional parent document path,
    /// the shape every HTTP operation uses (`collection` + `parentPath?`).
    pub fn resolve(name: &str, parent: Option<&DocumentPath>) -> EngineResult<Self> {
        if name.contains('/') {
            return Err(EngineError::malformed(format!(
                "collection name must be a single segment: {name:?}"
            )));
        }
        match parent {
            Some(parent) => Ok(parent.collection(name)),
            None => Self::root(name),
        }
    }

    /// The document at `id` within this collection.
    pub fn doc(&self, id: impl AsRef<str>) -> DocumentPath {
        let mut segments = self.segments.clone();
        segments.push(id.as_ref().to_owned());
        DocumentPath { segments }
    }

    /// The collection's own name (its final segment).
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// The parent document, if this collection is nested.
    pub fn parent(&self) -> Option<DocumentPath> {
        if self.segments.len() == 1 {
            return None;
        }
        Some(DocumentPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
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
    type Error = EngineError;

    fn try_from(raw: String) -> EngineResult<Self> {
        Self::parse(&raw)
    }
}

impl From<CollectionPath> for String {
    fn from(path: CollectionPath) -> Self {
        path.to_string()
    }
}

/// Path naming a document (even segment count).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath {
    segments: Vec<String>,
}

impl DocumentPath {
    /// Parse and validate a document path.
    pub fn parse(raw: &str) -> EngineResult<Self> {
        let segments = split_segments(raw)?;
        if segments.len() % 2 != 0 {
            return Err(EngineError::malformed(format!(
                "{raw:?} has an odd number of segments and names a collection, not a document"
            )));
        }
        Ok(Self { segments })
    }

    /// A sub-collection nested under this document.
    pub fn collection(&self, name: impl AsRef<str>) -> CollectionPath {
        let mut segments = self.segments.clone();
        segments.push(name.as_ref().to_owned());
        CollectionPath { segments }
    }

    /// The collection containing this document.
    pub fn parent(&self) -> CollectionPath {
        CollectionPath {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        }
    }

    /// The document id, the final path segment.
    pub fn doc_id(&self) -> DocumentId {
        DocumentId::from_string(self.segments.last().cloned().unwrap_or_default())
    }

    /// The last collection segment on the path.
    pub fn collection_name(&self) -> &str {
        self.segments
            .get(self.segments.len() - 2)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = EngineError;

    fn try_from(raw: String) -> EngineResult<Self> {
        Self::parse(&raw)
    }
}

impl From<DocumentPath> for String {
    fn from(path: DocumentPath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_and_blank_segments() {
        assert!(CollectionPath::parse("").is_err());
        assert!(CollectionPath::parse("users//posts").is_err());
        assert!(DocumentPath::parse("/").is_err());
    }

    #[test]
    fn parity_is_enforced() {
        assert!(CollectionPath::parse("users/u1").is_err());
        assert!(DocumentPath::parse("users").is_err());
        assert!(CollectionPath::parse("users/u1/posts").is_ok());
        assert!(DocumentPath::parse("users/u1/posts/p1").is_ok());
    }

    #[test]
    fn chaining_round_trips() {
        let doc = CollectionPath::parse("users").unwrap().doc("u1");
        assert_eq!(doc.to_string(), "users/u1");
        let posts = doc.collection("posts");
        assert_eq!(posts.to_string(), "users/u1/posts");
        let post = posts.doc("p1");
        assert_eq!(post.parent(), posts);
        assert_eq!(post.doc_id().as_str(), "p1");
        assert_eq!(post.collection_name(), "posts");

        // Re-parsing a rendered path yields the same value.
        let reparsed = DocumentPath::parse(&post.to_string()).unwrap();
        assert_eq!(reparsed, post);
    }

    #[test]
    fn resolve_honors_parent() {
        let parent = DocumentPath::parse("users/u1").unwrap();
        let nested = CollectionPath::resolve("posts", Some(&parent)).unwrap();
        assert_eq!(nested.to_string(), "users/u1/posts");
        assert_eq!(nested.parent(), Some(parent));

        let top = CollectionPath::resolve("tasks", None).unwrap();
        assert_eq!(top.to_string(), "tasks");
        assert!(top.parent().is_none());

        assert!(CollectionPath::resolve("a/b", None).is_err());
    }

    #[test]
    fn leading_and_trailing_slashes_are_tolerated() {
        let path = DocumentPath::parse("/users/u1/").unwrap();
        assert_eq!(path.to_string(), "users/u1");
    }

    #[test]
    fn serde_round_trips_as_string() {
        let path = DocumentPath::parse("users/u1").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"users/u1\"");
        let back: DocumentPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);

        let bad: Result<DocumentPath, _> = serde_json::from_str("\"users\"");
        assert!(bad.is_err());
    }
}
