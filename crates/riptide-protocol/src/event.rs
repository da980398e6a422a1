//! Append-only event records and the publications derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{EngineError, EngineResult};
use crate::ids::{DocumentId, EventId, Version, WorkspaceId};
use crate::path::DocumentPath;

/// The kind of write an event captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Set,
    Delete,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Set => "SET",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "SET" => Ok(Self::Set),
            "DELETE" => Ok(Self::Delete),
            other => Err(EngineError::Storage(format!(
                "unknown event type {other:?}"
            ))),
        }
    }
}

/// An append-only record of one mutation. `version` is the auto-assigned
/// row id of the event table and the authoritative version source for the
/// workspace: the owning document's `version` equals it after the event is
/// applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub version: Version,
    pub id: EventId,
    pub doc_id: DocumentId,
    pub workspace_id: WorkspaceId,
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// The document path embedded in the event payload. Payloads always
    /// carry the path so a cache can be rebuilt from the event stream alone.
    pub fn doc_path(&self) -> EngineResult<DocumentPath> {
        let raw = self
            .payload
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Storage("event payload is missing its path".into()))?;
        DocumentPath::parse(raw)
    }

    /// The full post-state data for INSERT/SET events.
    pub fn data(&self) -> Option<&Value> {
        self.payload.get("data")
    }

    /// The merge patch for UPDATE events.
    pub fn patch(&self) -> Option<&Value> {
        self.payload.get("patch")
    }
}

/// Payload for an INSERT or SET event.
pub fn full_write_payload(path: &DocumentPath, data: &Value) -> Value {
    json!({ "path": path.to_string(), "data": data })
}

/// Payload for an UPDATE event; the patch is the caller's merge patch, not
/// the post-state.
pub fn patch_payload(path: &DocumentPath, patch: &Value) -> Value {
    json!({ "path": path.to_string(), "patch": patch })
}

/// Payload for a DELETE event.
pub fn delete_payload(path: &DocumentPath) -> Value {
    json!({ "path": path.to_string() })
}

/// What a publication announces about a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A message broadcast on broker channels after a committed mutation.
///
/// Non-delete publications carry the full post-state `data` (never the
/// patch); `version` equals the backing event's authoritative version, which
/// is what subscribers dedup on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: DocumentId,
    pub path: DocumentPath,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_uppercase() {
        for kind in [
            EventType::Insert,
            EventType::Update,
            EventType::Set,
            EventType::Delete,
        ] {
            assert_eq!(EventType::parse(kind.as_str()).unwrap(), kind);
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{}\"", kind.as_str()));
        }
        assert!(EventType::parse("UPSERT").is_err());
    }

    #[test]
    fn payloads_embed_the_path() {
        let path = DocumentPath::parse("users/u1/posts/p1").unwrap();
        let event = EventRecord {
            version: 9,
            id: EventId::new_uuid(),
            doc_id: path.doc_id(),
            workspace_id: WorkspaceId::default_workspace(),
            event_type: EventType::Update,
            payload: patch_payload(&path, &json!({"title": "t"})),
            created_at: Utc::now(),
        };
        assert_eq!(event.doc_path().unwrap(), path);
        assert_eq!(event.patch(), Some(&json!({"title": "t"})));
        assert!(event.data().is_none());
    }

    #[test]
    fn publication_wire_uses_type_tag() {
        let path = DocumentPath::parse("tasks/t1").unwrap();
        let publication = Publication {
            kind: ChangeKind::Created,
            id: path.doc_id(),
            path,
            version: 4,
            data: Some(json!({"status": "active"})),
        };
        let wire = serde_json::to_value(&publication).unwrap();
        assert_eq!(wire["type"], json!("CREATED"));
        assert_eq!(wire["version"], json!(4));

        let deleted = Publication {
            data: None,
            kind: ChangeKind::Deleted,
            ..publication
        };
        let wire = serde_json::to_value(&deleted).unwrap();
        assert!(wire.get("data").is_none());
    }
}
