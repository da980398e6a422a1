//! Write operations and their committed outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{ChangeKind, Publication};
use crate::ids::{DocumentId, Version};
use crate::path::DocumentPath;

/// One write against a document, as staged by clients and carried in batch
/// requests. `expected_version` is the optimistic-concurrency precondition;
/// omitting it disables OCC for the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum WriteOperation {
    Set {
        path: DocumentPath,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<Version>,
    },
    Update {
        path: DocumentPath,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<Version>,
    },
    Delete {
        path: DocumentPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<Version>,
    },
}

impl WriteOperation {
    pub fn set(path: DocumentPath, data: Value) -> Self {
        Self::Set {
            path,
            data,
            expected_version: None,
        }
    }

    pub fn update(path: DocumentPath, data: Value) -> Self {
        Self::Update {
            path,
            data,
            expected_version: None,
        }
    }

    pub fn delete(path: DocumentPath) -> Self {
        Self::Delete {
            path,
            expected_version: None,
        }
    }

    pub fn with_expected_version(mut self, version: Version) -> Self {
        match &mut self {
            Self::Set {
                expected_version, ..
            }
            | Self::Update {
                expected_version, ..
            }
            | Self::Delete {
                expected_version, ..
            } => *expected_version = Some(version),
        }
        self
    }

    pub fn path(&self) -> &DocumentPath {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::Delete { path, .. } => path,
        }
    }

    pub fn expected_version(&self) -> Option<Version> {
        match self {
            Self::Set {
                expected_version, ..
            }
            | Self::Update {
                expected_version, ..
            }
            | Self::Delete {
                expected_version, ..
            } => *expected_version,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }
}

/// The outcome of one applied operation: the authoritative version assigned
/// by the event append, the observable change kind, and the post-state data
/// (absent for deletes). The engine turns these into publications after the
/// commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedWrite {
    pub doc_id: DocumentId,
    pub path: DocumentPath,
    pub version: Version,
    pub change: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommittedWrite {
    pub fn publication(&self) -> Publication {
        Publication {
            kind: self.change,
            id: self.doc_id.clone(),
            path: self.path.clone(),
            version: self.version,
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_wire_shape_matches_the_http_contract() {
        let op = WriteOperation::set(
            DocumentPath::parse("items/a").unwrap(),
            json!({"value": 1}),
        )
        .with_expected_version(5);
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({"type": "set", "path": "items/a", "data": {"value": 1}, "expectedVersion": 5})
        );

        let parsed: WriteOperation =
            serde_json::from_value(json!({"type": "delete", "path": "items/a"})).unwrap();
        assert!(parsed.is_delete());
        assert_eq!(parsed.expected_version(), None);
    }

    #[test]
    fn committed_write_becomes_a_publication() {
        let path = DocumentPath::parse("items/a").unwrap();
        let committed = CommittedWrite {
            doc_id: path.doc_id(),
            path: path.clone(),
            version: 12,
            change: ChangeKind::Updated,
            data: Some(json!({"value": 2})),
        };
        let publication = committed.publication();
        assert_eq!(publication.kind, ChangeKind::Updated);
        assert_eq!(publication.version, 12);
        assert_eq!(publication.path, path);
    }
}
