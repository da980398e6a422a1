//! The document entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DocumentId, UserId, Version, WorkspaceId};
use crate::path::DocumentPath;

/// A JSON value addressed by a path, carrying an identity and a version.
///
/// `version` is assigned by the server and equals the version of the latest
/// event applied to this document within its workspace. `deleted_at` is the
/// tombstone marker; a document is visible iff it is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub workspace_id: WorkspaceId,
    pub path: DocumentPath,
    pub collection_name: String,
    pub owner_id: UserId,
    pub data: Value,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_is_camel_case_and_omits_live_tombstone() {
        let doc = Document {
            id: DocumentId::from_string("d1"),
            workspace_id: WorkspaceId::default_workspace(),
            path: DocumentPath::parse("items/d1").unwrap(),
            collection_name: "items".to_owned(),
            owner_id: UserId::from_string("u1"),
            data: json!({"name": "a"}),
            version: 3,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let wire = serde_json::to_value(&doc).unwrap();
        assert_eq!(wire["workspaceId"], json!("default"));
        assert_eq!(wire["collectionName"], json!("items"));
        assert_eq!(wire["path"], json!("items/d1"));
        assert!(wire.get("deletedAt").is_none());
        assert!(!doc.is_deleted());
    }
}
