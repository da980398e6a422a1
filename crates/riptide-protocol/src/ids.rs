//! Typed ID wrappers shared across the workspace.
//!
//! IDs are opaque String wrappers (serde-transparent). Auto-generated ids use
//! UUID v4; caller-supplied ids (final path segments, workspace names) pass
//! through unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new random ID (UUID v4).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a document within its workspace. Equals the
    /// final segment of the document's path.
    DocumentId
);
typed_id!(
    /// Unique identifier for an event record.
    EventId
);
typed_id!(
    /// Tenant scope. Every entity belongs to exactly one workspace.
    WorkspaceId
);
typed_id!(
    /// Caller identity as asserted by the external identity provider.
    UserId
);

impl WorkspaceId {
    /// The default workspace used when a caller does not name one.
    pub fn default_workspace() -> Self {
        Self("default".to_owned())
    }
}

/// Workspace-wide monotone version, assigned at event-append time. The
/// client uses `-1` as the sentinel for optimistic, not-yet-acknowledged
/// writes, so the type is signed.
pub type Version = i64;

/// Sentinel version carried by cached documents whose write has not yet been
/// acknowledged by the server.
pub const PENDING_VERSION: Version = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_new_is_unique() {
        let a = DocumentId::new_uuid();
        let b = DocumentId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn workspace_id_default_workspace() {
        assert_eq!(WorkspaceId::default_workspace().as_str(), "default");
    }

    #[test]
    fn typed_id_serde_is_transparent() {
        let id = DocumentId::from_string("doc-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"doc-1\"");
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn user_id_from_str_trait() {
        let id: UserId = "u1".into();
        assert_eq!(id.as_str(), "u1");
        assert_eq!(id.to_string(), "u1");
    }
}
