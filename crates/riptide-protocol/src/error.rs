//! Error taxonomy for engine operations.

use thiserror::Error;

use crate::ids::Version;

/// Errors surfaced by the document engine and its storage layer.
///
/// The HTTP layer maps these onto status codes: `VersionConflict` → 409,
/// `PermissionDenied` → 403, `NotFound` → 404, `Malformed` → 400, the rest
/// → 500. Rules-evaluation failures are collapsed into `PermissionDenied`
/// before they leave the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: Version, actual: Version },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
