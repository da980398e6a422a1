//! Client-side error taxonomy.

use thiserror::Error;

/// Errors surfaced by the client SDK. Server responses are mapped by status
/// code; transport failures become `Network`, which is what triggers the
/// optimistic-cache path and queue persistence.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("version conflict: {0}")]
    Conflict(String),
    #[error("permission denied: {0}")]
    Denied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    Malformed(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("network unavailable: {0}")]
    Network(String),
    #[error("transaction conflict after {attempts} attempts")]
    TransactionConflict { attempts: u32 },
    #[error("cache error: {0}")]
    Cache(String),
    #[error("persistence is not enabled")]
    PersistenceDisabled,
    #[error("live updates require a broker")]
    BrokerUnavailable,
}

impl ClientError {
    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            409 => Self::Conflict(message),
            403 => Self::Denied(message),
            404 => Self::NotFound(message),
            400 => Self::Malformed(message),
            _ => Self::Server(message),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
