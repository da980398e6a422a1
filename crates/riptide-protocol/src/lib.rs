//! # riptide-protocol — shared contract crate
//!
//! Defines the types every other workspace member agrees on: typed ids,
//! the hierarchical path model, the document and event entities, write
//! operations and their committed outcomes, the query model with the local
//! matcher, JSON merge-patch helpers, and the engine error taxonomy.
//!
//! It is intentionally dependency-light (no tokio, axum, or rusqlite) so it
//! can be used as a pure contract crate by both server and client.
//!
//! ## Module overview
//!
//! - [`ids`] — typed ID wrappers (DocumentId, WorkspaceId, UserId, EventId)
//!   and the workspace [`Version`](ids::Version)
//! - [`path`] — CollectionPath / DocumentPath with chaining
//! - [`document`] — the Document entity
//! - [`event`] — EventType, EventRecord, ChangeKind, Publication
//! - [`op`] — WriteOperation, CommittedWrite
//! - [`query`] — Filter, QuerySpec, and the local matcher
//! - [`value`] — merge-patch, dotted extraction, value ordering
//! - [`error`] — EngineError, EngineResult

pub mod document;
pub mod error;
pub mod event;
pub mod ids;
pub mod op;
pub mod path;
pub mod query;
pub mod value;

pub use document::Document;
pub use error::{EngineError, EngineResult};
pub use event::{ChangeKind, EventRecord, EventType, Publication};
pub use ids::{DocumentId, EventId, PENDING_VERSION, UserId, Version, WorkspaceId};
pub use op::{CommittedWrite, WriteOperation};
pub use path::{CollectionPath, DocumentPath};
pub use query::{Direction, Filter, FilterOp, OrderBy, QuerySpec};
pub use value::{compare_values, extract_field, merge_patch};
