//! SQLite storage layer: the `documents` and `events` tables and the atomic
//! write groups that keep them consistent.
//!
//! The event log is the source of truth for versions. Every write appends
//! its event row first, reads back the auto-assigned row id explicitly, and
//! binds that id into the document mutation inside the same transaction, so
//! a document's `version` always equals its latest event's version and
//! versions within a batch are contiguous.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, params};
use serde_json::Value;
use tracing::instrument;

use riptide_protocol::{
    ChangeKind, CollectionPath, CommittedWrite, Document, DocumentId, EngineError, EngineResult,
    EventId, EventRecord, EventType, FilterOp, QuerySpec, UserId, Version, WorkspaceId,
    event::{delete_payload, full_write_payload, patch_payload},
    merge_patch,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT NOT NULL,
    workspace_id    TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    path            TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    data            TEXT NOT NULL,
    version         INTEGER NOT NULL,
    deleted_at      TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (workspace_id, path)
);
CREATE INDEX IF NOT EXISTS idx_documents_path ON documents(path);
CREATE TABLE IF NOT EXISTS events (
    version      INTEGER PRIMARY KEY AUTOINCREMENT,
    id           TEXT NOT NULL,
    doc_id       TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_doc ON events(doc_id);
CREATE INDEX IF NOT EXISTS idx_events_workspace ON events(workspace_id);
";

fn storage_err(error: rusqlite::Error) -> EngineError {
    EngineError::Storage(error.to_string())
}

fn json_err(error: serde_json::Error) -> EngineError {
    EngineError::Storage(error.to_string())
}

/// Durable store behind a single serialized connection. SQLite is a single
/// writer anyway; the mutex keeps write groups and their rowid reads atomic
/// with respect to each other.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Truncate and recreate the schema.
    pub fn reset(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DROP TABLE IF EXISTS documents;
             DROP TABLE IF EXISTS events;
             DELETE FROM sqlite_sequence WHERE name = 'events';",
        )
        .map_err(storage_err)?;
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(())
    }

    /// Fetch a live document, excluding tombstones.
    pub fn get(
        &self,
        workspace_id: &WorkspaceId,
        path: &riptide_protocol::DocumentPath,
    ) -> EngineResult<Option<Document>> {
        let conn = self.conn.lock();
        let row = fetch_document(&conn, workspace_id, &path.to_string())?;
        Ok(row.filter(|doc| !doc.is_deleted()))
    }

    /// All live documents exactly one nesting level under `collection`.
    pub fn list(
        &self,
        workspace_id: &WorkspaceId,
        collection: &CollectionPath,
    ) -> EngineResult<Vec<Document>> {
        self.query(workspace_id, Some(collection), &QuerySpec::default())
    }

    /// Filter/order/limit over document payloads, optionally scoped to one
    /// collection level. Field names were whitelisted upstream; they are
    /// re-checked here before any interpolation, and every value is bound.
    #[instrument(skip(self, spec), fields(workspace = %workspace_id))]
    pub fn query(
        &self,
        workspace_id: &WorkspaceId,
        collection: Option<&CollectionPath>,
        spec: &QuerySpec,
    ) -> EngineResult<Vec<Document>> {
        let spec = spec.sanitized();
        let mut sql = String::from(
            "SELECT id, workspace_id, collection_name, path, user_id, data, version, \
             deleted_at, created_at, updated_at FROM documents \
             WHERE workspace_id = ? AND deleted_at IS NULL",
        );
        let mut bound: Vec<Box<dyn ToSql>> = vec![Box::new(workspace_id.as_str().to_owned())];

        if let Some(collection) = collection {
            sql.push_str(
                " AND collection_name = ? AND path LIKE ? ESCAPE '\\' \
                 AND path NOT LIKE ? ESCAPE '\\'",
            );
            let prefix = escape_like(&collection.to_string());
            bound.push(Box::new(collection.name().to_owned()));
            bound.push(Box::new(format!("{prefix}/%")));
            bound.push(Box::new(format!("{prefix}/%/%")));
        }

        for filter in &spec.filters {
            push_filter_sql(&mut sql, &mut bound, filter)?;
        }

        if let Some(order) = &spec.order_by {
            let direction = match order.direction {
                riptide_protocol::Direction::Asc => "ASC",
                riptide_protocol::Direction::Desc => "DESC",
            };
            sql.push_str(&format!(
                " ORDER BY json_extract(data, '$.{}') {direction}",
                order.field
            ));
        }
        if let Some(limit) = spec.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let params: Vec<&dyn ToSql> = bound.iter().map(|value| value.as_ref()).collect();
        let mut rows = stmt.query(params.as_slice()).map_err(storage_err)?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            documents.push(document_from_row(row)?);
        }
        Ok(documents)
    }

    /// Apply an ordered group of operations as one atomic unit. Either every
    /// operation lands with its event, or nothing does.
    #[instrument(skip(self, operations), fields(workspace = %workspace_id, operations = operations.len()))]
    pub fn apply(
        &self,
        workspace_id: &WorkspaceId,
        caller: &UserId,
        operations: &[riptide_protocol::WriteOperation],
    ) -> EngineResult<Vec<CommittedWrite>> {
        if operations.is_empty() {
            return Err(EngineError::malformed("empty operation group"));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        let mut committed = Vec::with_capacity(operations.len());
        for operation in operations {
            committed.push(apply_one(&tx, workspace_id, caller, operation)?);
        }
        tx.commit().map_err(storage_err)?;
        Ok(committed)
    }

    /// Events for a workspace with version strictly greater than `since`,
    /// ascending — the incremental sync feed.
    pub fn events_since(
        &self,
        workspace_id: &WorkspaceId,
        since: Version,
    ) -> EngineResult<Vec<EventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT version, id, doc_id, workspace_id, event_type, payload, created_at \
                 FROM events WHERE workspace_id = ? AND version > ? ORDER BY version ASC",
            )
            .map_err(storage_err)?;
        let mut rows = stmt
            .query(params![workspace_id.as_str(), since])
            .map_err(storage_err)?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            events.push(event_from_row(row)?);
        }
        Ok(events)
    }

    /// The latest version assigned in a workspace, 0 when none.
    pub fn latest_version(&self, workspace_id: &WorkspaceId) -> EngineResult<Version> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM events WHERE workspace_id = ?",
            params![workspace_id.as_str()],
            |row| row.get(0),
        )
        .map_err(storage_err)
    }
}

fn apply_one(
    tx: &Transaction<'_>,
    workspace_id: &WorkspaceId,
    caller: &UserId,
    operation: &riptide_protocol::WriteOperation,
) -> EngineResult<CommittedWrite> {
    use riptide_protocol::WriteOperation;

    let path = operation.path();
    let path_text = path.to_string();
    let existing = fetch_document(tx, workspace_id, &path_text)?;

    if let Some(expected) = operation.expected_version() {
        let actual = existing.as_ref().map(|doc| doc.version).unwrap_or(0);
        if expected != actual {
            return Err(EngineError::VersionConflict { expected, actual });
        }
    }

    let now = Utc::now();
    match operation {
        WriteOperation::Set { data, .. } => {
            let (event_type, change) = match &existing {
                None => (EventType::Insert, ChangeKind::Created),
                Some(doc) if doc.is_deleted() => (EventType::Set, ChangeKind::Created),
                Some(_) => (EventType::Set, ChangeKind::Updated),
            };
            let version = append_event(
                tx,
                workspace_id,
                &path.doc_id(),
                event_type,
                &full_write_payload(path, data),
                now,
            )?;
            write_document(tx, workspace_id, caller, path, data, version, &existing, now)?;
            Ok(CommittedWrite {
                doc_id: path.doc_id(),
                path: path.clone(),
                version,
                change,
                data: Some(data.clone()),
            })
        }
        WriteOperation::Update { data: patch, .. } => {
            let doc = existing
                .as_ref()
                .filter(|doc| !doc.is_deleted())
                .ok_or_else(|| EngineError::not_found(path_text.clone()))?;
            let mut merged = doc.data.clone();
            merge_patch(&mut merged, patch);
            let version = append_event(
                tx,
                workspace_id,
                &path.doc_id(),
                EventType::Update,
                &patch_payload(path, patch),
                now,
            )?;
            write_document(
                tx,
                workspace_id,
                caller,
                path,
                &merged,
                version,
                &existing,
                now,
            )?;
            Ok(CommittedWrite {
                doc_id: path.doc_id(),
                path: path.clone(),
                version,
                change: ChangeKind::Updated,
                data: Some(merged),
            })
        }
        WriteOperation::Delete { .. } => {
            existing
                .as_ref()
                .filter(|doc| !doc.is_deleted())
                .ok_or_else(|| EngineError::not_found(path_text.clone()))?;
            let version = append_event(
                tx,
                workspace_id,
                &path.doc_id(),
                EventType::Delete,
                &delete_payload(path),
                now,
            )?;
            tx.execute(
                "UPDATE documents SET version = ?, deleted_at = ?, updated_at = ? \
                 WHERE workspace_id = ? AND path = ?",
                params![
                    version,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                    workspace_id.as_str(),
                    path_text
                ],
            )
            .map_err(storage_err)?;
            Ok(CommittedWrite {
                doc_id: path.doc_id(),
                path: path.clone(),
                version,
                change: ChangeKind::Deleted,
                data: None,
            })
        }
    }
}

/// Insert the event row and return its auto-assigned row id — read back as
/// its own statement, never inferred from a compound write.
fn append_event(
    tx: &Transaction<'_>,
    workspace_id: &WorkspaceId,
    doc_id: &DocumentId,
    event_type: EventType,
    payload: &Value,
    now: DateTime<Utc>,
) -> EngineResult<Version> {
    tx.execute(
        "INSERT INTO events (id, doc_id, workspace_id, event_type, payload, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            EventId::new_uuid().as_str(),
            doc_id.as_str(),
            workspace_id.as_str(),
            event_type.as_str(),
            serde_json::to_string(payload).map_err(json_err)?,
            now.to_rfc3339(),
        ],
    )
    .map_err(storage_err)?;
    Ok(tx.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
fn write_document(
    tx: &Transaction<'_>,
    workspace_id: &WorkspaceId,
    caller: &UserId,
    path: &riptide_protocol::DocumentPath,
    data: &Value,
    version: Version,
    existing: &Option<Document>,
    now: DateTime<Utc>,
) -> EngineResult<()> {
    let data_text = serde_json::to_string(data).map_err(json_err)?;
    match existing {
        Some(_) => {
            tx.execute(
                "UPDATE documents SET data = ?, version = ?, deleted_at = NULL, updated_at = ? \
                 WHERE workspace_id = ? AND path = ?",
                params![
                    data_text,
                    version,
                    now.to_rfc3339(),
                    workspace_id.as_str(),
                    path.to_string()
                ],
            )
            .map_err(storage_err)?;
        }
        None => {
            tx.execute(
                "INSERT INTO documents \
                 (id, workspace_id, collection_name, path, user_id, data, version, \
                  deleted_at, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
                params![
                    path.doc_id().as_str(),
                    workspace_id.as_str(),
                    path.collection_name(),
                    path.to_string(),
                    caller.as_str(),
                    data_text,
                    version,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(storage_err)?;
        }
    }
    Ok(())
}

fn fetch_document(
    conn: &Connection,
    workspace_id: &WorkspaceId,
    path: &str,
) -> EngineResult<Option<Document>> {
    conn.query_row(
        "SELECT id, workspace_id, collection_name, path, user_id, data, version, \
         deleted_at, created_at, updated_at FROM documents \
         WHERE workspace_id = ? AND path = ?",
        params![workspace_id.as_str(), path],
        |row| {
            Ok(RawDocumentRow {
                id: row.get(0)?,
                workspace_id: row.get(1)?,
                collection_name: row.get(2)?,
                path: row.get(3)?,
                user_id: row.get(4)?,
                data: row.get(5)?,
                version: row.get(6)?,
                deleted_at: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        },
    )
    .optional()
    .map_err(storage_err)?
    .map(RawDocumentRow::into_document)
    .transpose()
}

struct RawDocumentRow {
    id: String,
    workspace_id: String,
    collection_name: String,
    path: String,
    user_id: String,
    data: String,
    version: Version,
    deleted_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawDocumentRow {
    fn into_document(self) -> EngineResult<Document> {
        Ok(Document {
            id: DocumentId::from_string(self.id),
            workspace_id: WorkspaceId::from_string(self.workspace_id),
            path: riptide_protocol::DocumentPath::parse(&self.path)?,
            collection_name: self.collection_name,
            owner_id: UserId::from_string(self.user_id),
            data: serde_json::from_str(&self.data).map_err(json_err)?,
            version: self.version,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn document_from_row(row: &rusqlite::Row<'_>) -> EngineResult<Document> {
    let raw = RawDocumentRow {
        id: row.get(0).map_err(storage_err)?,
        workspace_id: row.get(1).map_err(storage_err)?,
        collection_name: row.get(2).map_err(storage_err)?,
        path: row.get(3).map_err(storage_err)?,
        user_id: row.get(4).map_err(storage_err)?,
        data: row.get(5).map_err(storage_err)?,
        version: row.get(6).map_err(storage_err)?,
        deleted_at: row.get(7).map_err(storage_err)?,
        created_at: row.get(8).map_err(storage_err)?,
        updated_at: row.get(9).map_err(storage_err)?,
    };
    raw.into_document()
}

fn event_from_row(row: &rusqlite::Row<'_>) -> EngineResult<EventRecord> {
    let event_type: String = row.get(4).map_err(storage_err)?;
    let payload: String = row.get(5).map_err(storage_err)?;
    let created_at: String = row.get(6).map_err(storage_err)?;
    Ok(EventRecord {
        version: row.get(0).map_err(storage_err)?,
        id: EventId::from_string(row.get::<_, String>(1).map_err(storage_err)?),
        doc_id: DocumentId::from_string(row.get::<_, String>(2).map_err(storage_err)?),
        workspace_id: WorkspaceId::from_string(row.get::<_, String>(3).map_err(storage_err)?),
        event_type: EventType::parse(&event_type)?,
        payload: serde_json::from_str(&payload).map_err(json_err)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn parse_timestamp(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|stamp| stamp.with_timezone(&Utc))
        .map_err(|error| EngineError::Storage(format!("bad timestamp {raw:?}: {error}")))
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn push_filter_sql(
    sql: &mut String,
    bound: &mut Vec<Box<dyn ToSql>>,
    filter: &riptide_protocol::Filter,
) -> EngineResult<()> {
    // Defense in depth: sanitized() upstream already dropped unsafe fields.
    if !riptide_protocol::query::is_safe_field(&filter.field) {
        return Ok(());
    }
    let extract = format!("json_extract(data, '$.{}')", filter.field);
    match filter.op {
        FilterOp::Eq => {
            sql.push_str(&format!(" AND {extract} = ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Ne => {
            sql.push_str(&format!(" AND {extract} != ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Lt => {
            sql.push_str(&format!(" AND {extract} < ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Le => {
            sql.push_str(&format!(" AND {extract} <= ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Gt => {
            sql.push_str(&format!(" AND {extract} > ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Ge => {
            sql.push_str(&format!(" AND {extract} >= ?"));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::In => {
            let candidates = filter.value.as_array().cloned().unwrap_or_default();
            if candidates.is_empty() {
                sql.push_str(" AND 0");
            } else {
                let placeholders = vec!["?"; candidates.len()].join(", ");
                sql.push_str(&format!(" AND {extract} IN ({placeholders})"));
                for candidate in &candidates {
                    bound.push(bind_value(candidate)?);
                }
            }
        }
        FilterOp::ArrayContains => {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM json_each({extract}) WHERE json_each.value = ?)"
            ));
            bound.push(bind_value(&filter.value)?);
        }
        FilterOp::Like => {
            sql.push_str(&format!(" AND {extract} LIKE ?"));
            bound.push(bind_value(&filter.value)?);
        }
    }
    Ok(())
}

/// Bind a JSON scalar the way SQLite's json_extract surfaces it: booleans
/// as 0/1 integers, numbers as integers or reals, strings as text.
fn bind_value(value: &Value) -> EngineResult<Box<dyn ToSql>> {
    Ok(match value {
        Value::Null => Box::new(rusqlite::types::Null),
        Value::Bool(flag) => Box::new(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Box::new(int)
            } else {
                Box::new(number.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(text) => Box::new(text.clone()),
        other => Box::new(serde_json::to_string(other).map_err(json_err)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use riptide_protocol::{Direction, DocumentPath, Filter, OrderBy, WriteOperation};
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn ws() -> WorkspaceId {
        WorkspaceId::default_workspace()
    }

    fn caller() -> UserId {
        UserId::from_string("u1")
    }

    fn doc_path(raw: &str) -> DocumentPath {
        DocumentPath::parse(raw).unwrap()
    }

    fn set(store: &SqliteStore, path: &str, data: Value) -> CommittedWrite {
        store
            .apply(&ws(), &caller(), &[WriteOperation::set(doc_path(path), data)])
            .unwrap()
            .remove(0)
    }

    #[test]
    fn set_then_get_round_trips() -> Result<()> {
        let store = store();
        let committed = set(&store, "items/a", json!({"name": "a", "value": 1}));
        assert_eq!(committed.change, ChangeKind::Created);

        let doc = store.get(&ws(), &doc_path("items/a"))?.unwrap();
        assert_eq!(doc.data, json!({"name": "a", "value": 1}));
        assert_eq!(doc.version, committed.version);
        assert_eq!(doc.owner_id.as_str(), "u1");
        Ok(())
    }

    #[test]
    fn document_version_tracks_latest_event() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"value": 1}));
        let second = set(&store, "items/a", json!({"value": 2}));

        let doc = store.get(&ws(), &doc_path("items/a"))?.unwrap();
        let events = store.events_since(&ws(), 0)?;
        let latest = events
            .iter()
            .filter(|event| event.doc_id.as_str() == "a")
            .map(|event| event.version)
            .max()
            .unwrap();
        assert_eq!(doc.version, latest);
        assert_eq!(doc.version, second.version);
        Ok(())
    }

    #[test]
    fn versions_are_strictly_increasing_per_workspace() -> Result<()> {
        let store = store();
        for index in 0..5 {
            set(&store, &format!("items/d{index}"), json!({"index": index}));
        }
        let events = store.events_since(&ws(), 0)?;
        let versions: Vec<Version> = events.iter().map(|event| event.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        Ok(())
    }

    #[test]
    fn update_is_merge_patch() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"name": "a", "nested": {"x": 1, "y": 2}}));
        let committed = store
            .apply(
                &ws(),
                &caller(),
                &[WriteOperation::update(
                    doc_path("items/a"),
                    json!({"nested": {"y": null, "z": 3}, "value": 2}),
                )],
            )?
            .remove(0);
        assert_eq!(
            committed.data,
            Some(json!({"name": "a", "nested": {"x": 1, "z": 3}, "value": 2}))
        );
        let doc = store.get(&ws(), &doc_path("items/a"))?.unwrap();
        assert_eq!(doc.data, committed.data.unwrap());
        Ok(())
    }

    #[test]
    fn update_and_delete_require_a_live_document() {
        let store = store();
        let patch = WriteOperation::update(doc_path("items/missing"), json!({"x": 1}));
        assert!(matches!(
            store.apply(&ws(), &caller(), &[patch]),
            Err(EngineError::NotFound(_))
        ));
        let delete = WriteOperation::delete(doc_path("items/missing"));
        assert!(matches!(
            store.apply(&ws(), &caller(), &[delete]),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn expected_version_mismatch_conflicts() -> Result<()> {
        let store = store();
        let first = set(&store, "items/a", json!({"value": 1}));

        let stale = WriteOperation::update(doc_path("items/a"), json!({"value": 2}))
            .with_expected_version(first.version + 10);
        let error = store.apply(&ws(), &caller(), &[stale]).unwrap_err();
        assert!(matches!(error, EngineError::VersionConflict { actual, .. } if actual == first.version));

        // The matching precondition goes through.
        let fresh = WriteOperation::update(doc_path("items/a"), json!({"value": 2}))
            .with_expected_version(first.version);
        let committed = store.apply(&ws(), &caller(), &[fresh])?.remove(0);
        assert!(committed.version > first.version);
        Ok(())
    }

    #[test]
    fn delete_tombstones_and_set_resurrects() -> Result<()> {
        let store = store();
        let created = set(&store, "items/a", json!({"value": 1}));
        let deleted = store
            .apply(&ws(), &caller(), &[WriteOperation::delete(doc_path("items/a"))])?
            .remove(0);
        assert_eq!(deleted.change, ChangeKind::Deleted);
        assert!(deleted.version > created.version);
        assert!(store.get(&ws(), &doc_path("items/a"))?.is_none());

        let resurrected = set(&store, "items/a", json!({"value": 2}));
        assert_eq!(resurrected.change, ChangeKind::Created);
        assert!(resurrected.version > deleted.version);
        let doc = store.get(&ws(), &doc_path("items/a"))?.unwrap();
        assert!(doc.deleted_at.is_none());
        assert_eq!(doc.data, json!({"value": 2}));
        Ok(())
    }

    #[test]
    fn batch_is_atomic_and_contiguous() -> Result<()> {
        let store = store();
        let committed = store.apply(
            &ws(),
            &caller(),
            &[
                WriteOperation::set(doc_path("items/a"), json!({"value": 1})),
                WriteOperation::set(doc_path("items/b"), json!({"value": 2})),
                WriteOperation::delete(doc_path("items/a")),
            ],
        )?;
        let versions: Vec<Version> = committed.iter().map(|write| write.version).collect();
        assert_eq!(versions[1], versions[0] + 1);
        assert_eq!(versions[2], versions[1] + 1);

        // A failing operation rolls back everything before it.
        let before = store.latest_version(&ws())?;
        let error = store
            .apply(
                &ws(),
                &caller(),
                &[
                    WriteOperation::set(doc_path("items/c"), json!({"value": 3})),
                    WriteOperation::update(doc_path("items/absent"), json!({"x": 1})),
                ],
            )
            .unwrap_err();
        assert!(matches!(error, EngineError::NotFound(_)));
        assert!(store.get(&ws(), &doc_path("items/c"))?.is_none());
        assert_eq!(store.latest_version(&ws())?, before);
        Ok(())
    }

    #[test]
    fn list_returns_exactly_one_nesting_level() -> Result<()> {
        let store = store();
        set(&store, "users/u1", json!({"name": "u"}));
        set(&store, "users/u1/posts/p1", json!({"title": "t"}));

        let users = store.list(&ws(), &CollectionPath::parse("users")?)?;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id.as_str(), "u1");

        let posts = store.list(&ws(), &CollectionPath::parse("users/u1/posts")?)?;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].id.as_str(), "p1");
        Ok(())
    }

    #[test]
    fn query_filters_order_and_limit() -> Result<()> {
        let store = store();
        for (id, status, priority) in [
            ("t1", "active", 1),
            ("t2", "done", 9),
            ("t3", "active", 5),
            ("t4", "active", 3),
        ] {
            set(
                &store,
                &format!("tasks/{id}"),
                json!({"status": status, "priority": priority}),
            );
        }
        let spec = QuerySpec {
            filters: vec![Filter::new("status", FilterOp::Eq, json!("active"))],
            order_by: Some(OrderBy {
                field: "priority".to_owned(),
                direction: Direction::Desc,
            }),
            limit: Some(2),
        };
        let results = store.query(&ws(), Some(&CollectionPath::parse("tasks")?), &spec)?;
        let ids: Vec<&str> = results.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t4"]);
        Ok(())
    }

    #[test]
    fn query_without_filters_returns_workspace_documents() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"value": 1}));
        set(&store, "tasks/t1", json!({"status": "active"}));
        store.apply(&ws(), &caller(), &[WriteOperation::delete(doc_path("items/a"))])?;

        let all = store.query(&ws(), None, &QuerySpec::default())?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id.as_str(), "t1");
        Ok(())
    }

    #[test]
    fn unsafe_filter_fields_are_dropped_not_rejected() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"value": 1}));
        let spec = QuerySpec {
            filters: vec![Filter::new(
                "value'); DROP TABLE documents; --",
                FilterOp::Eq,
                json!(1),
            )],
            order_by: None,
            limit: None,
        };
        let results = store.query(&ws(), None, &spec)?;
        assert_eq!(results.len(), 1);
        Ok(())
    }

    #[test]
    fn sql_results_agree_with_the_local_matcher() -> Result<()> {
        let store = store();
        let docs = [
            json!({"status": "active", "priority": 5, "tags": ["a", "b"], "name": "widget"}),
            json!({"status": "done", "priority": 2, "tags": ["b"], "name": "gadget"}),
            json!({"priority": 7, "name": "no-status"}),
            json!({"status": "active", "tags": [], "name": "bare"}),
        ];
        for (index, data) in docs.iter().enumerate() {
            set(&store, &format!("things/d{index}"), data.clone());
        }
        let specs = [
            vec![Filter::new("status", FilterOp::Eq, json!("active"))],
            vec![Filter::new("priority", FilterOp::Gt, json!(2))],
            vec![Filter::new("status", FilterOp::Ne, json!("done"))],
            vec![Filter::new("tags", FilterOp::ArrayContains, json!("b"))],
            vec![Filter::new("name", FilterOp::Like, json!("%dget"))],
            vec![Filter::new("status", FilterOp::In, json!(["active", "done"]))],
            vec![
                Filter::new("status", FilterOp::Eq, json!("active")),
                Filter::new("priority", FilterOp::Le, json!(5)),
            ],
        ];
        for filters in specs {
            let spec = QuerySpec {
                filters: filters.clone(),
                order_by: None,
                limit: None,
            };
            let from_sql: Vec<String> = store
                .query(&ws(), Some(&CollectionPath::parse("things")?), &spec)?
                .into_iter()
                .map(|doc| doc.id.as_str().to_owned())
                .collect();
            let from_matcher: Vec<String> = docs
                .iter()
                .enumerate()
                .filter(|(_, data)| spec.matches(data))
                .map(|(index, _)| format!("d{index}"))
                .collect();
            assert_eq!(from_sql, from_matcher, "filters: {filters:?}");
        }
        Ok(())
    }

    #[test]
    fn events_since_streams_from_a_cursor() -> Result<()> {
        let store = store();
        let first = set(&store, "items/a", json!({"value": 1}));
        set(&store, "items/b", json!({"value": 2}));

        let tail = store.events_since(&ws(), first.version)?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].doc_id.as_str(), "b");
        assert_eq!(tail[0].event_type, EventType::Insert);
        assert_eq!(tail[0].doc_path()?.to_string(), "items/b");
        Ok(())
    }

    #[test]
    fn reset_truncates_everything() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"value": 1}));
        store.reset()?;
        assert!(store.get(&ws(), &doc_path("items/a"))?.is_none());
        assert_eq!(store.latest_version(&ws())?, 0);
        Ok(())
    }

    #[test]
    fn workspaces_are_isolated() -> Result<()> {
        let store = store();
        set(&store, "items/a", json!({"value": 1}));
        let other = WorkspaceId::from_string("tenant-b");
        assert!(store.get(&other, &doc_path("items/a"))?.is_none());
        assert!(store.events_since(&other, 0)?.is_empty());
        Ok(())
    }
}
