//! Durable local state: a `documents` table keyed by full path, an ordered
//! outbound `queue`, and a small `meta` table carrying the incremental-sync
//! cursor.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use riptide_protocol::{
    CollectionPath, EventRecord, EventType, PENDING_VERSION, Version, merge_patch,
};

use crate::error::{ClientError, ClientResult};

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("queue");
const META: TableDefinition<&str, i64> = TableDefinition::new("meta");

const LAST_SYNCED_KEY: &str = "last_synced_version";

fn cache_err(error: impl std::fmt::Display) -> ClientError {
    ClientError::Cache(error.to_string())
}

/// A cached document value: payload plus the last known version. The
/// sentinel version `-1` marks an optimistic write the server has not
/// acknowledged yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDocument {
    pub data: Value,
    pub version: Version,
}

impl CachedDocument {
    pub fn is_pending(&self) -> bool {
        self.version == PENDING_VERSION
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Set,
    Update,
    Delete,
}

/// One queued outbound operation, in the shape the drain replays it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    #[serde(rename = "type")]
    pub kind: QueueKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub collection_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
}

pub struct ClientCache {
    db: Database,
}

impl ClientCache {
    pub fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let db = Database::create(path).map_err(cache_err)?;
        // Materialize the tables so later read transactions always find them.
        let init = db.begin_write().map_err(cache_err)?;
        {
            init.open_table(DOCUMENTS).map_err(cache_err)?;
            init.open_table(QUEUE).map_err(cache_err)?;
            init.open_table(META).map_err(cache_err)?;
        }
        init.commit().map_err(cache_err)?;
        Ok(Self { db })
    }

    pub fn put_document(&self, path: &str, doc: &CachedDocument) -> ClientResult<()> {
        let bytes = serde_json::to_vec(doc).map_err(cache_err)?;
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(DOCUMENTS).map_err(cache_err)?;
            table.insert(path, bytes.as_slice()).map_err(cache_err)?;
        }
        txn.commit().map_err(cache_err)
    }

    pub fn get_document(&self, path: &str) -> ClientResult<Option<CachedDocument>> {
        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = txn.open_table(DOCUMENTS).map_err(cache_err)?;
        let Some(guard) = table.get(path).map_err(cache_err)? else {
            return Ok(None);
        };
        serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(cache_err)
    }

    pub fn remove_document(&self, path: &str) -> ClientResult<()> {
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(DOCUMENTS).map_err(cache_err)?;
            table.remove(path).map_err(cache_err)?;
        }
        txn.commit().map_err(cache_err)
    }

    /// Cached documents exactly one nesting level under `collection`.
    pub fn documents_under(
        &self,
        collection: &CollectionPath,
    ) -> ClientResult<Vec<(String, CachedDocument)>> {
        let prefix = format!("{collection}/");
        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = txn.open_table(DOCUMENTS).map_err(cache_err)?;
        let mut documents = Vec::new();
        for entry in table.iter().map_err(cache_err)? {
            let (key, value) = entry.map_err(cache_err)?;
            let path = key.value();
            let Some(tail) = path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if tail.is_empty() || tail.contains('/') {
                continue;
            }
            let doc: CachedDocument = serde_json::from_slice(value.value()).map_err(cache_err)?;
            documents.push((path.to_owned(), doc));
        }
        Ok(documents)
    }

    pub fn enqueue(&self, operation: &QueuedOperation) -> ClientResult<u64> {
        let bytes = serde_json::to_vec(operation).map_err(cache_err)?;
        let txn = self.db.begin_write().map_err(cache_err)?;
        let key = {
            let mut table = txn.open_table(QUEUE).map_err(cache_err)?;
            let next = table
                .last()
                .map_err(cache_err)?
                .map(|(key, _)| key.value() + 1)
                .unwrap_or(0);
            table.insert(next, bytes.as_slice()).map_err(cache_err)?;
            next
        };
        txn.commit().map_err(cache_err)?;
        Ok(key)
    }

    /// The queue in replay order.
    pub fn queue(&self) -> ClientResult<Vec<(u64, QueuedOperation)>> {
        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = txn.open_table(QUEUE).map_err(cache_err)?;
        let mut entries = Vec::new();
        for entry in table.iter().map_err(cache_err)? {
            let (key, value) = entry.map_err(cache_err)?;
            let operation = serde_json::from_slice(value.value()).map_err(cache_err)?;
            entries.push((key.value(), operation));
        }
        Ok(entries)
    }

    pub fn dequeue(&self, key: u64) -> ClientResult<()> {
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(QUEUE).map_err(cache_err)?;
            table.remove(key).map_err(cache_err)?;
        }
        txn.commit().map_err(cache_err)
    }

    pub fn clear_queue(&self) -> ClientResult<()> {
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(QUEUE).map_err(cache_err)?;
            // retain_in is not available on this table shape; drain keys.
            let keys: Vec<u64> = table
                .iter()
                .map_err(cache_err)?
                .map(|entry| entry.map(|(key, _)| key.value()))
                .collect::<Result<_, _>>()
                .map_err(cache_err)?;
            for key in keys {
                table.remove(key).map_err(cache_err)?;
            }
        }
        txn.commit().map_err(cache_err)
    }

    /// Whether any queued write targets `path`.
    pub fn has_pending(&self, path: &str) -> ClientResult<bool> {
        Ok(self
            .queue()?
            .iter()
            .any(|(_, operation)| operation.path == path))
    }

    pub fn last_synced_version(&self) -> ClientResult<Version> {
        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = txn.open_table(META).map_err(cache_err)?;
        Ok(table
            .get(LAST_SYNCED_KEY)
            .map_err(cache_err)?
            .map(|guard| guard.value())
            .unwrap_or(0))
    }

    pub fn set_last_synced_version(&self, version: Version) -> ClientResult<()> {
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(META).map_err(cache_err)?;
            table.insert(LAST_SYNCED_KEY, version).map_err(cache_err)?;
        }
        txn.commit().map_err(cache_err)
    }

    /// Fold one change-feed event into the cache. Events at or below the
    /// cached version are ignored; the at-least-once broker and the sync
    /// feed may both deliver the same event.
    pub fn apply_event(&self, event: &EventRecord) -> ClientResult<()> {
        let path = match event.doc_path() {
            Ok(path) => path.to_string(),
            Err(_) => return Ok(()),
        };
        let cached = self.get_document(&path)?;
        if cached
            .as_ref()
            .is_some_and(|doc| doc.version >= event.version)
        {
            return Ok(());
        }
        match event.event_type {
            EventType::Insert | EventType::Set => {
                let data = event.data().cloned().unwrap_or(Value::Null);
                self.put_document(
                    &path,
                    &CachedDocument {
                        data,
                        version: event.version,
                    },
                )
            }
            EventType::Update => {
                let Some(mut doc) = cached else {
                    // Nothing cached to patch; the next full read repairs it.
                    return Ok(());
                };
                merge_patch(&mut doc.data, event.patch().unwrap_or(&Value::Null));
                doc.version = event.version;
                self.put_document(&path, &doc)
            }
            EventType::Delete => self.remove_document(&path),
        }
    }
}
