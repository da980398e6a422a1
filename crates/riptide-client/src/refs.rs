//! Collection and document references, snapshots, and the fluent query
//! builder. All reads are read-through with a cache fallback on network
//! failure; all writes are optimistic when persistence is enabled.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;

use riptide_protocol::{
    CollectionPath, Direction, DocumentPath, FilterOp, OrderBy, PENDING_VERSION, QuerySpec,
    Version, compare_values, extract_field,
};

use crate::cache::{CachedDocument, QueueKind, QueuedOperation};
use crate::error::{ClientError, ClientResult};
use crate::ClientInner;

/// Where a snapshot's value came from and whether unsynced local writes are
/// folded into it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub from_cache: bool,
    pub has_pending_writes: bool,
}

#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    pub data: Option<Value>,
    pub version: Version,
    pub metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub(crate) fn missing(path: DocumentPath, metadata: SnapshotMetadata) -> Self {
        Self {
            path,
            data: None,
            version: 0,
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryDocument {
    pub id: String,
    pub path: DocumentPath,
    pub data: Value,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub docs: Vec<QueryDocument>,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub version: Version,
}

impl WriteResult {
    /// True when the write only landed locally and is queued for replay.
    pub fn is_pending(&self) -> bool {
        self.version == PENDING_VERSION
    }
}

/// Reference to a collection at a given path depth.
#[derive(Clone)]
pub struct CollectionRef {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) path: CollectionPath,
}

impl CollectionRef {
    pub fn path(&self) -> &CollectionPath {
        &self.path
    }

    pub fn doc(&self, id: impl AsRef<str>) -> DocumentRef {
        DocumentRef {
            inner: self.inner.clone(),
            path: self.path.doc(id),
        }
    }

    /// Create a document with a server-assigned id. Requires the network;
    /// there is no offline path for auto-id creation.
    pub async fn add(&self, data: Value) -> ClientResult<DocumentRef> {
        let parent = self.path.parent();
        let created = self
            .inner
            .transport
            .create(self.path.name(), parent.as_ref(), &data)
            .await?;
        if let Some(cache) = &self.inner.cache {
            cache.put_document(
                &created.path.to_string(),
                &CachedDocument {
                    data,
                    version: created.version,
                },
            )?;
        }
        Ok(DocumentRef {
            inner: self.inner.clone(),
            path: created.path,
        })
    }

    pub fn query(&self) -> QueryRef {
        QueryRef {
            inner: self.inner.clone(),
            collection: self.path.clone(),
            spec: QuerySpec::default(),
        }
    }

    pub fn where_field(&self, field: impl Into<String>, op: FilterOp, value: Value) -> QueryRef {
        self.query().where_field(field, op, value)
    }

    pub fn order_by(&self, field: impl Into<String>, direction: Direction) -> QueryRef {
        self.query().order_by(field, direction)
    }

    pub fn limit(&self, limit: u32) -> QueryRef {
        self.query().limit(limit)
    }

    /// Fetch the whole collection level (no filters).
    pub async fn get(&self) -> ClientResult<QuerySnapshot> {
        self.query().get().await
    }
}

/// Reference to a single document.
#[derive(Clone)]
pub struct DocumentRef {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) path: DocumentPath,
}

impl DocumentRef {
    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    /// A sub-collection nested under this document.
    pub fn collection(&self, name: impl AsRef<str>) -> CollectionRef {
        CollectionRef {
            inner: self.inner.clone(),
            path: self.path.collection(name),
        }
    }

    /// Read-through get: server first, cache fallback on network failure.
    pub async fn get(&self) -> ClientResult<DocumentSnapshot> {
        let key = self.path.to_string();
        match self.inner.transport.get(&self.path).await {
            Ok(document) => {
                if let Some(cache) = &self.inner.cache {
                    cache.put_document(
                        &key,
                        &CachedDocument {
                            data: document.data.clone(),
                            version: document.version,
                        },
                    )?;
                }
                Ok(DocumentSnapshot {
                    path: self.path.clone(),
                    data: Some(document.data),
                    version: document.version,
                    metadata: SnapshotMetadata {
                        from_cache: false,
                        has_pending_writes: self.inner.path_has_pending(&key)?,
                    },
                })
            }
            Err(error) if error.is_not_found() => Ok(DocumentSnapshot::missing(
                self.path.clone(),
                SnapshotMetadata {
                    from_cache: false,
                    has_pending_writes: self.inner.path_has_pending(&key)?,
                },
            )),
            Err(error) if error.is_network() => {
                // No cache configured is its own failure; a configured but
                // cold cache keeps the network error.
                let Some(cache) = &self.inner.cache else {
                    return Err(ClientError::PersistenceDisabled);
                };
                let Some(cached) = cache.get_document(&key)? else {
                    return Err(error);
                };
                let has_pending = cached.is_pending() || cache.has_pending(&key)?;
                Ok(DocumentSnapshot {
                    path: self.path.clone(),
                    data: Some(cached.data),
                    version: cached.version,
                    metadata: SnapshotMetadata {
                        from_cache: true,
                        has_pending_writes: has_pending,
                    },
                })
            }
            Err(error) => Err(error),
        }
    }

    pub async fn set(&self, data: Value) -> ClientResult<WriteResult> {
        self.write(QueueKind::Set, Some(data), None).await
    }

    pub async fn set_with_version(
        &self,
        data: Value,
        expected_version: Version,
    ) -> ClientResult<WriteResult> {
        self.write(QueueKind::Set, Some(data), Some(expected_version))
            .await
    }

    pub async fn update(&self, patch: Value) -> ClientResult<WriteResult> {
        self.write(QueueKind::Update, Some(patch), None).await
    }

    pub async fn update_with_version(
        &self,
        patch: Value,
        expected_version: Version,
    ) -> ClientResult<WriteResult> {
        self.write(QueueKind::Update, Some(patch), Some(expected_version))
            .await
    }

    pub async fn delete(&self) -> ClientResult<WriteResult> {
        self.write(QueueKind::Delete, None, None).await
    }

    pub async fn delete_with_version(
        &self,
        expected_version: Version,
    ) -> ClientResult<WriteResult> {
        self.write(QueueKind::Delete, None, Some(expected_version))
            .await
    }

    /// The optimistic write path: cache first with the pending sentinel,
    /// enqueue, then attempt the network call. Success replaces the cached
    /// version with the authoritative one and removes the queue entry; a
    /// network failure keeps both. A definitive server rejection removes
    /// the entry and surfaces the error.
    async fn write(
        &self,
        kind: QueueKind,
        data: Option<Value>,
        expected_version: Option<Version>,
    ) -> ClientResult<WriteResult> {
        let key = self.path.to_string();
        let queued_key = match &self.inner.cache {
            // OCC writes are not queued: a precondition has no meaning by
            // the time a replay happens.
            Some(cache) if expected_version.is_none() => {
                match (&kind, &data) {
                    (QueueKind::Set, Some(data)) => {
                        cache.put_document(
                            &key,
                            &CachedDocument {
                                data: data.clone(),
                                version: PENDING_VERSION,
                            },
                        )?;
                    }
                    (QueueKind::Update, Some(patch)) => {
                        let mut merged = cache
                            .get_document(&key)?
                            .map(|cached| cached.data)
                            .unwrap_or(Value::Null);
                        riptide_protocol::merge_patch(&mut merged, patch);
                        cache.put_document(
                            &key,
                            &CachedDocument {
                                data: merged,
                                version: PENDING_VERSION,
                            },
                        )?;
                    }
                    (QueueKind::Delete, _) => {
                        cache.remove_document(&key)?;
                    }
                    _ => {}
                }
                let collection = self.path.parent();
                Some(cache.enqueue(&QueuedOperation {
                    kind,
                    path: key.clone(),
                    data: data.clone(),
                    collection_name: collection.name().to_owned(),
                    parent_path: collection.parent().map(|parent| parent.to_string()),
                })?)
            }
            _ => None,
        };

        let outcome = match kind {
            QueueKind::Set => {
                self.inner
                    .transport
                    .set(
                        &self.path,
                        data.as_ref().unwrap_or(&Value::Null),
                        expected_version,
                    )
                    .await
            }
            QueueKind::Update => {
                self.inner
                    .transport
                    .update(
                        &self.path,
                        data.as_ref().unwrap_or(&Value::Null),
                        expected_version,
                    )
                    .await
            }
            QueueKind::Delete => self
                .inner
                .transport
                .delete(&self.path, expected_version)
                .await
                .map(|()| 0),
        };

        match outcome {
            Ok(version) => {
                if let Some(cache) = &self.inner.cache {
                    match (&kind, data) {
                        (QueueKind::Delete, _) => cache.remove_document(&key)?,
                        (QueueKind::Set, Some(data)) => {
                            cache.put_document(&key, &CachedDocument { data, version })?;
                        }
                        (QueueKind::Update, Some(patch)) => {
                            // Merge-patch is idempotent, so re-applying over
                            // an already-optimistic merge is safe.
                            if let Some(mut cached) = cache.get_document(&key)? {
                                riptide_protocol::merge_patch(&mut cached.data, &patch);
                                cached.version = version;
                                cache.put_document(&key, &cached)?;
                            }
                        }
                        _ => {}
                    }
                    if let Some(queued) = queued_key {
                        cache.dequeue(queued)?;
                    }
                }
                Ok(WriteResult { version })
            }
            Err(error) if error.is_network() && queued_key.is_some() => {
                // Offline: the optimistic state and the queue entry stand.
                Ok(WriteResult {
                    version: PENDING_VERSION,
                })
            }
            Err(error) => {
                if let (Some(cache), Some(queued)) = (&self.inner.cache, queued_key) {
                    cache.dequeue(queued)?;
                }
                Err(error)
            }
        }
    }
}

/// A collection query under construction, and the handle live
/// subscriptions are attached to.
#[derive(Clone)]
pub struct QueryRef {
    pub(crate) inner: Arc<ClientInner>,
    pub(crate) collection: CollectionPath,
    pub(crate) spec: QuerySpec,
}

impl QueryRef {
    pub fn where_field(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.spec
            .filters
            .push(riptide_protocol::Filter::new(field, op, value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.spec.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Execute: server first; on network failure the same filter/order/limit
    /// run locally over cached documents one level under the collection.
    pub async fn get(&self) -> ClientResult<QuerySnapshot> {
        match self.inner.transport.query(&self.collection, &self.spec).await {
            Ok(hits) => {
                let mut docs = Vec::with_capacity(hits.len());
                for hit in hits {
                    let path = self.collection.doc(&hit.id);
                    if let Some(cache) = &self.inner.cache {
                        cache.put_document(
                            &path.to_string(),
                            &CachedDocument {
                                data: hit.data.clone(),
                                version: hit.version,
                            },
                        )?;
                    }
                    docs.push(QueryDocument {
                        id: hit.id,
                        path,
                        data: hit.data,
                        version: hit.version,
                    });
                }
                Ok(QuerySnapshot {
                    docs,
                    metadata: SnapshotMetadata::default(),
                })
            }
            Err(error) if error.is_network() => self.get_from_cache().await,
            Err(error) => Err(error),
        }
    }

    async fn get_from_cache(&self) -> ClientResult<QuerySnapshot> {
        let Some(cache) = &self.inner.cache else {
            return Err(ClientError::PersistenceDisabled);
        };
        let spec = self.spec.sanitized();
        let mut docs: Vec<QueryDocument> = Vec::new();
        let mut has_pending = false;
        for (path, cached) in cache.documents_under(&self.collection)? {
            if !spec.matches(&cached.data) {
                continue;
            }
            has_pending |= cached.is_pending() || cache.has_pending(&path)?;
            let path = DocumentPath::parse(&path)?;
            docs.push(QueryDocument {
                id: path.doc_id().as_str().to_owned(),
                path,
                data: cached.data,
                version: cached.version,
            });
        }
        if let Some(order) = &spec.order_by {
            order_documents(&mut docs, order);
        }
        if let Some(limit) = spec.limit {
            docs.truncate(limit as usize);
        }
        Ok(QuerySnapshot {
            docs,
            metadata: SnapshotMetadata {
                from_cache: true,
                has_pending_writes: has_pending,
            },
        })
    }
}

/// Local ordering policy: missing fields sort last in ascending order;
/// descending reverses the whole comparison.
pub(crate) fn order_documents(docs: &mut [QueryDocument], order: &OrderBy) {
    docs.sort_by(|a, b| {
        let left = extract_field(&a.data, &order.field);
        let right = extract_field(&b.data, &order.field);
        let ascending = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) => compare_values(left, right),
        };
        match order.direction {
            Direction::Asc => ascending,
            Direction::Desc => ascending.reverse(),
        }
    });
}

impl From<riptide_protocol::EngineError> for ClientError {
    fn from(error: riptide_protocol::EngineError) -> Self {
        use riptide_protocol::EngineError as E;
        match error {
            E::VersionConflict { expected, actual } => {
                Self::Conflict(format!("expected {expected}, actual {actual}"))
            }
            E::PermissionDenied(message) => Self::Denied(message),
            E::NotFound(message) => Self::NotFound(message),
            E::Malformed(message) => Self::Malformed(message),
            other => Self::Server(other.to_string()),
        }
    }
}
