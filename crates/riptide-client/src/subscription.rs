//! Live subscriptions: per-listener state machines over broker channels.
//!
//! Publications are deduplicated by version (the broker is at-least-once),
//! collection deliveries are debounced to coalesce bursts, and queries with
//! order or limit re-fetch authoritatively instead of maintaining order
//! from deltas. Listeners run on the shared runtime and must not block.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use riptide_bus::{MessageBroker, collection_channel, document_channel};
use riptide_protocol::{ChangeKind, Version};

use crate::error::{ClientError, ClientResult};
use crate::refs::{
    DocumentRef, DocumentSnapshot, QueryDocument, QueryRef, QuerySnapshot, SnapshotMetadata,
};

const DEBOUNCE: Duration = Duration::from_millis(50);

/// Disposer for a live subscription. Dropping (or calling [`dispose`]) stops
/// the listener task, which unsubscribes from the broker and releases its
/// debounce timer.
///
/// [`dispose`]: ListenerHandle::dispose
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn dispose(self) {
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl DocumentRef {
    /// Live single-document subscription: deliver the current snapshot, then
    /// re-fetch on every non-delete publication; a delete delivers a
    /// non-existent snapshot.
    pub fn on_snapshot<F>(&self, listener: F) -> ClientResult<ListenerHandle>
    where
        F: Fn(DocumentSnapshot) + Send + Sync + 'static,
    {
        let broker = self
            .inner
            .broker
            .clone()
            .ok_or(ClientError::BrokerUnavailable)?;
        let mut rx = broker.subscribe(&document_channel(&self.path));
        let doc = self.clone();

        let task = tokio::spawn(async move {
            let mut last_seen: Version = 0;
            if let Ok(snapshot) = doc.get().await {
                last_seen = snapshot.version.max(0);
                listener(snapshot);
            }
            loop {
                match rx.recv().await {
                    Ok(publication) => {
                        if publication.version <= last_seen {
                            continue;
                        }
                        last_seen = publication.version;
                        match publication.kind {
                            ChangeKind::Deleted => listener(DocumentSnapshot::missing(
                                doc.path.clone(),
                                SnapshotMetadata::default(),
                            )),
                            _ => {
                                if let Ok(snapshot) = doc.get().await {
                                    listener(snapshot);
                                }
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "document listener lagged; re-fetching");
                        if let Ok(snapshot) = doc.get().await {
                            last_seen = last_seen.max(snapshot.version);
                            listener(snapshot);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(ListenerHandle { task })
    }
}

impl QueryRef {
    /// Live collection subscription. Subscribes to the collection channel,
    /// delivers the initial result set, then folds publications into it —
    /// or re-fetches when the query carries order/limit.
    pub fn on_snapshot<F>(self, listener: F) -> ClientResult<ListenerHandle>
    where
        F: Fn(QuerySnapshot) + Send + Sync + 'static,
    {
        let broker = self
            .inner
            .broker
            .clone()
            .ok_or(ClientError::BrokerUnavailable)?;
        let mut rx = broker.subscribe(&collection_channel(&self.collection));
        let query = self;

        let task = tokio::spawn(async move {
            let spec = query.spec.sanitized();
            let mut results: IndexMap<String, QueryDocument> = IndexMap::new();
            let mut last_seen: Version = 0;

            if let Ok(snapshot) = query.get().await {
                for doc in &snapshot.docs {
                    last_seen = last_seen.max(doc.version);
                }
                results = snapshot
                    .docs
                    .iter()
                    .map(|doc| (doc.id.clone(), doc.clone()))
                    .collect();
                listener(snapshot);
            }

            let mut dirty = false;
            let mut refetch = false;
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(publication) => {
                            if publication.version <= last_seen {
                                continue;
                            }
                            last_seen = publication.version;
                            if spec.needs_refetch_on_change() {
                                refetch = true;
                            } else {
                                let id = publication.id.as_str().to_owned();
                                match publication.kind {
                                    ChangeKind::Deleted => {
                                        results.shift_remove(&id);
                                    }
                                    ChangeKind::Created | ChangeKind::Updated => {
                                        let data = publication.data.clone().unwrap_or_default();
                                        if spec.matches(&data) {
                                            results.insert(id, QueryDocument {
                                                id: publication.id.as_str().to_owned(),
                                                path: publication.path.clone(),
                                                data,
                                                version: publication.version,
                                            });
                                        } else {
                                            results.shift_remove(&id);
                                        }
                                    }
                                }
                            }
                            dirty = true;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "collection listener lagged; re-fetching");
                            refetch = true;
                            dirty = true;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    // Trailing-edge debounce: deliver once the burst quiets.
                    _ = tokio::time::sleep(DEBOUNCE), if dirty => {
                        if refetch {
                            if let Ok(snapshot) = query.get().await {
                                for doc in &snapshot.docs {
                                    last_seen = last_seen.max(doc.version);
                                }
                                results = snapshot
                                    .docs
                                    .iter()
                                    .map(|doc| (doc.id.clone(), doc.clone()))
                                    .collect();
                                listener(snapshot);
                                refetch = false;
                                dirty = false;
                            }
                            // On fetch failure stay dirty; the next tick or
                            // publication retries.
                        } else {
                            // Delta maintenance only runs for unordered,
                            // unlimited queries; insertion order stands in
                            // for storage order.
                            listener(QuerySnapshot {
                                docs: results.values().cloned().collect(),
                                metadata: SnapshotMetadata::default(),
                            });
                            dirty = false;
                        }
                    }
                }
            }
        });
        Ok(ListenerHandle { task })
    }
}
