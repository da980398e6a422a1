//! # riptide-client — the client SDK
//!
//! Offline-tolerant client for the document API: fluent collection/document
//! references, a durable cache with an outbound write queue, live
//! subscriptions over a broker handle, read-modify-write transactions, and
//! the periodic sync/drain triggers that converge local state with the
//! server after reconnection.

mod cache;
mod error;
mod http;
mod refs;
mod subscription;
mod transaction;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use riptide_bus::MessageBroker;
use riptide_protocol::{
    CollectionPath, DocumentPath, UserId, Version, WorkspaceId, WriteOperation,
};

pub use cache::{CachedDocument, ClientCache, QueueKind, QueuedOperation};
pub use error::{ClientError, ClientResult};
pub use refs::{
    CollectionRef, DocumentRef, DocumentSnapshot, QueryDocument, QueryRef, QuerySnapshot,
    SnapshotMetadata, WriteResult,
};
pub use subscription::ListenerHandle;
pub use transaction::Transaction;

const SYNC_INTERVAL: Duration = Duration::from_secs(30);
const DRAIN_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct ClientInner {
    transport: http::ApiTransport,
    cache: Option<ClientCache>,
    broker: Option<Arc<dyn MessageBroker>>,
}

impl ClientInner {
    fn path_has_pending(&self, path: &str) -> ClientResult<bool> {
        match &self.cache {
            Some(cache) => cache.has_pending(path),
            None => Ok(false),
        }
    }

    /// Fold a committed batch into the cache. The batch reports only its
    /// final version; cached entries converge exactly on the next read or
    /// sync tick.
    fn absorb_committed(
        &self,
        operations: &[WriteOperation],
        version: Version,
    ) -> ClientResult<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        for operation in operations {
            let key = operation.path().to_string();
            match operation {
                WriteOperation::Set { data, .. } => cache.put_document(
                    &key,
                    &CachedDocument {
                        data: data.clone(),
                        version,
                    },
                )?,
                WriteOperation::Update { data: patch, .. } => {
                    if let Some(mut cached) = cache.get_document(&key)? {
                        riptide_protocol::merge_patch(&mut cached.data, patch);
                        cached.version = version;
                        cache.put_document(&key, &cached)?;
                    }
                }
                WriteOperation::Delete { .. } => cache.remove_document(&key)?,
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    endpoint: Option<String>,
    workspace_id: Option<WorkspaceId>,
    user_id: Option<UserId>,
    broker: Option<Arc<dyn MessageBroker>>,
    cache_path: Option<PathBuf>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP base URL of the document API. Mandatory.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Workspace scope; defaults to `"default"`.
    pub fn workspace(mut self, workspace_id: impl Into<WorkspaceId>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Caller identity. Mandatory.
    pub fn user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Broker handle for live subscriptions. Absent, live features are
    /// disabled and everything else still works.
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Enable the durable cache and outbound queue at `path`. Off by
    /// default.
    pub fn persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn build(self) -> ClientResult<RiptideClient> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| ClientError::Malformed("endpoint is required".into()))?;
        let user_id = self
            .user_id
            .ok_or_else(|| ClientError::Malformed("userId is required".into()))?;
        let workspace_id = self
            .workspace_id
            .unwrap_or_else(WorkspaceId::default_workspace);
        let cache = self.cache_path.map(ClientCache::open).transpose()?;
        Ok(RiptideClient {
            inner: Arc::new(ClientInner {
                transport: http::ApiTransport::new(endpoint, workspace_id, user_id),
                cache,
                broker: self.broker,
            }),
        })
    }
}

/// Handles for the periodic sync and drain loops. Dropping (or `stop`)
/// cancels both.
pub struct BackgroundTasks {
    sync: JoinHandle<()>,
    drain: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn stop(self) {
        self.sync.abort();
        self.drain.abort();
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.sync.abort();
        self.drain.abort();
    }
}

#[derive(Clone)]
pub struct RiptideClient {
    inner: Arc<ClientInner>,
}

impl RiptideClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A collection reference; accepts nested collection paths like
    /// `users/u1/posts`.
    pub fn collection(&self, path: &str) -> ClientResult<CollectionRef> {
        Ok(CollectionRef {
            inner: self.inner.clone(),
            path: CollectionPath::parse(path)?,
        })
    }

    /// A document reference from a full path.
    pub fn doc(&self, path: &str) -> ClientResult<DocumentRef> {
        Ok(DocumentRef {
            inner: self.inner.clone(),
            path: DocumentPath::parse(path)?,
        })
    }

    /// Fetch a broker subscription token for this client's user.
    pub async fn token(&self) -> ClientResult<String> {
        self.inner.transport.token().await
    }

    /// The outbound queue, oldest first, for inspection. Requires
    /// persistence.
    pub fn pending_operations(&self) -> ClientResult<Vec<QueuedOperation>> {
        let Some(cache) = &self.inner.cache else {
            return Err(ClientError::PersistenceDisabled);
        };
        Ok(cache
            .queue()?
            .into_iter()
            .map(|(_, operation)| operation)
            .collect())
    }

    /// Drop every queued operation without replaying it. Requires
    /// persistence.
    pub fn clear_queue(&self) -> ClientResult<()> {
        let Some(cache) = &self.inner.cache else {
            return Err(ClientError::PersistenceDisabled);
        };
        cache.clear_queue()
    }

    /// Replay queued writes in order. The first failing entry halts the
    /// drain until the next trigger; everything drained is removed and its
    /// cached version made authoritative. Requires persistence.
    pub async fn drain_queue(&self) -> ClientResult<usize> {
        let Some(cache) = &self.inner.cache else {
            return Err(ClientError::PersistenceDisabled);
        };
        let mut drained = 0;
        for (key, operation) in cache.queue()? {
            let path = DocumentPath::parse(&operation.path)?;
            let outcome = match operation.kind {
                QueueKind::Set => {
                    self.inner
                        .transport
                        .set(
                            &path,
                            operation.data.as_ref().unwrap_or(&serde_json::Value::Null),
                            None,
                        )
                        .await
                }
                QueueKind::Update => {
                    self.inner
                        .transport
                        .update(
                            &path,
                            operation.data.as_ref().unwrap_or(&serde_json::Value::Null),
                            None,
                        )
                        .await
                }
                QueueKind::Delete => self
                    .inner
                    .transport
                    .delete(&path, None)
                    .await
                    .map(|()| 0),
            };
            match outcome {
                Ok(version) => {
                    match operation.kind {
                        QueueKind::Delete => cache.remove_document(&operation.path)?,
                        _ => {
                            if let Some(mut cached) = cache.get_document(&operation.path)? {
                                cached.version = version;
                                cache.put_document(&operation.path, &cached)?;
                            }
                        }
                    }
                    cache.dequeue(key)?;
                    drained += 1;
                }
                Err(error) => {
                    debug!(path = %operation.path, %error, "queue drain halted");
                    break;
                }
            }
        }
        Ok(drained)
    }

    /// Pull the change feed since the last cursor and fold it into the
    /// cache. Returns the number of applied events. Requires persistence.
    pub async fn sync_incremental(&self) -> ClientResult<usize> {
        let Some(cache) = &self.inner.cache else {
            return Err(ClientError::PersistenceDisabled);
        };
        let since = cache.last_synced_version()?;
        let page = self.inner.transport.sync_since(since).await?;
        for event in &page.changes {
            cache.apply_event(event)?;
        }
        if let Some(latest) = page.changes.last() {
            cache.set_last_synced_version(latest.version)?;
        }
        Ok(page.changes.len())
    }

    /// Start the periodic triggers: incremental sync every 30 s, queue
    /// drain every 5 s. Both are cheap when idle. Without persistence there
    /// is nothing to sync or drain, so no loops are spawned.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        if self.inner.cache.is_none() {
            return BackgroundTasks {
                sync: tokio::spawn(async {}),
                drain: tokio::spawn(async {}),
            };
        }
        let sync_client = self.clone();
        let sync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = sync_client.sync_incremental().await {
                    debug!(%error, "incremental sync skipped");
                }
            }
        });
        let drain_client = self.clone();
        let drain = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = drain_client.drain_queue().await {
                    debug!(%error, "queue drain skipped");
                }
            }
        });
        BackgroundTasks { sync, drain }
    }

    /// Run a read-modify-write transaction with OCC retries; see
    /// [`Transaction`].
    pub async fn run_transaction<F, Fut, T>(&self, body: F) -> ClientResult<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        transaction::run_transaction(self.inner.clone(), body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use riptide_bus::InProcessBroker;
    use riptide_engine::{DocumentEngine, EngineBuilder};
    use riptide_protocol::{Direction, FilterOp};
    use riptide_server::{AppState, router};
    use serde_json::{Value, json};
    use std::net::SocketAddr;

    struct Harness {
        base: String,
        engine: DocumentEngine,
        broker: Arc<InProcessBroker>,
        _dir: tempfile::TempDir,
        dir: PathBuf,
    }

    async fn serve_on(listener: tokio::net::TcpListener, engine: DocumentEngine) {
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(AppState::new(engine))).await;
        });
    }

    async fn harness() -> Result<Harness> {
        let broker = Arc::new(InProcessBroker::default());
        let engine = EngineBuilder::new().broker(broker.clone()).build()?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        serve_on(listener, engine.clone()).await;
        let dir = tempfile::tempdir()?;
        let dir_path = dir.path().to_owned();
        Ok(Harness {
            base: format!("http://{addr}"),
            engine,
            broker,
            _dir: dir,
            dir: dir_path,
        })
    }

    fn client_for(harness: &Harness, user: &str) -> RiptideClient {
        RiptideClient::builder()
            .endpoint(&harness.base)
            .user(user)
            .broker(harness.broker.clone())
            .persistence(harness.dir.join(format!("{user}.redb")))
            .build()
            .unwrap()
    }

    #[test]
    fn doc_path_round_trips_through_references() -> Result<()> {
        let client = RiptideClient::builder()
            .endpoint("http://127.0.0.1:1")
            .user("u1")
            .build()?;
        for raw in ["items/a", "users/u1/posts/p1"] {
            let reference = client.doc(raw)?;
            let again = client.doc(&reference.path().to_string())?;
            assert_eq!(again.path(), reference.path());
        }
        assert!(client.doc("items").is_err());

        let nested = client.collection("users")?.doc("u1").collection("posts");
        assert_eq!(nested.path().to_string(), "users/u1/posts");
        Ok(())
    }

    #[tokio::test]
    async fn cache_gated_operations_require_persistence() -> Result<()> {
        // Nothing listens on the parked address, so reads cannot reach the
        // server and writes have no queue to fall back on.
        let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = parked.local_addr()?;
        drop(parked);
        let client = RiptideClient::builder()
            .endpoint(format!("http://{addr}"))
            .user("u1")
            .build()?;

        assert!(matches!(
            client.pending_operations(),
            Err(ClientError::PersistenceDisabled)
        ));
        assert!(matches!(
            client.clear_queue(),
            Err(ClientError::PersistenceDisabled)
        ));
        assert!(matches!(
            client.drain_queue().await,
            Err(ClientError::PersistenceDisabled)
        ));
        assert!(matches!(
            client.sync_incremental().await,
            Err(ClientError::PersistenceDisabled)
        ));

        // Offline reads distinguish "no cache configured" from a cold or
        // stale cache, which keeps the network error instead.
        assert!(matches!(
            client.doc("items/a")?.get().await,
            Err(ClientError::PersistenceDisabled)
        ));
        assert!(matches!(
            client.collection("items")?.get().await,
            Err(ClientError::PersistenceDisabled)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn online_writes_round_trip_and_leave_no_queue() -> Result<()> {
        let harness = harness().await?;
        let client = client_for(&harness, "u1");

        let result = client.doc("items/a")?.set(json!({"n": 1})).await?;
        assert!(result.version > 0);
        assert!(client.pending_operations()?.is_empty());

        let snapshot = client.doc("items/a")?.get().await?;
        assert!(snapshot.exists());
        assert_eq!(snapshot.data, Some(json!({"n": 1})));
        assert!(!snapshot.metadata.from_cache);
        assert!(!snapshot.metadata.has_pending_writes);

        client.doc("items/a")?.delete().await?;
        let snapshot = client.doc("items/a")?.get().await?;
        assert!(!snapshot.exists());
        Ok(())
    }

    #[tokio::test]
    async fn offline_write_queues_then_replays_on_drain() -> Result<()> {
        // Reserve a port, keep it closed while the client is "offline".
        let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = parked.local_addr()?;
        drop(parked);

        let broker = Arc::new(InProcessBroker::default());
        let engine = EngineBuilder::new().broker(broker.clone()).build()?;
        let dir = tempfile::tempdir()?;
        let client = RiptideClient::builder()
            .endpoint(format!("http://{addr}"))
            .user("u1")
            .persistence(dir.path().join("offline.redb"))
            .build()?;

        // The write resolves optimistically with the pending sentinel.
        let result = client.doc("items/a")?.set(json!({"n": 5})).await?;
        assert!(result.is_pending());
        assert_eq!(client.pending_operations()?.len(), 1);

        let snapshot = client.doc("items/a")?.get().await?;
        assert!(snapshot.metadata.from_cache);
        assert!(snapshot.metadata.has_pending_writes);
        assert_eq!(snapshot.data, Some(json!({"n": 5})));

        // The network comes back on the same address; the drain converges.
        let listener = tokio::net::TcpListener::bind(addr).await?;
        serve_on(listener, engine.clone()).await;
        let drained = client.drain_queue().await?;
        assert_eq!(drained, 1);
        assert!(client.pending_operations()?.is_empty());

        let snapshot = client.doc("items/a")?.get().await?;
        assert!(snapshot.version > 0);
        assert!(!snapshot.metadata.has_pending_writes);
        assert_eq!(snapshot.data, Some(json!({"n": 5})));
        Ok(())
    }

    #[tokio::test]
    async fn offline_query_runs_the_local_matcher() -> Result<()> {
        let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = parked.local_addr()?;
        let dir = tempfile::tempdir()?;
        let client = RiptideClient::builder()
            .endpoint(format!("http://{addr}"))
            .user("u1")
            .persistence(dir.path().join("local.redb"))
            .build()?;
        drop(parked);

        // Prime the cache as if earlier online reads had populated it.
        for (id, status, priority) in [
            ("t1", "active", 1),
            ("t2", "done", 9),
            ("t3", "active", 5),
        ] {
            client.doc(&format!("tasks/{id}"))?.set(json!({
                "status": status,
                "priority": priority,
            }))
            .await?;
        }

        let snapshot = client
            .collection("tasks")?
            .where_field("status", FilterOp::Eq, json!("active"))
            .order_by("priority", Direction::Desc)
            .get()
            .await?;
        assert!(snapshot.metadata.from_cache);
        assert!(snapshot.metadata.has_pending_writes);
        let ids: Vec<&str> = snapshot.docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t1"]);
        Ok(())
    }

    #[tokio::test]
    async fn incremental_sync_folds_the_change_feed() -> Result<()> {
        let harness = harness().await?;
        let writer = client_for(&harness, "writer");
        let reader = client_for(&harness, "reader");

        writer.doc("items/a")?.set(json!({"n": 1, "keep": true})).await?;
        writer.doc("items/a")?.update(json!({"n": 2})).await?;
        writer.doc("items/b")?.set(json!({"n": 3})).await?;
        writer.doc("items/b")?.delete().await?;

        let applied = reader.sync_incremental().await?;
        assert_eq!(applied, 4);

        // Replaying from the cursor is idempotent and cheap when idle.
        assert_eq!(reader.sync_incremental().await?, 0);

        // The cache now mirrors authoritative state without any reads.
        drop(reader);
        let parked = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let dead = parked.local_addr()?;
        drop(parked);
        let offline_view = RiptideClient::builder()
            .endpoint(format!("http://{dead}"))
            .user("reader")
            .persistence(harness.dir.join("reader.redb"))
            .build()?;
        let snapshot = offline_view.doc("items/a")?.get().await?;
        assert!(snapshot.metadata.from_cache);
        assert_eq!(snapshot.data, Some(json!({"n": 2, "keep": true})));
        let snapshot = offline_view.collection("items")?.get().await?;
        assert_eq!(snapshot.docs.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn live_document_subscription_follows_updates_and_delete() -> Result<()> {
        let harness = harness().await?;
        let client = client_for(&harness, "u1");
        client.doc("items/a")?.set(json!({"n": 0})).await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = client.doc("items/a")?.on_snapshot(move |snapshot| {
            let _ = tx.send(snapshot);
        })?;

        // Initial delivery.
        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.data, Some(json!({"n": 0})));

        client.doc("items/a")?.update(json!({"n": 1})).await?;
        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.data, Some(json!({"n": 1})));

        client.doc("items/a")?.delete().await?;
        let gone = rx.recv().await.unwrap();
        assert!(!gone.exists());

        handle.dispose();
        Ok(())
    }

    #[tokio::test]
    async fn live_filtered_query_refetches_in_order() -> Result<()> {
        let harness = harness().await?;
        let client = client_for(&harness, "u1");
        for (id, priority) in [("t1", 5), ("t2", 3)] {
            client.doc(&format!("tasks/{id}"))?.set(json!({
                "status": "active",
                "priority": priority,
            }))
            .await?;
        }

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = client
            .collection("tasks")?
            .where_field("status", FilterOp::Eq, json!("active"))
            .order_by("priority", Direction::Desc)
            .limit(2)
            .on_snapshot(move |snapshot| {
                let _ = tx.send(snapshot);
            })?;

        let initial = rx.recv().await.unwrap();
        let ids: Vec<&str> = initial.docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        // A higher-priority task lands in the top slot; the previous
        // second entry falls off the limit boundary.
        client.doc("tasks/t9")?.set(json!({
            "status": "active",
            "priority": 9,
        }))
        .await?;
        let refreshed = rx.recv().await.unwrap();
        let ids: Vec<&str> = refreshed.docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["t9", "t1"]);

        handle.dispose();
        Ok(())
    }

    #[tokio::test]
    async fn unfiltered_live_query_applies_deltas_locally() -> Result<()> {
        let harness = harness().await?;
        let client = client_for(&harness, "u1");
        client.doc("notes/n1")?.set(json!({"text": "one"})).await?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = client
            .collection("notes")?
            .query()
            .on_snapshot(move |snapshot| {
                let _ = tx.send(snapshot);
            })?;
        assert_eq!(rx.recv().await.unwrap().docs.len(), 1);

        client.doc("notes/n2")?.set(json!({"text": "two"})).await?;
        let grown = rx.recv().await.unwrap();
        assert_eq!(grown.docs.len(), 2);

        client.doc("notes/n1")?.delete().await?;
        let shrunk = rx.recv().await.unwrap();
        assert_eq!(shrunk.docs.len(), 1);
        assert_eq!(shrunk.docs[0].id, "n2");

        handle.dispose();
        Ok(())
    }

    #[tokio::test]
    async fn transaction_retries_conflicts_and_converges() -> Result<()> {
        use std::sync::atomic::{AtomicU32, Ordering};

        let harness = harness().await?;
        let client = client_for(&harness, "u1");
        client.doc("counters/c1")?.set(json!({"n": 10})).await?;

        let attempts = Arc::new(AtomicU32::new(0));
        let engine = harness.engine.clone();
        let counted = attempts.clone();
        let worker = client.clone();
        client
            .run_transaction(move |tx| {
                let client = worker.clone();
                let engine = engine.clone();
                let counted = counted.clone();
                async move {
                    let doc = client.doc("counters/c1")?;
                    let snapshot = tx.get(&doc).await?;
                    let n = snapshot.data.as_ref().and_then(|d| d["n"].as_i64()).unwrap_or(0);

                    // First attempt: an external writer slips in between the
                    // read and the commit, forcing a version conflict.
                    if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                        engine
                            .set(
                                &WorkspaceId::default_workspace(),
                                &riptide_rules::AuthContext::user("intruder"),
                                riptide_protocol::DocumentPath::parse("counters/c1")?,
                                json!({"n": n + 100}),
                                None,
                            )
                            .await
                            .map_err(ClientError::from)?;
                    }
                    tx.update(&doc, json!({"n": n + 1}));
                    Ok(())
                }
            })
            .await?;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let final_state = harness
            .engine
            .get(
                &WorkspaceId::default_workspace(),
                &riptide_rules::AuthContext::user("u1"),
                &riptide_protocol::DocumentPath::parse("counters/c1")?,
            )
            .await
            .map_err(ClientError::from)?;
        // The retry re-read n=110 and incremented that, not the stale 10.
        assert_eq!(final_state.data, json!({"n": 111}));
        Ok(())
    }

    #[tokio::test]
    async fn transaction_without_writes_commits_nothing() -> Result<()> {
        let harness = harness().await?;
        let client = client_for(&harness, "u1");
        client.doc("items/a")?.set(json!({"n": 1})).await?;

        let seen: Value = client
            .run_transaction(|tx| {
                let client = client.clone();
                async move {
                    let snapshot = tx.get(&client.doc("items/a")?).await?;
                    Ok(snapshot.data.unwrap_or(Value::Null))
                }
            })
            .await?;
        assert_eq!(seen, json!({"n": 1}));
        Ok(())
    }
}
