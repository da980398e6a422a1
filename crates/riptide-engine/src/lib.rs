//! The document engine: authorizes every operation through the rules
//! engine, applies it atomically through the store, and dispatches
//! publications through the bus after the commit.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use riptide_auth::TokenIssuer;
use riptide_bus::{ChangePublisher, InProcessBroker, MessageBroker};
use riptide_protocol::{
    CollectionPath, CommittedWrite, Document, DocumentId, DocumentPath, EngineError, EngineResult,
    EventRecord, QuerySpec, UserId, Version, WorkspaceId, WriteOperation,
};
use riptide_rules::{AuthContext, RuleOperation, RulesEngine};
use riptide_store::SqliteStore;

const DEV_SIGNING_SECRET: &[u8] = b"riptide-dev-signing-secret";

#[derive(Default)]
pub struct EngineBuilder {
    db_path: Option<PathBuf>,
    rules: Option<RulesEngine>,
    broker: Option<Arc<dyn MessageBroker>>,
    signing_secret: Option<Vec<u8>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the database at `path` instead of in memory.
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn rules(mut self, rules: RulesEngine) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn signing_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub fn build(self) -> EngineResult<DocumentEngine> {
        let store = match &self.db_path {
            Some(path) => SqliteStore::open(path)?,
            None => SqliteStore::open_in_memory()?,
        };
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InProcessBroker::default()));
        Ok(DocumentEngine {
            store: Arc::new(store),
            rules: Arc::new(self.rules.unwrap_or_else(RulesEngine::permissive_defaults)),
            publisher: ChangePublisher::new(broker),
            tokens: Arc::new(TokenIssuer::new(
                self.signing_secret.as_deref().unwrap_or(DEV_SIGNING_SECRET),
            )),
        })
    }
}

#[derive(Clone)]
pub struct DocumentEngine {
    store: Arc<SqliteStore>,
    rules: Arc<RulesEngine>,
    publisher: ChangePublisher,
    tokens: Arc<TokenIssuer>,
}

impl DocumentEngine {
    /// The broker handle publications go out on; the server and demo share
    /// it with subscribing clients.
    pub fn broker(&self) -> Arc<dyn MessageBroker> {
        self.publisher.broker()
    }

    pub fn issue_token(&self, user_id: &UserId) -> EngineResult<String> {
        self.tokens.issue(user_id)
    }

    /// Create a document with a server-assigned id.
    #[instrument(skip(self, auth, data), fields(workspace = %workspace_id, collection))]
    pub async fn create(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        collection: &str,
        parent: Option<&DocumentPath>,
        data: Value,
    ) -> EngineResult<CommittedWrite> {
        let collection = CollectionPath::resolve(collection, parent)?;
        self.rules
            .authorize(collection.segments(), RuleOperation::Write, auth)?;
        let path = collection.doc(DocumentId::new_uuid());
        self.commit(workspace_id, auth, vec![WriteOperation::set(path, data)])
            .await
            .map(|mut writes| writes.remove(0))
    }

    /// Idempotent upsert; resurrects tombstoned ids.
    #[instrument(skip(self, auth, data), fields(workspace = %workspace_id, path = %path))]
    pub async fn set(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        path: DocumentPath,
        data: Value,
        expected_version: Option<Version>,
    ) -> EngineResult<CommittedWrite> {
        let mut operation = WriteOperation::set(path, data);
        if let Some(version) = expected_version {
            operation = operation.with_expected_version(version);
        }
        self.rules
            .authorize(operation.path().segments(), RuleOperation::Write, auth)?;
        self.commit(workspace_id, auth, vec![operation])
            .await
            .map(|mut writes| writes.remove(0))
    }

    /// Merge-patch update of an existing document.
    #[instrument(skip(self, auth, patch), fields(workspace = %workspace_id, path = %path))]
    pub async fn update(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        path: DocumentPath,
        patch: Value,
        expected_version: Option<Version>,
    ) -> EngineResult<CommittedWrite> {
        let mut operation = WriteOperation::update(path, patch);
        if let Some(version) = expected_version {
            operation = operation.with_expected_version(version);
        }
        self.rules
            .authorize(operation.path().segments(), RuleOperation::Write, auth)?;
        self.commit(workspace_id, auth, vec![operation])
            .await
            .map(|mut writes| writes.remove(0))
    }

    /// Soft delete; the id remains resurrectable by a later set.
    #[instrument(skip(self, auth), fields(workspace = %workspace_id, path = %path))]
    pub async fn delete(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        path: DocumentPath,
        expected_version: Option<Version>,
    ) -> EngineResult<CommittedWrite> {
        let mut operation = WriteOperation::delete(path);
        if let Some(version) = expected_version {
            operation = operation.with_expected_version(version);
        }
        self.rules
            .authorize(operation.path().segments(), RuleOperation::Delete, auth)?;
        self.commit(workspace_id, auth, vec![operation])
            .await
            .map(|mut writes| writes.remove(0))
    }

    #[instrument(skip(self, auth), fields(workspace = %workspace_id, path = %path))]
    pub async fn get(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        path: &DocumentPath,
    ) -> EngineResult<Document> {
        self.rules
            .authorize(path.segments(), RuleOperation::Read, auth)?;
        self.store
            .get(workspace_id, path)?
            .ok_or_else(|| EngineError::not_found(path.to_string()))
    }

    #[instrument(skip(self, auth), fields(workspace = %workspace_id, collection = %collection))]
    pub async fn list(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        collection: &CollectionPath,
    ) -> EngineResult<Vec<Document>> {
        self.rules
            .authorize(collection.segments(), RuleOperation::Read, auth)?;
        self.store.list(workspace_id, collection)
    }

    /// Filter/order/limit over the workspace, optionally scoped to one
    /// collection level. Workspace-wide results are filtered per document
    /// by the read rules instead of denied wholesale.
    #[instrument(skip(self, auth, spec), fields(workspace = %workspace_id))]
    pub async fn query(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        collection: Option<&CollectionPath>,
        spec: &QuerySpec,
    ) -> EngineResult<Vec<Document>> {
        if let Some(collection) = collection {
            self.rules
                .authorize(collection.segments(), RuleOperation::Read, auth)?;
            return self.store.query(workspace_id, Some(collection), spec);
        }
        let documents = self.store.query(workspace_id, None, spec)?;
        Ok(documents
            .into_iter()
            .filter(|doc| {
                self.rules
                    .evaluate(doc.path.segments(), RuleOperation::Read, auth)
            })
            .collect())
    }

    /// Atomic batch. Returns the final (largest) version; on any conflict or
    /// denial nothing is applied and the caller retries the whole batch.
    #[instrument(skip(self, auth, operations), fields(workspace = %workspace_id, operations = operations.len()))]
    pub async fn batch(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        operations: Vec<WriteOperation>,
    ) -> EngineResult<Version> {
        if operations.is_empty() {
            return Err(EngineError::malformed("batch contains no operations"));
        }
        for operation in &operations {
            let required = if operation.is_delete() {
                RuleOperation::Delete
            } else {
                RuleOperation::Write
            };
            self.rules
                .authorize(operation.path().segments(), required, auth)?;
        }
        let writes = self.commit(workspace_id, auth, operations).await?;
        Ok(writes.last().map(|write| write.version).unwrap_or(0))
    }

    /// The incremental sync feed: events after `since`, ascending, filtered
    /// by per-path read authorization.
    #[instrument(skip(self, auth), fields(workspace = %workspace_id, since))]
    pub async fn changes_since(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        since: Version,
    ) -> EngineResult<Vec<EventRecord>> {
        let events = self.store.events_since(workspace_id, since)?;
        Ok(events
            .into_iter()
            .filter(|event| match event.doc_path() {
                Ok(path) => self
                    .rules
                    .evaluate(path.segments(), RuleOperation::Read, auth),
                Err(_) => false,
            })
            .collect())
    }

    /// Drop and recreate the schema. Admin-only surface.
    pub async fn reset(&self) -> EngineResult<()> {
        self.store.reset()
    }

    async fn commit(
        &self,
        workspace_id: &WorkspaceId,
        auth: &AuthContext,
        operations: Vec<WriteOperation>,
    ) -> EngineResult<Vec<CommittedWrite>> {
        let caller = auth
            .user_id
            .clone()
            .ok_or_else(|| EngineError::denied("write requires a caller identity"))?;
        let committed = self.store.apply(workspace_id, &caller, &operations)?;
        self.publisher.publish_committed(&committed).await;
        Ok(committed)
    }
}
