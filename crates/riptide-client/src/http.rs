//! HTTP transport: the typed face of the server's `/documents` surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use riptide_protocol::{
    CollectionPath, Document, DocumentPath, EventRecord, QuerySpec, UserId, Version, WorkspaceId,
    WriteOperation,
};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedDocument {
    pub id: String,
    pub path: DocumentPath,
    pub version: Version,
}

#[derive(Debug, Clone, Deserialize)]
struct WriteAck {
    #[allow(dead_code)]
    success: bool,
    version: Version,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryHit {
    pub id: String,
    pub data: Value,
    pub version: Version,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    pub changes: Vec<EventRecord>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteBody<'a> {
    data: &'a Value,
    user_id: &'a str,
    workspace_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_version: Option<Version>,
}

pub struct ApiTransport {
    http: reqwest::Client,
    endpoint: String,
    workspace_id: WorkspaceId,
    user_id: UserId,
}

impl ApiTransport {
    pub fn new(endpoint: impl Into<String>, workspace_id: WorkspaceId, user_id: UserId) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_owned(),
            workspace_id,
            user_id,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/documents/{suffix}", self.endpoint)
    }

    /// Splits a document path into the route shape the server expects:
    /// final collection + id in the URL, everything above as `parentPath`.
    fn doc_route(&self, path: &DocumentPath) -> (String, Option<String>) {
        let collection = path.parent();
        let parent = collection.parent().map(|doc| doc.to_string());
        (
            format!("{}/{}", collection.name(), path.doc_id()),
            parent,
        )
    }

    async fn handle<T: serde::de::DeserializeOwned>(
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> ClientResult<T> {
        let response = response.map_err(|error| ClientError::Network(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|error| ClientError::Server(format!("bad response body: {error}")))
        } else {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| status.to_string());
            Err(ClientError::from_status(status.as_u16(), message))
        }
    }

    pub async fn token(&self) -> ClientResult<String> {
        #[derive(Deserialize)]
        struct TokenAck {
            token: String,
        }
        let ack: TokenAck = Self::handle(
            self.http
                .post(self.url("auth/token"))
                .json(&serde_json::json!({ "userId": self.user_id.as_str() }))
                .send()
                .await,
        )
        .await?;
        Ok(ack.token)
    }

    pub async fn create(
        &self,
        collection: &str,
        parent: Option<&DocumentPath>,
        data: &Value,
    ) -> ClientResult<CreatedDocument> {
        let body = WriteBody {
            data,
            user_id: self.user_id.as_str(),
            workspace_id: self.workspace_id.as_str(),
            parent_path: parent.map(|path| path.to_string()),
            expected_version: None,
        };
        Self::handle(
            self.http
                .post(self.url(collection))
                .json(&body)
                .send()
                .await,
        )
        .await
    }

    pub async fn get(&self, path: &DocumentPath) -> ClientResult<Document> {
        let (route, parent) = self.doc_route(path);
        let mut request = self.http.get(self.url(&route)).query(&[
            ("workspaceId", self.workspace_id.as_str()),
            ("userId", self.user_id.as_str()),
        ]);
        if let Some(parent) = parent {
            request = request.query(&[("parentPath", parent)]);
        }
        Self::handle(request.send().await).await
    }

    pub async fn list(&self, collection: &CollectionPath) -> ClientResult<Vec<Document>> {
        let mut request = self
            .http
            .get(self.url(collection.name()))
            .query(&[
                ("workspaceId", self.workspace_id.as_str()),
                ("userId", self.user_id.as_str()),
            ]);
        if let Some(parent) = collection.parent() {
            request = request.query(&[("parentPath", parent.to_string())]);
        }
        Self::handle(request.send().await).await
    }

    pub async fn set(
        &self,
        path: &DocumentPath,
        data: &Value,
        expected_version: Option<Version>,
    ) -> ClientResult<Version> {
        let (route, parent) = self.doc_route(path);
        let body = WriteBody {
            data,
            user_id: self.user_id.as_str(),
            workspace_id: self.workspace_id.as_str(),
            parent_path: parent,
            expected_version,
        };
        let ack: WriteAck =
            Self::handle(self.http.put(self.url(&route)).json(&body).send().await).await?;
        Ok(ack.version)
    }

    pub async fn update(
        &self,
        path: &DocumentPath,
        patch: &Value,
        expected_version: Option<Version>,
    ) -> ClientResult<Version> {
        let (route, parent) = self.doc_route(path);
        let body = WriteBody {
            data: patch,
            user_id: self.user_id.as_str(),
            workspace_id: self.workspace_id.as_str(),
            parent_path: parent,
            expected_version,
        };
        let ack: WriteAck =
            Self::handle(self.http.patch(self.url(&route)).json(&body).send().await).await?;
        Ok(ack.version)
    }

    pub async fn delete(
        &self,
        path: &DocumentPath,
        expected_version: Option<Version>,
    ) -> ClientResult<()> {
        let (route, parent) = self.doc_route(path);
        let mut request = self.http.delete(self.url(&route)).query(&[
            ("workspaceId", self.workspace_id.as_str()),
            ("userId", self.user_id.as_str()),
        ]);
        if let Some(parent) = parent {
            request = request.query(&[("parentPath", parent)]);
        }
        if let Some(version) = expected_version {
            request = request.query(&[("expectedVersion", version.to_string())]);
        }
        let response = request
            .send()
            .await
            .map_err(|error| ClientError::Network(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("error").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| status.to_string());
            Err(ClientError::from_status(status.as_u16(), message))
        }
    }

    pub async fn batch(&self, operations: &[WriteOperation]) -> ClientResult<Version> {
        let body = serde_json::json!({
            "operations": operations,
            "userId": self.user_id.as_str(),
            "workspaceId": self.workspace_id.as_str(),
        });
        let ack: WriteAck =
            Self::handle(self.http.post(self.url("batch")).json(&body).send().await).await?;
        Ok(ack.version)
    }

    pub async fn query(
        &self,
        collection: &CollectionPath,
        spec: &QuerySpec,
    ) -> ClientResult<Vec<QueryHit>> {
        let filters = serde_json::to_string(&spec.filters)
            .map_err(|error| ClientError::Malformed(error.to_string()))?;
        let mut request = self.http.get(self.url("query")).query(&[
            ("workspaceId", self.workspace_id.as_str()),
            ("userId", self.user_id.as_str()),
            ("collection", collection.name()),
            ("filters", filters.as_str()),
        ]);
        if let Some(parent) = collection.parent() {
            request = request.query(&[("parentPath", parent.to_string())]);
        }
        if let Some(order) = &spec.order_by {
            let direction = match order.direction {
                riptide_protocol::Direction::Asc => "asc",
                riptide_protocol::Direction::Desc => "desc",
            };
            request = request.query(&[
                ("orderByField", order.field.as_str()),
                ("orderDirection", direction),
            ]);
        }
        if let Some(limit) = spec.limit {
            request = request.query(&[("limit", limit.to_string())]);
        }
        Self::handle(request.send().await).await
    }

    pub async fn sync_since(&self, since: Version) -> ClientResult<SyncPage> {
        let request = self.http.get(self.url("sync")).query(&[
            ("workspaceId", self.workspace_id.as_str()),
            ("userId", self.user_id.as_str()),
            ("since", &since.to_string()),
        ]);
        Self::handle(request.send().await).await
    }
}
