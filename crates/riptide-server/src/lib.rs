//! HTTP surface: axum router and handlers over the document engine.
//!
//! All bodies are JSON with camelCase fields; CORS is permissive; requests
//! are traced. Engine errors map onto status codes: 409 version conflict,
//! 403 permission denied, 404 not found, 400 malformed, 500 otherwise.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use riptide_engine::DocumentEngine;
use riptide_protocol::{
    CollectionPath, Document, DocumentPath, EngineError, EventRecord, QuerySpec, UserId, Version,
    WorkspaceId, WriteOperation,
};
use riptide_rules::AuthContext;

#[derive(Clone)]
pub struct AppState {
    pub engine: DocumentEngine,
    admin_token: Option<String>,
}

impl AppState {
    /// State with the admin surface disabled: `internal/reset` refuses
    /// every caller until a token is configured.
    pub fn new(engine: DocumentEngine) -> Self {
        Self {
            engine,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }
}

/// Build the full router. The binary serves it; the demo and tests mount it
/// on an ephemeral listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/documents/auth/token", post(issue_token))
        .route("/documents/batch", post(commit_batch))
        .route("/documents/sync", get(sync_changes))
        .route("/documents/query", get(run_query))
        .route("/documents/internal/reset", post(reset_store))
        .route("/documents/{collection}", post(create_document).get(list_collection))
        .route(
            "/documents/{collection}/{id}",
            put(set_document)
                .patch(update_document)
                .get(get_document)
                .delete(delete_document),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::VersionConflict { .. } => StatusCode::CONFLICT,
            EngineError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Malformed(_) => StatusCode::BAD_REQUEST,
            EngineError::Storage(_) | EngineError::Broker(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn workspace_or_default(raw: Option<String>) -> WorkspaceId {
    raw.map(WorkspaceId::from_string)
        .unwrap_or_else(WorkspaceId::default_workspace)
}

fn auth_from(user_id: Option<String>) -> AuthContext {
    match user_id {
        Some(id) if !id.is_empty() => AuthContext::user(id),
        _ => AuthContext::anonymous(),
    }
}

fn parse_parent(raw: Option<&str>) -> ApiResult<Option<DocumentPath>> {
    raw.filter(|raw| !raw.is_empty())
        .map(|raw| DocumentPath::parse(raw).map_err(ApiError::from))
        .transpose()
}

fn doc_path(collection: &str, id: &str, parent: Option<&DocumentPath>) -> ApiResult<DocumentPath> {
    Ok(CollectionPath::resolve(collection, parent)?.doc(id))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest {
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user_id = request
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("userId is required"))?;
    let token = state.engine.issue_token(&UserId::from_string(user_id))?;
    Ok(Json(TokenResponse { token }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    data: Value,
    user_id: Option<String>,
    workspace_id: Option<String>,
    parent_path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    id: String,
    path: String,
    version: Version,
}

async fn create_document(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(request): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<CreateResponse>)> {
    let parent = parse_parent(request.parent_path.as_deref())?;
    let committed = state
        .engine
        .create(
            &workspace_or_default(request.workspace_id),
            &auth_from(request.user_id),
            &collection,
            parent.as_ref(),
            request.data,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateResponse {
            id: committed.doc_id.as_str().to_owned(),
            path: committed.path.to_string(),
            version: committed.version,
        }),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopeQuery {
    workspace_id: Option<String>,
    parent_path: Option<String>,
    user_id: Option<String>,
    expected_version: Option<Version>,
}

async fn list_collection(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Json<Vec<Document>>> {
    let parent = parse_parent(scope.parent_path.as_deref())?;
    let collection = CollectionPath::resolve(&collection, parent.as_ref())?;
    let documents = state
        .engine
        .list(
            &workspace_or_default(scope.workspace_id),
            &auth_from(scope.user_id),
            &collection,
        )
        .await?;
    Ok(Json(documents))
}

async fn get_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(scope): Query<ScopeQuery>,
) -> ApiResult<Json<Document>> {
    let parent = parse_parent(scope.parent_path.as_deref())?;
    let path = doc_path(&collection, &id, parent.as_ref())?;
    let document = state
        .engine
        .get(
            &workspace_or_default(scope.workspace_id),
            &auth_from(scope.user_id),
            &path,
        )
        .await?;
    Ok(Json(document))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest {
    data: Value,
    user_id: Option<String>,
    workspace_id: Option<String>,
    parent_path: Option<String>,
    expected_version: Option<Version>,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    success: bool,
    version: Version,
}

async fn set_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<(StatusCode, Json<WriteResponse>)> {
    let parent = parse_parent(request.parent_path.as_deref())?;
    let path = doc_path(&collection, &id, parent.as_ref())?;
    let committed = state
        .engine
        .set(
            &workspace_or_default(request.workspace_id),
            &auth_from(request.user_id),
            path,
            request.data,
            request.expected_version,
        )
        .await?;
    let status = match committed.change {
        riptide_protocol::ChangeKind::Created => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((
        status,
        Json(WriteResponse {
            success: true,
            version: committed.version,
        }),
    ))
}

async fn update_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(request): Json<WriteRequest>,
) -> ApiResult<Json<WriteResponse>> {
    let parent = parse_parent(request.parent_path.as_deref())?;
    let path = doc_path(&collection, &id, parent.as_ref())?;
    let committed = state
        .engine
        .update(
            &workspace_or_default(request.workspace_id),
            &auth_from(request.user_id),
            path,
            request.data,
            request.expected_version,
        )
        .await?;
    Ok(Json(WriteResponse {
        success: true,
        version: committed.version,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteBody {
    expected_version: Option<Version>,
}

async fn delete_document(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Query(scope): Query<ScopeQuery>,
    body: axum::body::Bytes,
) -> ApiResult<StatusCode> {
    let parent = parse_parent(scope.parent_path.as_deref())?;
    let path = doc_path(&collection, &id, parent.as_ref())?;
    // The body is optional; a bare DELETE carries no precondition.
    let from_body = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<DeleteBody>(&body)
            .map_err(|error| ApiError::bad_request(format!("bad delete body: {error}")))?
            .expected_version
    };
    state
        .engine
        .delete(
            &workspace_or_default(scope.workspace_id),
            &auth_from(scope.user_id),
            path,
            scope.expected_version.or(from_body),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    operations: Vec<WriteOperation>,
    user_id: Option<String>,
    workspace_id: Option<String>,
}

async fn commit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<Json<WriteResponse>> {
    let version = state
        .engine
        .batch(
            &workspace_or_default(request.workspace_id),
            &auth_from(request.user_id),
            request.operations,
        )
        .await?;
    Ok(Json(WriteResponse {
        success: true,
        version,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncQuery {
    workspace_id: Option<String>,
    since: Option<Version>,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    changes: Vec<EventRecord>,
    server_time: DateTime<Utc>,
}

async fn sync_changes(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<SyncResponse>> {
    let changes = state
        .engine
        .changes_since(
            &workspace_or_default(query.workspace_id),
            &auth_from(query.user_id),
            query.since.unwrap_or(0),
        )
        .await?;
    Ok(Json(SyncResponse {
        changes,
        server_time: Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    workspace_id: Option<String>,
    collection: Option<String>,
    parent_path: Option<String>,
    filters: Option<String>,
    order_by_field: Option<String>,
    order_direction: Option<String>,
    limit: Option<u32>,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryHit {
    id: String,
    data: Value,
    version: Version,
}

async fn run_query(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Json<Vec<QueryHit>>> {
    let filters = match params.filters.as_deref().filter(|raw| !raw.is_empty()) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|error| ApiError::bad_request(format!("bad filters: {error}")))?,
        None => Vec::new(),
    };
    let order_by = match (params.order_by_field, params.order_direction.as_deref()) {
        (Some(field), direction) => Some(riptide_protocol::OrderBy {
            field,
            direction: match direction {
                Some("desc") | Some("DESC") => riptide_protocol::Direction::Desc,
                _ => riptide_protocol::Direction::Asc,
            },
        }),
        (None, _) => None,
    };
    let spec = QuerySpec {
        filters,
        order_by,
        limit: params.limit,
    };
    let parent = parse_parent(params.parent_path.as_deref())?;
    let collection = params
        .collection
        .filter(|name| !name.is_empty())
        .map(|name| CollectionPath::resolve(&name, parent.as_ref()))
        .transpose()?;
    let documents = state
        .engine
        .query(
            &workspace_or_default(params.workspace_id),
            &auth_from(params.user_id),
            collection.as_ref(),
            &spec,
        )
        .await?;
    Ok(Json(
        documents
            .into_iter()
            .map(|doc| QueryHit {
                id: doc.id.as_str().to_owned(),
                data: doc.data,
                version: doc.version,
            })
            .collect(),
    ))
}

/// Admin only: the caller must present the configured admin token as a
/// bearer credential. With no token configured the route refuses everyone.
async fn reset_store(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    match (&state.admin_token, presented) {
        (Some(expected), Some(presented)) if presented == expected => {}
        _ => return Err(ApiError::forbidden("reset requires the admin token")),
    }
    state.engine.reset().await?;
    Ok(Json(json!({ "message": "schema reset" })))
}
