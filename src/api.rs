//! HTTP control-plane surface
//!
//! axum router over the gateway context: Connection lifecycle, schema
//! refresh, query, CSV lifecycle, the agent session endpoint, and the
//! status subscriber endpoint. Every handler authenticates against the
//! external identity provider and returns stable-coded errors.

use axum::Json;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tracing::debug;

use crate::context::GatewayContext;
use crate::domain::{ConnectionId, DbKind, FileId, UserId};
use crate::error::{GatewayError, GatewayResult};
use crate::orchestrator::{QueryAnswer, QueryInput, owned_agent_set};
use crate::protocol::{TableSchema, close};
use crate::session::agent_ws_handler;
use crate::status::origin_allowed;
use crate::store::{FileRecord, now_unix};

/// Builds the complete router over one gateway context
#[must_use]
pub fn create_app(ctx: Arc<GatewayContext>) -> axum::Router {
    let concurrency_limit = ctx.config.http_concurrency_limit.as_usize();
    axum::Router::new()
        .route("/health", get(health))
        .route("/api/v1/connections", post(create_connection).get(list_connections))
        .route(
            "/api/v1/connections/{id}",
            get(get_connection).delete(delete_connection),
        )
        .route("/api/v1/connections/{id}/schema/refresh", post(refresh_schema))
        .route("/api/v1/query", post(run_query))
        .route("/api/v1/files", post(upload_file).get(list_files))
        .route("/api/v1/files/{id}", axum::routing::delete(delete_file))
        .route("/api/v1/files/{id}/url", get(signed_url))
        .route("/api/v1/logout", post(logout))
        .route("/agent/ws", get(agent_ws_handler))
        .route("/status/ws", get(status_ws))
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .with_state(ctx)
}

async fn authenticate(ctx: &GatewayContext, headers: &HeaderMap) -> GatewayResult<UserId> {
    let token = bearer_token(headers).ok_or(GatewayError::Unauthorized)?;
    ctx.identity.authenticate(token).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Liveness probe
#[allow(clippy::unused_async)] // axum handlers must be async
async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct CreateConnectionRequest {
    name: String,
    db_type: DbKind,
}

#[derive(Debug, Serialize)]
struct CreateConnectionResponse {
    connection_id: ConnectionId,
    agent_id: crate::domain::AgentId,
    /// Returned exactly once; only a digest is stored
    agent_key: String,
    websocket_url: String,
}

async fn create_connection(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Json(request): Json<CreateConnectionRequest>,
) -> GatewayResult<(StatusCode, Json<CreateConnectionResponse>)> {
    let user = authenticate(&ctx, &headers).await?;
    let (record, agent_key) = ctx
        .create_connection(user, request.name, request.db_type)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateConnectionResponse {
            connection_id: record.connection_id,
            agent_id: record.agent_id,
            agent_key: agent_key.reveal().to_string(),
            websocket_url: format!("ws://{}/agent/ws", ctx.config.bind_addr),
        }),
    ))
}

#[derive(Debug, Serialize)]
struct ConnectionSummary {
    connection_id: ConnectionId,
    name: String,
    db_type: DbKind,
    agent_id: crate::domain::AgentId,
    created_at: i64,
    connected: bool,
}

async fn list_connections(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<ConnectionSummary>>> {
    let user = authenticate(&ctx, &headers).await?;
    let records = ctx.store.list_connections(&user).await?;
    let summaries = records
        .into_iter()
        .map(|record| ConnectionSummary {
            connection_id: record.connection_id,
            name: record.name,
            db_type: record.db_kind,
            agent_id: record.agent_id,
            created_at: record.created_at,
            connected: ctx.registry.is_connected(record.agent_id),
        })
        .collect();
    Ok(Json(summaries))
}

async fn get_connection(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Path(id): Path<ConnectionId>,
) -> GatewayResult<Json<ConnectionSummary>> {
    let user = authenticate(&ctx, &headers).await?;
    let record = ctx.owned_connection(&user, id).await?;
    Ok(Json(ConnectionSummary {
        connection_id: record.connection_id,
        name: record.name,
        db_type: record.db_kind,
        agent_id: record.agent_id,
        created_at: record.created_at,
        connected: ctx.registry.is_connected(record.agent_id),
    }))
}

async fn delete_connection(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Path(id): Path<ConnectionId>,
) -> GatewayResult<StatusCode> {
    let user = authenticate(&ctx, &headers).await?;
    ctx.delete_connection(&user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct SchemaResponse {
    schema: Vec<TableSchema>,
    captured_at: i64,
}

async fn refresh_schema(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Path(id): Path<ConnectionId>,
) -> GatewayResult<Json<SchemaResponse>> {
    let user = authenticate(&ctx, &headers).await?;
    let snapshot = ctx.refresh_schema(&user, id).await?;
    Ok(Json(SchemaResponse {
        schema: snapshot.tables,
        captured_at: snapshot.captured_at,
    }))
}

async fn run_query(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Json(input): Json<QueryInput>,
) -> GatewayResult<Json<QueryAnswer>> {
    let user = authenticate(&ctx, &headers).await?;
    if ctx.is_shutting_down() {
        return Err(GatewayError::Shutdown);
    }
    let answer = ctx.orchestrator.answer(&user, input).await?;
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
struct UploadFileRequest {
    filename: String,
    content_base64: String,
}

#[derive(Debug, Serialize)]
struct FileSummary {
    file_id: FileId,
    filename: String,
    size_bytes: i64,
    created_at: i64,
}

impl From<FileRecord> for FileSummary {
    fn from(record: FileRecord) -> Self {
        Self {
            file_id: record.file_id,
            filename: record.filename,
            size_bytes: record.size_bytes,
            created_at: record.created_at,
        }
    }
}

async fn upload_file(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Json(request): Json<UploadFileRequest>,
) -> GatewayResult<(StatusCode, Json<FileSummary>)> {
    let user = authenticate(&ctx, &headers).await?;
    let bytes = STANDARD
        .decode(request.content_base64.as_bytes())
        .map_err(|_| GatewayError::internal("file content is not valid base64"))?;
    if bytes.len() as u64 > ctx.config.csv_source_cap.as_u64() {
        return Err(GatewayError::TooLarge {
            what: "CSV source",
            cap: ctx.config.csv_source_cap.as_u64(),
        });
    }

    let record = FileRecord {
        file_id: FileId::generate(),
        owner: user,
        filename: request.filename,
        size_bytes: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
        created_at: now_unix(),
    };
    ctx.blob.put(record.file_id, Bytes::from(bytes)).await?;
    ctx.store.create_file(&record).await?;
    Ok((StatusCode::CREATED, Json(FileSummary::from(record))))
}

async fn list_files(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
) -> GatewayResult<Json<Vec<FileSummary>>> {
    let user = authenticate(&ctx, &headers).await?;
    let records = ctx.store.list_files(&user).await?;
    Ok(Json(records.into_iter().map(FileSummary::from).collect()))
}

async fn owned_file(
    ctx: &GatewayContext,
    user: &UserId,
    file_id: FileId,
) -> GatewayResult<FileRecord> {
    let record = ctx
        .store
        .get_file(file_id)
        .await?
        .ok_or(GatewayError::NotFound { entity: "file" })?;
    if record.owner == *user {
        Ok(record)
    } else {
        Err(GatewayError::NotFound { entity: "file" })
    }
}

#[derive(Debug, Serialize)]
struct SignedUrlResponse {
    url: String,
}

async fn signed_url(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Path(id): Path<FileId>,
) -> GatewayResult<Json<SignedUrlResponse>> {
    let user = authenticate(&ctx, &headers).await?;
    let record = owned_file(&ctx, &user, id).await?;
    let url = ctx.blob.signed_url(record.file_id).await?;
    Ok(Json(SignedUrlResponse { url }))
}

async fn delete_file(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Path(id): Path<FileId>,
) -> GatewayResult<StatusCode> {
    let user = authenticate(&ctx, &headers).await?;
    let record = owned_file(&ctx, &user, id).await?;
    ctx.csv_pool.release(record.file_id);
    ctx.blob.delete(record.file_id).await?;
    ctx.store.delete_file(record.file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Releases every CSV session the user holds
async fn logout(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
) -> GatewayResult<StatusCode> {
    let user = authenticate(&ctx, &headers).await?;
    ctx.csv_pool.release_owner(&user);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /status/ws`, the UI subscriber endpoint.
///
/// The bearer token may arrive as an `Authorization` header or a `token`
/// query parameter (browsers cannot set WebSocket headers). Origin is
/// validated before any event flows; rejection closes with a distinct code.
#[allow(clippy::unused_async)] // axum handlers must be async
async fn status_ws(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin_ok = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|origin| origin_allowed(&ctx.config.allowed_origins, origin));

    let token = bearer_token(&headers)
        .map(str::to_string)
        .or_else(|| params.get("token").cloned());

    ws.on_upgrade(move |socket| run_status_subscriber(ctx, socket, origin_ok, token))
}

async fn close_subscriber(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn run_status_subscriber(
    ctx: Arc<GatewayContext>,
    mut socket: WebSocket,
    origin_ok: bool,
    token: Option<String>,
) {
    if !origin_ok {
        close_subscriber(&mut socket, close::ORIGIN_REJECTED, "origin not allowed").await;
        return;
    }
    if ctx.is_shutting_down() {
        close_subscriber(&mut socket, close::SHUTDOWN, "shutdown").await;
        return;
    }
    let Some(token) = token else {
        close_subscriber(&mut socket, close::UNAUTHORIZED, "unauthorized").await;
        return;
    };
    let Ok(user) = ctx.identity.authenticate(&token).await else {
        close_subscriber(&mut socket, close::UNAUTHORIZED, "unauthorized").await;
        return;
    };

    let Ok(owned) = owned_agent_set(&ctx.store, &user).await else {
        return;
    };
    let connected = ctx.registry.snapshot();
    let (subscriber_id, mut updates) = ctx.fanout.subscribe(user.clone(), owned, &connected);
    debug!(%user, "status subscriber attached");

    loop {
        tokio::select! {
            maybe_update = updates.recv() => {
                let Some(update) = maybe_update else {
                    // Shed by the fan-out or gateway shutdown.
                    close_subscriber(&mut socket, close::SHUTDOWN, "subscription closed").await;
                    break;
                };
                let Ok(json) = serde_json::to_string(&update) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None | Some(Err(_) | Ok(Message::Close(_))) => break,
                    // Subscribers only listen; other inbound frames are noise.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    ctx.fanout.unsubscribe(subscriber_id);
    debug!(%user, "status subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticIdentityProvider;
    use crate::blob::MemoryBlobStore;
    use crate::config::GatewayConfig;
    use crate::context::Collaborators;
    use crate::llm::MockLanguageModel;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_app() -> axum::Router {
        let ctx = GatewayContext::new(
            GatewayConfig::testing(),
            Collaborators {
                llm: Arc::new(MockLanguageModel::new()),
                identity: Arc::new(StaticIdentityProvider::new()),
                blob: Arc::new(MemoryBlobStore::new()),
            },
        )
        .await
        .unwrap();
        create_app(ctx)
    }

    #[test]
    fn bearer_tokens_are_extracted_from_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        let mut bad = HeaderMap::new();
        bad.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&bad), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn health_responds_through_the_layered_router() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unauthenticated_requests_fail_through_the_layered_router() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::get("/api/v1/connections")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
