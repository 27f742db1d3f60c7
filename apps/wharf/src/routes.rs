use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::header::AUTHORIZATION,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::AgentClient;
use crate::broker::{derive_session_token, SessionBroker, SessionError};
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::protocol::{
    ContainerRequest, CreateContainerRequest, CreateContainerResponse, FileQuery, HeartbeatAck,
    HeartbeatRequest, OrphanedContainer, ProviderView, PullImageRequest, WriteFileRequest,
};
use crate::registry::{resolve_origin, ProviderRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ProviderRegistry>,
    pub broker: Arc<SessionBroker>,
    pub agent: AgentClient,
    /// Containers created on a provider whose terminal dial failed; kept for
    /// external cleanup tooling.
    pub orphans: Arc<DashMap<String, OrphanedContainer>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            agent: AgentClient::new(&config),
            registry: Arc::new(ProviderRegistry::new()),
            broker: Arc::new(SessionBroker::new(&config)),
            orphans: Arc::new(DashMap::new()),
            config,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/providers/heartbeat", post(heartbeat))
        .route("/providers", get(list_providers))
        .route("/providers/:provider_id", get(get_provider))
        .route(
            "/providers/:provider_id/containers/create",
            post(create_container),
        )
        .route(
            "/providers/:provider_id/containers/start",
            post(start_container),
        )
        .route(
            "/providers/:provider_id/containers/stop",
            post(stop_container),
        )
        .route("/providers/:provider_id/images/pull", post(pull_image))
        .route("/providers/:provider_id/system/info", get(system_info))
        .route("/providers/:provider_id/files/read", get(read_file))
        .route("/providers/:provider_id/files/write", post(write_file))
        .route("/providers/:provider_id/files/list", get(list_files))
        .route("/orphans", get(list_orphans))
        .route("/terminal/:token", get(attach_terminal))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /providers/heartbeat - inbound liveness report.
async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatAck> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let origin = resolve_origin(remote.ip(), forwarded, state.config.trust_forwarded_for);
    let timestamp = state.registry.register_heartbeat(&req, origin)?;
    Ok(Json(HeartbeatAck {
        status: "ACK",
        timestamp,
    }))
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderView>> {
    Json(state.registry.list())
}

async fn get_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> ApiResult<ProviderView> {
    let provider = state.registry.require(&provider_id)?;
    Ok(Json(provider.view()))
}

/// POST /providers/:id/containers/create - composite operation: create the
/// container on the provider, then open the terminal session for it. The
/// client only learns the container id once a terminal is attachable.
async fn create_container(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateContainerRequest>,
) -> ApiResult<CreateContainerResponse> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .create_container(&provider, &req.image, req.options.as_ref())
        .await?;
    let container_id = body
        .get("containerId")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!(
                "agent create response missing containerId: {body}"
            ))
        })?
        .to_string();

    let token = derive_session_token(bearer(&headers), &container_id);
    match state
        .broker
        .create_session(&token, &provider, &container_id)
        .await
    {
        Ok(()) => {
            info!(provider = %provider_id, container = %container_id, "container created");
            Ok(Json(CreateContainerResponse {
                container_id,
                session_token: token,
            }))
        }
        Err(err) => {
            warn!(
                provider = %provider_id,
                container = %container_id,
                "terminal dial failed after create: {err}; recording orphan"
            );
            let key = format!("{provider_id}/{container_id}");
            state.orphans.insert(
                key.clone(),
                OrphanedContainer {
                    provider_id: provider_id.clone(),
                    container_id: container_id.clone(),
                },
            );
            // Best-effort cleanup; the agent owns actual removal.
            if state
                .agent
                .stop_container(&provider, &container_id)
                .await
                .is_ok()
            {
                state.orphans.remove(&key);
            }
            Err(match err {
                SessionError::Busy => ApiError::SessionBusy,
                other => ApiError::Unavailable(other.to_string()),
            })
        }
    }
}

async fn start_container(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(req): Json<ContainerRequest>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .start_container(&provider, &req.container_id)
        .await?;
    Ok(Json(body))
}

async fn stop_container(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(req): Json<ContainerRequest>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .stop_container(&provider, &req.container_id)
        .await?;
    Ok(Json(body))
}

async fn pull_image(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(req): Json<PullImageRequest>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state.agent.pull_image(&provider, &req.image).await?;
    Ok(Json(body))
}

async fn system_info(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state.agent.system_info(&provider).await?;
    Ok(Json(body))
}

async fn read_file(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .read_file(&provider, &query.container_id, &query.path)
        .await?;
    Ok(Json(body))
}

async fn write_file(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Json(req): Json<WriteFileRequest>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .write_file(&provider, &req.container_id, &req.path, &req.content)
        .await?;
    Ok(Json(body))
}

async fn list_files(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Value> {
    let provider = state.registry.require(&provider_id)?;
    let body = state
        .agent
        .list_files(&provider, &query.container_id, &query.path)
        .await?;
    Ok(Json(body))
}

async fn list_orphans(State(state): State<AppState>) -> Json<Vec<OrphanedContainer>> {
    Json(state.orphans.iter().map(|o| o.value().clone()).collect())
}

/// GET /terminal/:token - WebSocket upgrade carrying the session token.
/// Attach exclusivity is decided before the upgrade completes, so a losing
/// concurrent attach is refused at the handshake.
async fn attach_terminal(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.broker.attach(&token) {
        // The guard rides inside the upgrade closure; if the client drops
        // before the upgrade completes, dropping it releases the session.
        Ok(guard) => ws.on_upgrade(move |client| async move {
            state.broker.bridge(client, guard).await;
        }),
        Err(SessionError::Busy) => ApiError::SessionBusy.into_response(),
        Err(_) => ApiError::NotFound("session").into_response(),
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
