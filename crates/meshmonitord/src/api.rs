use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use meshmonitor_device::{DeviceSession, PacketRouter};
use meshmonitor_proto::admin::AdminMessage;
use meshmonitor_proto::node_num_from_id;
use meshmonitor_store::{MessagePage, Store};
use meshmonitor_vns::VirtualNodeServer;

use crate::config::{ApiConfig, Config};
use crate::outbox::Outbox;
use crate::snapshot::{self, ConnectionStatus, PollSnapshot};

/// API server state
pub struct ApiState {
    pub config: Config,
    pub store: Arc<Store>,
    pub session: Arc<DeviceSession>,
    pub router: Arc<PacketRouter>,
    pub outbox: Arc<Outbox>,
    pub vns: Option<Arc<VirtualNodeServer>>,
}

/// API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: Arc<ApiState>) -> Self {
        Self { config, state }
    }

    pub async fn start(&self) -> Result<tokio::task::JoinHandle<Result<()>>> {
        let app = self.create_router();

        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;

        info!("API server listening on {}", bind_addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))
        });

        Ok(handle)
    }

    fn create_router(&self) -> Router {
        Router::new()
            // Health check
            .route("/health", get(health_check))
            // Snapshot + connection
            .route("/api/poll", get(get_poll))
            .route("/api/connection", get(get_connection))
            // Messages
            .route("/api/messages/send", post(send_message))
            .route("/api/messages/mark-read", post(mark_read))
            .route(
                "/api/messages/channels/:channel",
                get(get_channel_messages).delete(delete_channel_messages),
            )
            .route(
                "/api/messages/direct-messages/:node_num",
                get(get_direct_messages).delete(delete_direct_messages),
            )
            .route("/api/messages/:id", delete(delete_message))
            .route("/api/messages/nodes/:node_num", delete(delete_node_messages))
            .route(
                "/api/messages/nodes/:node_num/purge-from-device",
                post(purge_node_from_device),
            )
            // Requests toward the mesh
            .route("/api/traceroute", post(send_traceroute))
            .route("/api/position/request", post(request_position))
            .route("/api/telemetry/request", post(request_telemetry))
            // Node flags
            .route("/api/nodes/:id/favorite", post(set_favorite))
            .route("/api/nodes/:id/ignored", post(set_ignored))
            .route("/api/nodes/refresh", post(refresh_nodes))
            // Device control
            .route("/api/device/reboot", post(reboot_device))
            .route("/api/device/disconnect", post(disconnect_device))
            .route("/api/device/reconnect", post(reconnect_device))
            // Add CORS middleware
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }
}

/// Errors surface as tagged JSON; the core never panics an HTTP worker.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.1 }));
        (self.0, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl From<meshmonitor_store::StoreError> for ApiError {
    fn from(e: meshmonitor_store::StoreError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Accept a node reference as `!hex8` or a decimal node number.
fn parse_node_ref(raw: &str) -> std::result::Result<u32, ApiError> {
    if raw.starts_with('!') {
        node_num_from_id(raw).map_err(|e| bad_request(e.to_string()))
    } else {
        raw.parse::<u32>()
            .map_err(|_| bad_request(format!("Invalid node reference: {}", raw)))
    }
}

// === Health Check ===

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// === Snapshot ===

async fn get_poll(State(state): State<Arc<ApiState>>) -> ApiResult<PollSnapshot> {
    let snapshot =
        snapshot::build_snapshot(&state.store, &state.session, &state.config).await?;
    Ok(Json(snapshot))
}

async fn get_connection(State(state): State<Arc<ApiState>>) -> Json<ConnectionResponse> {
    let connection = ConnectionStatus::derive(&state.session).await;
    let vns_clients = match &state.vns {
        Some(vns) => vns.client_count().await,
        None => 0,
    };
    Json(ConnectionResponse {
        connection,
        vns_clients,
        decode_failures: state.session.decode_failure_count(),
        router: state.router.stats().await,
    })
}

#[derive(Serialize)]
struct ConnectionResponse {
    connection: ConnectionStatus,
    vns_clients: usize,
    decode_failures: u64,
    router: meshmonitor_device::RouterStats,
}

// === Messages ===

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
    channel: Option<i32>,
    destination: Option<String>,
    reply_id: Option<u32>,
    #[serde(default)]
    emoji: bool,
}

#[derive(Serialize)]
struct SendMessageResponse {
    request_id: u32,
}

async fn send_message(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<SendMessageRequest>,
) -> ApiResult<SendMessageResponse> {
    if payload.text.is_empty() {
        return Err(bad_request("Message text must not be empty"));
    }

    let destination = payload
        .destination
        .as_deref()
        .map(parse_node_ref)
        .transpose()?;
    let channel = payload
        .channel
        .filter(|&c| c >= 0)
        .map(|c| c as u32);

    let request_id = state
        .outbox
        .send_text(
            &payload.text,
            channel,
            destination,
            payload.reply_id,
            payload.emoji,
        )
        .await?;
    Ok(Json(SendMessageResponse { request_id }))
}

#[derive(Deserialize)]
struct MarkReadRequest {
    channel: Option<i32>,
    node_id: Option<String>,
}

async fn mark_read(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<MarkReadRequest>,
) -> ApiResult<serde_json::Value> {
    let key = match (payload.channel, payload.node_id) {
        (Some(channel), None) => format!("ch:{}", channel),
        (None, Some(node_id)) => {
            let num = parse_node_ref(&node_id)?;
            format!("dm:{}", meshmonitor_proto::node_id_from_num(num))
        }
        _ => return Err(bad_request("Provide exactly one of channel or node_id")),
    };
    state.store.mark_conversation_read(&key).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn get_channel_messages(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<i32>,
    Query(page): Query<PageQuery>,
) -> ApiResult<MessagePage> {
    let page = state
        .store
        .get_channel_messages(channel, page.limit.unwrap_or(50), page.offset.unwrap_or(0))
        .await?;
    Ok(Json(page))
}

async fn get_direct_messages(
    State(state): State<Arc<ApiState>>,
    Path(node_num): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<MessagePage> {
    let peer = parse_node_ref(&node_num)?;
    let local = state
        .session
        .my_node_id()
        .await
        .ok_or_else(|| bad_request("Local node not known yet"))?;
    let page = state
        .store
        .get_direct_messages(
            &local,
            &meshmonitor_proto::node_id_from_num(peer),
            page.limit.unwrap_or(50),
            page.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(page))
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: u64,
}

async fn delete_message(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<u32>,
) -> ApiResult<DeleteResponse> {
    let deleted = state.store.delete_message(id).await?;
    Ok(Json(DeleteResponse {
        deleted: deleted as u64,
    }))
}

async fn delete_channel_messages(
    State(state): State<Arc<ApiState>>,
    Path(channel): Path<i32>,
) -> ApiResult<DeleteResponse> {
    let deleted = state.store.delete_channel_messages(channel).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn delete_direct_messages(
    State(state): State<Arc<ApiState>>,
    Path(node_num): Path<String>,
) -> ApiResult<DeleteResponse> {
    let peer = parse_node_ref(&node_num)?;
    let deleted = state
        .store
        .delete_direct_messages(&meshmonitor_proto::node_id_from_num(peer))
        .await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn delete_node_messages(
    State(state): State<Arc<ApiState>>,
    Path(node_num): Path<String>,
) -> ApiResult<DeleteResponse> {
    let num = parse_node_ref(&node_num)?;
    let deleted = state.store.delete_node_messages(num).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// Local cascade delete plus a best-effort device-side NodeDB removal.
/// Pre-2.7 firmware ignores the admin command; the local purge still runs.
async fn purge_node_from_device(
    State(state): State<Arc<ApiState>>,
    Path(node_num): Path<String>,
) -> ApiResult<serde_json::Value> {
    let num = parse_node_ref(&node_num)?;

    state.store.delete_node(num).await?;

    let device_synced = state
        .outbox
        .send_admin_to_self(AdminMessage::remove_by_nodenum(num, &[]))
        .await
        .is_ok();

    state
        .store
        .audit_log(
            "api",
            "purge_node",
            Some(&meshmonitor_proto::node_id_from_num(num)),
            Some(&format!("{{\"device_synced\":{}}}", device_synced)),
            None,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "device_synced": device_synced,
    })))
}

// === Mesh requests ===

#[derive(Deserialize)]
struct DestinationRequest {
    destination: String,
}

async fn send_traceroute(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<DestinationRequest>,
) -> ApiResult<SendMessageResponse> {
    let destination = parse_node_ref(&payload.destination)?;
    let request_id = state.outbox.send_traceroute(destination).await?;
    Ok(Json(SendMessageResponse { request_id }))
}

async fn request_position(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<DestinationRequest>,
) -> ApiResult<SendMessageResponse> {
    let destination = parse_node_ref(&payload.destination)?;
    let request_id = state.outbox.send_position_request(destination).await?;
    Ok(Json(SendMessageResponse { request_id }))
}

async fn request_telemetry(
    State(state): State<Arc<ApiState>>,
    Json(payload): Json<DestinationRequest>,
) -> ApiResult<SendMessageResponse> {
    let destination = parse_node_ref(&payload.destination)?;
    let request_id = state.outbox.send_telemetry_request(destination).await?;
    Ok(Json(SendMessageResponse { request_id }))
}

// === Node flags ===

#[derive(Deserialize)]
struct FavoriteRequest {
    favorite: bool,
    #[serde(default = "default_true")]
    sync_to_device: bool,
}

#[derive(Deserialize)]
struct IgnoredRequest {
    ignored: bool,
    #[serde(default = "default_true")]
    sync_to_device: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct FlagResponse {
    node_id: String,
    value: bool,
    device_synced: bool,
}

async fn set_favorite(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(payload): Json<FavoriteRequest>,
) -> ApiResult<FlagResponse> {
    let num = parse_node_ref(&id)?;
    state.store.set_favorite(num, payload.favorite).await?;

    let admin = if payload.favorite {
        AdminMessage::set_favorite_node(num, &[])
    } else {
        AdminMessage::remove_favorite_node(num, &[])
    };
    let device_synced = payload.sync_to_device
        && state.outbox.send_admin_to_self(admin).await.is_ok();

    Ok(Json(FlagResponse {
        node_id: meshmonitor_proto::node_id_from_num(num),
        value: payload.favorite,
        device_synced,
    }))
}

async fn set_ignored(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(payload): Json<IgnoredRequest>,
) -> ApiResult<FlagResponse> {
    let num = parse_node_ref(&id)?;
    state.store.set_ignored(num, payload.ignored).await?;

    let admin = if payload.ignored {
        AdminMessage::set_ignored_node(num, &[])
    } else {
        AdminMessage::remove_ignored_node(num, &[])
    };
    let device_synced = payload.sync_to_device
        && state.outbox.send_admin_to_self(admin).await.is_ok();

    Ok(Json(FlagResponse {
        node_id: meshmonitor_proto::node_id_from_num(num),
        value: payload.ignored,
        device_synced,
    }))
}

async fn refresh_nodes(State(state): State<Arc<ApiState>>) -> ApiResult<serde_json::Value> {
    state
        .session
        .request_config_sync()
        .await
        .map_err(|e| ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// === Device control ===

async fn reboot_device(State(state): State<Arc<ApiState>>) -> ApiResult<serde_json::Value> {
    state
        .outbox
        .send_admin_to_self(AdminMessage::reboot(5, &[]))
        .await?;
    state.session.expect_reboot();
    state
        .store
        .audit_log("api", "device_reboot", None, None, None)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn disconnect_device(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.session.user_disconnect();
    Json(serde_json::json!({ "ok": true }))
}

async fn reconnect_device(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.session.reconnect();
    Json(serde_json::json!({ "ok": true }))
}
