//! REST API Handlers
//!
//! Implements the REST API endpoints for volume lifecycle, topology
//! queries, and capacity reporting.

use crate::error::{Error, ErrorKind};
use crate::topology::{Registry, ShareProtocol};
use crate::volume::{VolumeManager, VolumeSpec};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Volume creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Volume UUID; generated when omitted
    #[serde(default)]
    pub uuid: Option<String>,
    /// Number of replicas to keep
    pub replica_count: u32,
    /// Nodes to favour during placement
    #[serde(default)]
    pub preferred_nodes: Vec<String>,
    /// Nodes placement is restricted to
    #[serde(default)]
    pub required_nodes: Vec<String>,
    /// Minimum acceptable size in bytes
    pub required_bytes: u64,
    /// Upper size bound in bytes; zero means unbounded
    #[serde(default)]
    pub limit_bytes: u64,
}

/// Volume publish request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeRequest {
    /// Share protocol: nvmf, iscsi, or none for local access
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Volume publish response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeResponse {
    pub uuid: String,
    pub device_path: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    manager: Arc<VolumeManager>,
    registry: Arc<Registry>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(manager: Arc<VolumeManager>, registry: Arc<Registry>) -> Self {
        Self { manager, registry }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            manager: self.manager,
            registry: self.registry,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume))
            .route("/v1/volumes", get(list_volumes))
            .route("/v1/volumes/:uuid", get(get_volume))
            .route("/v1/volumes/:uuid", delete(delete_volume))
            .route("/v1/volumes/:uuid/publish", post(publish_volume))
            .route("/v1/volumes/:uuid/unpublish", post(unpublish_volume))
            // Node endpoints
            .route("/v1/nodes", get(list_nodes))
            .route("/v1/nodes/:name", get(get_node))
            // Pool endpoints
            .route("/v1/pools", get(list_pools))
            // Capacity endpoint
            .route("/v1/capacity", get(get_capacity))
            // Engine status endpoint
            .route("/v1/status", get(get_status))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    manager: Arc<VolumeManager>,
    registry: Arc<Registry>,
}

// =============================================================================
// Volume Handlers
// =============================================================================

/// Create a volume
async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> impl IntoResponse {
    let uuid = request.uuid.clone().unwrap_or_else(uuid_v4);
    info!("Creating volume: {}", uuid);

    let spec = VolumeSpec {
        replica_count: request.replica_count,
        preferred_nodes: request.preferred_nodes,
        required_nodes: request.required_nodes,
        required_bytes: request.required_bytes,
        limit_bytes: request.limit_bytes,
    };

    match state.manager.create_volume(&uuid, spec).await {
        Ok(volume) => (StatusCode::CREATED, Json(volume.snapshot())).into_response(),
        Err(e) => {
            error!("Volume create failed: {}: {}", uuid, e);
            error_response(&e)
        }
    }
}

/// List all volumes
async fn list_volumes(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.list_volumes()))
}

/// Get volume info
async fn get_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    match state.manager.volume(&uuid) {
        Some(volume) => (StatusCode::OK, Json(volume.snapshot())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("Volume {} not found", uuid),
                details: None,
            }),
        )
            .into_response(),
    }
}

/// Destroy a volume
async fn delete_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    info!("Destroying volume: {}", uuid);

    match state.manager.destroy_volume(&uuid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Volume destroy failed: {}: {}", uuid, e);
            error_response(&e)
        }
    }
}

/// Publish a volume to the host
async fn publish_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    request: Option<Json<PublishVolumeRequest>>,
) -> impl IntoResponse {
    let Json(request) = request.unwrap_or_default();

    let protocol = match request.protocol.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("none") | Some("local") => ShareProtocol::None,
        Some("nvmf") => ShareProtocol::Nvmf,
        Some("iscsi") => ShareProtocol::Iscsi,
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorResponse {
                    error: "invalid_protocol".into(),
                    message: format!(
                        "Invalid share protocol: {}. Use 'nvmf', 'iscsi', or 'none'",
                        other
                    ),
                    details: None,
                }),
            )
                .into_response();
        }
    };

    let Some(volume) = state.manager.volume(&uuid) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("Volume {} not found", uuid),
                details: None,
            }),
        )
            .into_response();
    };

    match volume.publish(protocol).await {
        Ok(device_path) => (
            StatusCode::OK,
            Json(PublishVolumeResponse { uuid, device_path }),
        )
            .into_response(),
        Err(e) => {
            error!("Volume publish failed: {}: {}", uuid, e);
            error_response(&e)
        }
    }
}

/// Withdraw a volume from the host
async fn unpublish_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let Some(volume) = state.manager.volume(&uuid) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("Volume {} not found", uuid),
                details: None,
            }),
        )
            .into_response();
    };

    match volume.unpublish().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Volume unpublish failed: {}: {}", uuid, e);
            error_response(&e)
        }
    }
}

// =============================================================================
// Topology Handlers
// =============================================================================

/// List all nodes
async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.registry.list_nodes()))
}

/// Get node info
async fn get_node(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.node(&name) {
        Some(node) => (StatusCode::OK, Json(node.snapshot())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("Node {} not found", name),
                details: None,
            }),
        )
            .into_response(),
    }
}

/// List pools across all nodes
async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.registry.list_pools()))
}

/// Get cluster capacity
async fn get_capacity(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.registry.stats()))
}

/// Get volume manager status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.manager.status()))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Ready once at least one storage node is reachable
    let stats = state.registry.stats();
    if stats.online_nodes > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no nodes registered")
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Map a control plane error onto an HTTP error response
fn error_response(err: &Error) -> Response {
    let (status, label) = match err.kind() {
        ErrorKind::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
        ErrorKind::ResourceExhausted => (StatusCode::INSUFFICIENT_STORAGE, "insufficient_storage"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::RemoteCall => (StatusCode::BAD_GATEWAY, "remote_call_failed"),
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    (
        status,
        Json(ApiErrorResponse {
            error: label.into(),
            message: err.to_string(),
            details: None,
        }),
    )
        .into_response()
}

/// Generate a simple UUID v4
fn uuid_v4() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();

    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        (now >> 96) as u32,
        (now >> 80) as u16,
        (now >> 68) as u16 & 0x0FFF,
        ((now >> 52) as u16 & 0x3FFF) | 0x8000,
        now as u64 & 0xFFFFFFFFFFFF
    )
}
