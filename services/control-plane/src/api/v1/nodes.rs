//! Node protocol endpoints.
//!
//! - POST /v1/nodes/tokens: issue a registration token (operator)
//! - POST /v1/nodes/register: redeem a token for a node secret
//! - POST /v1/nodes/heartbeat: report metrics
//! - GET /v1/nodes/{node_id}/connect: dispatch connection (WebSocket)
//! - POST /v1/nodes/{node_id}/{drain,disable,enable}, DELETE /v1/nodes/{node_id}
//!
//! The dispatch connection carries `TaskEnvelope` JSON text frames to the
//! node and `TaskReport` JSON text frames back.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fleet_events::{NodeStatus, TaskReport};
use fleet_id::NodeId;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::dispatch::NodeSession;
use crate::nodes::HeartbeatMetrics;
use crate::state::AppState;
use crate::store::WorkerNode;

pub const NODE_SECRET_HEADER: &str = "x-node-secret";

/// Create node routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tokens", post(issue_token))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/{node_id}/connect", get(connect))
        .route("/{node_id}/drain", post(drain))
        .route("/{node_id}/disable", post(disable))
        .route("/{node_id}/enable", post(enable))
        .route("/{node_id}", delete(remove))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct IssueTokenRequest {
    pub name: String,
    pub region: String,
    pub host_address: String,
}

#[derive(Debug, Serialize)]
pub struct IssueTokenResponse {
    pub node_id: NodeId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub token: String,
    #[serde(default)]
    pub host_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub node_id: NodeId,
    pub node_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    pub node_secret: String,
    #[serde(flatten)]
    pub metrics: HeartbeatMetrics,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: NodeStatus,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: NodeId,
    pub name: String,
    pub region: String,
    pub status: NodeStatus,
    pub online: bool,
}

impl NodeResponse {
    fn from_node(node: WorkerNode, online: bool) -> Self {
        Self {
            id: node.id,
            name: node.name,
            region: node.region,
            status: node.status,
            online,
        }
    }
}

fn parse_node_id(raw: &str) -> Result<NodeId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("invalid_node_id", "Invalid node ID format"))
}

// =============================================================================
// Handlers
// =============================================================================

async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issued = state
        .registry()
        .issue_registration_token(&req.name, &req.region, &req.host_address)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(IssueTokenResponse {
            node_id: issued.node_id,
            token: issued.token,
            expires_at: issued.expires_at,
        }),
    ))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let registration = state
        .registry()
        .redeem_token(&req.token, req.host_address.as_deref())
        .await?;

    Ok(Json(RegisterResponse {
        node_id: registration.node.id,
        node_secret: registration.node_secret,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .registry()
        .authenticate(req.node_id, &req.node_secret)
        .await?;
    let node = state.registry().heartbeat(req.node_id, &req.metrics).await?;

    Ok(Json(HeartbeatResponse {
        status: node.status,
    }))
}

async fn connect(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let node_id = parse_node_id(&node_id)?;
    let secret = headers
        .get(NODE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("invalid_token", "Missing node secret"))?;

    let session = state.channel().connect(node_id, secret).await?;

    Ok(ws.on_upgrade(move |socket| handle_dispatch_socket(socket, state, session)))
}

/// Pump the node's outbox into the socket and apply the reports it sends
/// back, until either side ends. Dropping the session unregisters it.
async fn handle_dispatch_socket(socket: WebSocket, state: AppState, session: NodeSession) {
    let node_id = session.node_id();
    info!(node_id = %node_id, session_id = session.session_id(), "dispatch connection open");

    let (mut sender, mut receiver) = socket.split();

    let to_node = async {
        while let Some(task) = session.next_task().await {
            let frame = match serde_json::to_string(&task) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = ?e, task_id = %task.task_id, "Failed to encode task");
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(frame.into())).await {
                warn!(error = ?e, node_id = %node_id, "Failed to write task to node");
                break;
            }
            debug!(node_id = %node_id, task_id = %task.task_id, "task written");
        }
    };

    let from_node = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<TaskReport>(text.as_str()) {
                    Ok(report) => {
                        if let Err(e) = state.scheduler().apply_report(node_id, &report).await {
                            warn!(error = %e, node_id = %node_id, "Failed to apply task report");
                        }
                    }
                    Err(e) => warn!(error = %e, node_id = %node_id, "Malformed task report"),
                },
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => {
                    warn!(error = ?e, node_id = %node_id, "WebSocket error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = to_node => {}
        _ = from_node => {}
    }

    info!(node_id = %node_id, session_id = session.session_id(), "dispatch connection closed");
}

async fn drain(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.registry().drain(parse_node_id(&node_id)?).await?;
    let online = state.channel().is_online(node.id);
    Ok(Json(NodeResponse::from_node(node, online)))
}

async fn disable(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.registry().disable(parse_node_id(&node_id)?).await?;
    let online = state.channel().is_online(node.id);
    Ok(Json(NodeResponse::from_node(node, online)))
}

async fn enable(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node = state.registry().enable(parse_node_id(&node_id)?).await?;
    let online = state.channel().is_online(node.id);
    Ok(Json(NodeResponse::from_node(node, online)))
}

async fn remove(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry().remove_node(parse_node_id(&node_id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_request_flattens_metrics() {
        let req: HeartbeatRequest = serde_json::from_str(&format!(
            r#"{{"node_id":"{}","node_secret":"s","cpu_total":4.0,"memory_used_mb":100}}"#,
            NodeId::new()
        ))
        .unwrap();
        assert_eq!(req.metrics.cpu_total, Some(4.0));
        assert_eq!(req.metrics.memory_used_mb, Some(100));
        assert_eq!(req.metrics.disk_total_mb, None);
    }
}
