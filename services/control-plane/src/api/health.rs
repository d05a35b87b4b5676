//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Nodes holding a live dispatch connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_nodes: Option<usize>,

    /// Database check result; absent on the in-memory store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: returns 200 whenever the server is up.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        connected_nodes: None,
        database: None,
    })
}

/// Readiness: 503 while the database is unreachable.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let db_result = match state.db() {
        Some(db) => Some(db.health_check().await.map_err(|e| e.to_string())),
        None => None,
    };
    let db_ok = !matches!(db_result, Some(Err(_)));

    let response = HealthResponse {
        status: if db_ok { "ok" } else { "degraded" }.to_string(),
        service: "fleet-control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        connected_nodes: Some(state.channel().connected_nodes().len()),
        database: db_result.map(|r| match r {
            Ok(()) => "ok".to_string(),
            Err(e) => e,
        }),
    };

    if db_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
