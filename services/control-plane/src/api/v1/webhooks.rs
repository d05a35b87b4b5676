//! Git provider webhook endpoints.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use fleet_id::AppId;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::webhook::{WebhookOutcome, EVENT_HEADER, SIGNATURE_HEADER};

/// Create webhook routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/github/{app_id}", post(github))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The raw body is needed for signature verification, so it is taken as
/// bytes and parsed only after it is authenticated.
async fn github(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = app_id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid_app_id", "Invalid application ID format"))?;

    let outcome = state
        .webhooks()
        .handle(
            app_id,
            header(&headers, EVENT_HEADER),
            header(&headers, SIGNATURE_HEADER),
            &body,
        )
        .await?;

    let status = match outcome {
        WebhookOutcome::Deployed(_) => StatusCode::ACCEPTED,
        WebhookOutcome::Pong | WebhookOutcome::Ignored { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}
