//! The HTTP surface, driven through the router without a listener.

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use chrono::Utc;
use common::Fleet;
use fleet_control_plane::api::create_router;
use fleet_control_plane::webhook::{signature_header, EVENT_HEADER, SIGNATURE_HEADER};
use fleet_events::ResourceStatus;
use fleet_id::OrgId;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let fleet = Fleet::new();
    let app = create_router(fleet.state());

    let (status, body) = call(
        &app,
        Request::get("/healthz").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let _session = fleet.online_node("eu", (4.0, 8192), (0.0, 0)).await;
    let (status, body) = call(&app, Request::get("/readyz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected_nodes"], 1);
    assert!(body.get("database").is_none());
}

#[tokio::test]
async fn test_register_and_heartbeat_over_http() {
    let fleet = Fleet::new();
    let app = create_router(fleet.state());

    let (status, issued) = call(
        &app,
        post_json(
            "/v1/nodes/tokens",
            json!({ "name": "worker-1", "region": "eu", "host_address": "10.0.0.1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = issued["token"].as_str().unwrap().to_string();

    let (status, registered) = call(
        &app,
        post_json("/v1/nodes/register", json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registered["node_id"], issued["node_id"]);
    let secret = registered["node_secret"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        post_json("/v1/nodes/register", json!({ "token": token })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, beat) = call(
        &app,
        post_json(
            "/v1/nodes/heartbeat",
            json!({
                "node_id": registered["node_id"],
                "node_secret": secret,
                "cpu_total": 4.0,
                "memory_total_mb": 8192,
                "cpu_used": 0.5,
                "memory_used_mb": 512,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(beat["status"], "online");

    let (status, problem) = call(
        &app,
        post_json(
            "/v1/nodes/heartbeat",
            json!({ "node_id": registered["node_id"], "node_secret": "wrong" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["code"], "invalid_token");

    let (status, problem) = call(
        &app,
        post_json(
            "/v1/nodes/heartbeat",
            json!({ "node_id": registered["node_id"], "node_secret": secret, "status": "pending" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["code"], "invalid_status");

    let (status, beat) = call(
        &app,
        post_json(
            "/v1/nodes/heartbeat",
            json!({ "node_id": registered["node_id"], "node_secret": secret }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(beat["status"], "online");
}

#[tokio::test]
async fn test_remove_node_in_use_is_conflict() {
    let fleet = Fleet::new();
    let app = create_router(fleet.state());
    let node_id = fleet.registered_node("eu", (4.0, 8192), (0.0, 0)).await;
    fleet
        .running_app(OrgId::new(), dec!(0.01), Some(node_id), Utc::now())
        .await;

    let (status, problem) = call(
        &app,
        Request::delete(format!("/v1/nodes/{node_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(problem["code"], "node_in_use");

    let (status, drained) = call(
        &app,
        Request::post(format!("/v1/nodes/{node_id}/drain"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(drained["status"], "draining");
    assert_eq!(drained["online"], false);
}

#[tokio::test]
async fn test_webhook_route() {
    let fleet = Fleet::new();
    let app = create_router(fleet.state());

    let plan = fleet.plan(1.0, 512, dec!(0.01)).await;
    let runtime = fleet.runtime().await;
    let mut record = fleet.app(
        OrgId::new(),
        &plan,
        &runtime,
        "eu",
        ResourceStatus::Stopped,
        Utc::now(),
    );
    record.git = Some(fleet.git_source(record.id, "s3cret", true));
    fleet.insert_app(&record).await;

    let body = br#"{"zen":"Design for failure."}"#;
    let signature = signature_header(b"s3cret", body).unwrap();
    let uri = format!("/v1/webhooks/github/{}", record.id);

    let (status, outcome) = call(
        &app,
        Request::post(&uri)
            .header(EVENT_HEADER, "ping")
            .header(SIGNATURE_HEADER, &signature)
            .body(Body::from(&body[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "pong");

    let (status, problem) = call(
        &app,
        Request::post(&uri)
            .header(EVENT_HEADER, "ping")
            .header(SIGNATURE_HEADER, "sha256=00")
            .body(Body::from(&body[..]))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(problem["code"], "signature_mismatch");

    let (status, _) = call(
        &app,
        Request::post("/v1/webhooks/github/not-an-id")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
