//! HTTP API tests against the full router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::Value;
use std::time::Duration;
use tower::ServiceExt;

use common::{TestApp, test_app};

fn request(method: &str, uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("Authorization", format!("Bearer dev:{}", user));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &TestApp, req: Request<Body>) -> Response {
    app.router.clone().oneshot(req).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn status_of(app: &TestApp, project_id: &str) -> String {
    let response = send(
        app,
        request(
            "GET",
            &format!("/api/projects/{}/status", project_id),
            Some("alice"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await["phase"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn wait_for_phase(app: &TestApp, project_id: &str, phase: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if status_of(app, project_id).await == phase {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "project {} never reached {}",
            project_id,
            phase
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app().await;
    let response = send(&app, request("GET", "/health", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["shared_store"], true);
}

#[tokio::test]
async fn test_project_routes_require_auth() {
    let app = test_app().await;

    let response = send(&app, request("GET", "/api/projects/p1/status", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(&app, request("GET", "/api/projects/p1/status", Some("mallory"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_dev_user_header_is_accepted_in_dev_mode() {
    let app = test_app().await;
    let req = Request::builder()
        .uri("/api/projects/p1/status")
        .header("X-Dev-User", "bob")
        .body(Body::empty())
        .unwrap();

    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_start_is_accepted_and_reaches_running() {
    let app = test_app().await;

    let response = send(&app, request("POST", "/api/projects/p1/start", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["phase"], "starting");

    wait_for_phase(&app, "p1", "running").await;
    assert_eq!(
        app.runtime.container_status("classbox-p1").as_deref(),
        Some("running")
    );

    let project = app.repo.get("p1").await.unwrap().unwrap();
    assert_eq!(project.container_id.as_deref(), Some("id-classbox-p1"));
}

#[tokio::test]
async fn test_repeated_start_joins_the_running_sequence() {
    let app = test_app().await;
    let gate = app.runtime.hold_builds();

    let first = send(&app, request("POST", "/api/projects/p1/start", Some("alice"))).await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let second = send(&app, request("POST", "/api/projects/p1/start", Some("bob"))).await;
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(second).await["phase"], "starting");
    assert_eq!(status_of(&app, "p1").await, "starting");

    gate.notify_one();
    wait_for_phase(&app, "p1", "running").await;
}

#[tokio::test]
async fn test_start_without_ports_is_rejected() {
    let app = test_app().await;

    let response = send(&app, request("POST", "/api/projects/p2/start", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "BAD_REQUEST");
    assert_eq!(status_of(&app, "p2").await, "stopped");
}

#[tokio::test]
async fn test_non_member_is_forbidden() {
    let app = test_app().await;

    let response = send(&app, request("POST", "/api/projects/p1/start", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "FORBIDDEN");
    assert_eq!(app.runtime.container_status("classbox-p1"), None);
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let app = test_app().await;

    let response = send(&app, request("GET", "/api/projects/nope/status", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_status_follows_the_runtime() {
    let app = test_app().await;
    assert_eq!(status_of(&app, "p1").await, "stopped");

    // Started outside of classbox.
    app.runtime.set_container_status("classbox-p1", "running");
    assert_eq!(status_of(&app, "p1").await, "running");

    app.runtime.set_container_status("classbox-p1", "exited");
    assert_eq!(status_of(&app, "p1").await, "stopped");
}

#[tokio::test]
async fn test_stop_and_reset() {
    let app = test_app().await;
    send(&app, request("POST", "/api/projects/p1/start", Some("alice"))).await;
    wait_for_phase(&app, "p1", "running").await;

    let response = send(&app, request("POST", "/api/projects/p1/stop", Some("bob"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["project_id"], "p1");
    assert_eq!(body["phase"], "stopped");
    assert_eq!(
        app.runtime.container_status("classbox-p1").as_deref(),
        Some("exited")
    );

    let response = send(&app, request("POST", "/api/projects/p1/reset", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["phase"], "stopped");
    assert_eq!(app.runtime.container_status("classbox-p1"), None);

    // A fresh container is created on the next start.
    send(&app, request("POST", "/api/projects/p1/start", Some("alice"))).await;
    wait_for_phase(&app, "p1", "running").await;
}

#[tokio::test]
async fn test_stop_while_starting_conflicts() {
    let app = test_app().await;
    let gate = app.runtime.hold_builds();

    send(&app, request("POST", "/api/projects/p1/start", Some("alice"))).await;
    let response = send(&app, request("POST", "/api/projects/p1/stop", Some("alice"))).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "CONFLICT");

    gate.notify_one();
    wait_for_phase(&app, "p1", "running").await;
}

#[tokio::test]
async fn test_terminal_list_starts_empty() {
    let app = test_app().await;

    let response = send(&app, request("GET", "/api/projects/p1/terminals", Some("bob"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!([]));

    let response = send(&app, request("GET", "/api/projects/p1/terminals", Some("carol"))).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
