//! Gateway router tests.

use super::server::{build_router, AppState};
use crate::config::QueueConfig;
use crate::testutil::{owner, stack, TestStack};
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(stack: &TestStack) -> Router {
    build_router(
        AppState {
            manager: stack.manager.clone(),
            bulk: stack.bulk.clone(),
            queue: stack.queue.clone(),
            autoreply: stack.autoreply.clone(),
            media: stack.media.clone(),
            queue_defaults: QueueConfig::default(),
        },
        &[],
    )
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", "u-test")
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(value) => builder
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn test_health_endpoint() {
    let stack = stack().await;
    let resp = app(&stack)
        .oneshot(request("GET", "/health", None))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "wamux");
}

#[tokio::test]
async fn test_missing_identity_header_is_unauthorized() {
    let stack = stack().await;
    let req = Request::builder()
        .method("GET")
        .uri("/sessions")
        .body(Body::empty())
        .expect("request");
    let resp = app(&stack).oneshot(req).await.expect("response");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_session_create_and_get_roundtrip() {
    let stack = stack().await;
    let router = app(&stack);

    let resp = router
        .clone()
        .oneshot(request(
            "POST",
            "/sessions",
            Some(json!({ "phone": "+1 555-123-4567", "name": "Support" })),
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let created = json_body(resp).await;
    assert_eq!(created["id"], "15551234567");
    assert_eq!(created["name"], "Support");
    assert_eq!(created["enabled"], true);
    assert_eq!(created["connected"], false);

    let resp = router
        .clone()
        .oneshot(request("GET", "/sessions/15551234567", None))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(request("GET", "/sessions", None))
        .await
        .expect("response");
    let list = json_body(resp).await;
    assert_eq!(list.as_array().expect("array").len(), 1);
}

#[tokio::test]
async fn test_unknown_session_maps_to_404_body() {
    let stack = stack().await;
    let resp = app(&stack)
        .oneshot(request("GET", "/sessions/0000000000", None))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "not_found");
    assert!(body["message"].as_str().expect("message").contains("0000000000"));
}

#[tokio::test]
async fn test_send_on_down_session_is_503() {
    let stack = stack().await;
    let router = app(&stack);
    router
        .clone()
        .oneshot(request(
            "POST",
            "/sessions",
            Some(json!({ "phone": "15551234567" })),
        ))
        .await
        .expect("create");

    let resp = router
        .oneshot(request(
            "POST",
            "/sessions/15551234567/messages",
            Some(json!({ "to": "15550001111", "message": "hi" })),
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "service_unavailable");
}

#[tokio::test]
async fn test_connect_then_send_via_http() {
    let stack = stack().await;
    let router = app(&stack);
    router
        .clone()
        .oneshot(request(
            "POST",
            "/sessions",
            Some(json!({ "phone": "15551234567" })),
        ))
        .await
        .expect("create");

    let resp = router
        .clone()
        .oneshot(request("POST", "/sessions/15551234567/connect", None))
        .await
        .expect("connect");
    assert_eq!(resp.status(), StatusCode::OK);
    let view = json_body(resp).await;
    assert_eq!(view["connected"], true);
    assert_eq!(view["logged_in"], true);

    let resp = router
        .oneshot(request(
            "POST",
            "/sessions/15551234567/messages",
            Some(json!({ "to": "+1 555-000-1111", "message": "hello" })),
        ))
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);
    let receipt = json_body(resp).await;
    assert_eq!(receipt["to"], "15550001111@s.whatsapp.net");
    assert!(receipt["message_id"].as_str().expect("id").starts_with("SIM."));
}

#[tokio::test]
async fn test_bad_message_type_is_400() {
    let stack = stack().await;
    let session = stack.connected_session("15551234567", &owner()).await;
    let resp = app(&stack)
        .oneshot(request(
            "POST",
            &format!("/sessions/{session}/messages"),
            Some(json!({ "to": "15550001111", "message_type": "carrier-pigeon" })),
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_bulk_job_via_http() {
    let stack = stack().await;
    let session = stack.connected_session("15551234567", &owner()).await;
    let router = app(&stack);

    let resp = router
        .clone()
        .oneshot(request(
            "POST",
            "/bulk-messages",
            Some(json!({
                "session_id": session,
                "message": "Hi {{name}}!",
                "contacts": [
                    { "id": "", "name": "Ada", "phone": "15550001111", "email": "",
                      "company": "", "position": "", "group_id": null, "is_active": true }
                ],
                "delay_between_s": 0,
            })),
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let job = json_body(resp).await;
    let job_id = job["id"].as_str().expect("job id").to_string();

    // Poll the job until it completes.
    let mut done = false;
    for _ in 0..500 {
        let resp = router
            .clone()
            .oneshot(request("GET", &format!("/bulk-messages/{job_id}"), None))
            .await
            .expect("get");
        let view = json_body(resp).await;
        if view["status"] == "completed" {
            assert_eq!(view["progress"]["sent"], 1);
            done = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    assert!(done, "bulk job never completed");
    assert_eq!(stack.sim(&session).sent()[0].body(), "Hi Ada!");
}

#[tokio::test]
async fn test_queue_enqueue_list_stats_via_http() {
    let stack = stack().await;
    let session = stack.connected_session("15551234567", &owner()).await;
    let router = app(&stack);

    let resp = router
        .clone()
        .oneshot(request(
            "POST",
            "/job-queue",
            Some(json!({
                "type": "scheduled_message",
                "session_id": session,
                "phone": "15550001111",
                "message": "later",
                "priority": 5,
                "scheduled_at": chrono::Utc::now().timestamp() + 3600,
            })),
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    let job = json_body(resp).await;
    assert_eq!(job["status"], "scheduled");
    assert_eq!(job["priority"], 5);
    let job_id = job["job_id"].as_str().expect("job id").to_string();

    let resp = router
        .clone()
        .oneshot(request("GET", "/job-queue?type=scheduled_message", None))
        .await
        .expect("list");
    let list = json_body(resp).await;
    assert_eq!(list.as_array().expect("array").len(), 1);

    let resp = router
        .clone()
        .oneshot(request("GET", "/job-queue/stats", None))
        .await
        .expect("stats");
    let stats = json_body(resp).await;
    assert_eq!(stats["scheduled"], 1);

    // DELETE cancels not-yet-running jobs.
    let resp = router
        .clone()
        .oneshot(request("DELETE", &format!("/job-queue/{job_id}"), None))
        .await
        .expect("cancel");
    assert_eq!(resp.status(), StatusCode::OK);
    let cancelled = json_body(resp).await;
    assert_eq!(cancelled["status"], "cancelled");
}

#[tokio::test]
async fn test_media_endpoint_enforces_expiry() {
    let stack = stack().await;
    let stored = stack
        .media
        .store_inbound("15551234567", "MSG1", "image/jpeg", b"fake-jpeg")
        .await
        .expect("store");
    let router = app(&stack);

    let resp = router
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/media/temp/{}?expires={}", stored.file, stored.expires_at),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router
        .oneshot(request(
            "GET",
            &format!("/api/media/temp/{}?expires={}", stored.file, 1),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(resp.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_foreign_user_cannot_see_sessions() {
    let stack = stack().await;
    stack.connected_session("15551234567", &owner()).await;

    let req = Request::builder()
        .method("GET")
        .uri("/sessions/15551234567")
        .header("x-user-id", "intruder")
        .body(Body::empty())
        .expect("request");
    let resp = app(&stack).oneshot(req).await.expect("response");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // The admin role sees every session.
    let req = Request::builder()
        .method("GET")
        .uri("/sessions/15551234567")
        .header("x-user-id", "ops")
        .header("x-user-role", "admin")
        .body(Body::empty())
        .expect("request");
    let resp = app(&stack).oneshot(req).await.expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
}
