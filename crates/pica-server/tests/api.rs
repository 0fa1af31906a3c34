//! Router-level tests for the REST control plane.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use pica_core::policy::Policy;
use pica_core::scheduler::Scheduler;
use pica_core::store::Library;
use pica_server::api::{router, AppState};

/// Router over a fresh storage dir. The worker ceiling is zero so created
/// tasks stay queued and every transition below is deterministic.
async fn test_router(api_key: Option<&str>) -> (Router, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let db = Library::open_at(tmp.path().join("library.db"))
        .await
        .unwrap();
    let mut policy = Policy::default();
    policy.max_concurrent = 0;
    let scheduler = Scheduler::new(db, tmp.path().to_path_buf(), policy);
    let state = AppState {
        scheduler,
        api_key: api_key.map(Into::into),
    };
    (router(state), tmp)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn create_get_pause_delete_roundtrip() {
    let (app, _tmp) = test_router(None).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/v1/tasks/download",
            serde_json::json!({"source": "nhentai", "target": "177013", "eps": [0, 1]}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], true);
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(get(&format!("/api/v1/tasks/{task_id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["task"]["status"], "queued");
    assert_eq!(body["task"]["source"], "nhentai");
    assert_eq!(body["task"]["params"]["eps"], serde_json::json!([0, 1]));

    let resp = app
        .clone()
        .oneshot(get("/api/v1/tasks?limit=10"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    let resp = app
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/tasks/{task_id}/pause"),
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get(&format!("/api/v1/tasks/{task_id}")))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["task"]["status"], "paused");

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/tasks/{task_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(get(&format!("/api/v1/tasks/{task_id}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_create_is_a_conflict() {
    let (app, _tmp) = test_router(None).await;
    let req = serde_json::json!({"source": "nhentai", "target": "42"});

    let resp = app
        .clone()
        .oneshot(post_json("/api/v1/tasks/download", req.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(post_json("/api/v1/tasks/download", req))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_json(resp).await;
    assert_eq!(body["error"], "task already exists");
}

#[tokio::test]
async fn bad_source_and_target_are_rejected() {
    let (app, _tmp) = test_router(None).await;

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/v1/tasks/download",
            serde_json::json!({"source": "mangadex", "target": "1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/v1/tasks/download",
            serde_json::json!({"source": "jm", "target": "letters"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/v1/tasks/nope/explode",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn config_get_and_put() {
    let (app, _tmp) = test_router(None).await;

    let resp = app.clone().oneshot(get("/api/v1/tasks/config")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["fileConcurrent"], 6);

    let resp = app
        .clone()
        .oneshot(put_json(
            "/api/v1/tasks/config",
            serde_json::json!({"maxConcurrent": 99, "fileConcurrent": 2}),
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    // Values come back clamped.
    assert_eq!(body["maxConcurrent"], 20);
    assert_eq!(body["fileConcurrent"], 2);
}

#[tokio::test]
async fn auth_roundtrip() {
    let (app, _tmp) = test_router(None).await;

    let resp = app.clone().oneshot(get("/api/v1/auth/ehentai")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["exists"], false);

    let resp = app
        .clone()
        .oneshot(put_json(
            "/api/v1/auth/ehentai",
            serde_json::json!({"cookie": "ipb_member_id=1"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.clone().oneshot(get("/api/v1/auth/ehentai")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["exists"], true);
    assert!(body["updatedAt"].as_i64().unwrap() > 0);

    let resp = app.clone().oneshot(get("/api/v1/auth/unknown")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn api_key_gate() {
    let (app, _tmp) = test_router(Some("sekrit")).await;

    let resp = app.clone().oneshot(get("/api/v1/tasks")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tasks")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/tasks")
                .header("x-api-key", "sekrit")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
