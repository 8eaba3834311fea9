mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use common::TestHarness;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use foreman::server::create_app;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_database() {
    let h = TestHarness::new().await;
    let app = create_app(h.state.clone());

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "foreman");
}

#[tokio::test]
async fn test_work_order_to_run_over_http() {
    let h = TestHarness::new().await;
    let app = create_app(h.state.clone());

    let (status, project) = call(
        &app,
        Method::POST,
        "/api/projects",
        Some(json!({ "name": "alpha", "path": "/tmp/alpha" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let project_id = project["id"].as_str().unwrap().to_string();
    assert_eq!(project["base_branch"], "main");

    let (status, wo) = call(
        &app,
        Method::POST,
        &format!("/api/projects/{}/work-orders", project_id),
        Some(json!({ "title": "Add search" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let wo_id = wo["id"].as_str().unwrap().to_string();
    assert_eq!(wo["status"], "backlog");

    let (status, check) = call(
        &app,
        Method::GET,
        &format!("/api/work-orders/{}/ready-check", wo_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["ok"], false);

    let (status, err) = call(
        &app,
        Method::POST,
        &format!("/api/projects/{}/runs", project_id),
        Some(json!({ "work_order_id": wo_id })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["kind"], "not_ready");

    let (status, _) = call(
        &app,
        Method::PATCH,
        &format!("/api/work-orders/{}", wo_id),
        Some(json!({
            "goal": "Full-text search over notes",
            "acceptance_criteria": ["search returns matching notes"],
            "stop_conditions": ["stop if an index service is required"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, wo) = call(
        &app,
        Method::POST,
        &format!("/api/work-orders/{}/status", wo_id),
        Some(json!({ "status": "ready" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(wo["status"], "ready");

    let (status, run) = call(
        &app,
        Method::POST,
        &format!("/api/projects/{}/runs", project_id),
        Some(json!({ "work_order_id": wo_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["status"], "queued");
    let run_id = run["id"].as_str().unwrap().to_string();

    let (status, err) = call(
        &app,
        Method::POST,
        &format!("/api/projects/{}/runs", project_id),
        Some(json!({ "work_order_id": wo_id })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["kind"], "active_run_exists");

    h.wait_for(&run_id, foreman::runs::RunStatus::YouReview).await;

    let (status, merged) = call(
        &app,
        Method::POST,
        &format!("/api/runs/{}/approve", run_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(merged["status"], "merged");

    let (status, runs) = call(
        &app,
        Method::GET,
        &format!("/api/runs?project_id={}&status=merged", project_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);

    let (_, wo) = call(&app, Method::GET, &format!("/api/work-orders/{}", wo_id), None).await;
    assert_eq!(wo["status"], "done");
}

#[tokio::test]
async fn test_communication_actions_and_errors() {
    let h = TestHarness::new().await;
    let project = h.project("alpha").await;
    let app = create_app(h.state.clone());

    let (status, item) = call(
        &app,
        Method::POST,
        &format!("/api/projects/{}/escalations", project.id),
        Some(json!({ "type": "blocked", "summary": "CI is down" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = item["id"].as_str().unwrap().to_string();

    let (status, claimed) = call(
        &app,
        Method::POST,
        &format!("/api/communications/{}/claim", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["status"], "claimed");

    let (status, resolved) = call(
        &app,
        Method::POST,
        &format!("/api/communications/{}/resolve", id),
        Some(json!({ "resolution": "runner restarted" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["resolution"], "runner restarted");

    let (status, err) = call(
        &app,
        Method::POST,
        &format!("/api/communications/{}/escalate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["kind"], "invalid_transition");

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/api/communications/{}/teleport", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, err) = call(&app, Method::GET, "/api/runs/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["kind"], "not_found");

    let (status, budget) = call(&app, Method::GET, "/api/budget", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(budget["monthly_budget"], 100.0);
}
