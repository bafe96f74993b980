use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use tower::ServiceExt;

use argus_core::models::{ExtractionResult, NewResult, ProductFields, StrategyKind};
use argus_core::task::EnqueueRequest;
use argus_core::task_store::TaskStore;
use argus_server::routes;

use crate::integration::common::{TEST_API_KEY, TestApp, setup_test_app, setup_test_app_no_auth};

fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_API_KEY}"));
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> Response {
    app.router.clone().oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app().await;

    let response = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app().await;

    let response = send(&app, Request::get("/v1/tasks").body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = send(
        &app,
        Request::get("/v1/tasks")
            .header("authorization", "Bearer wrong-key")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "unauthorized");
}

#[tokio::test]
async fn missing_server_key_returns_403() {
    let app = setup_test_app_no_auth().await;

    let response = send(
        &app,
        Request::get("/v1/stats")
            .header("authorization", "Bearer any-token")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "forbidden");
}

#[tokio::test]
async fn enqueue_and_get_task() {
    let app = setup_test_app().await;

    let response = send(
        &app,
        authed(
            "POST",
            "/v1/tasks",
            Some(serde_json::json!({
                "url": "https://Shop.Example/p/1/?utm_source=mail#reviews",
                "priority": 8
            })),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let created = json_body(response).await;
    assert_eq!(created["status"], "pending");
    assert_eq!(created["url"], "https://shop.example/p/1");
    let task_id = created["task_id"].as_str().unwrap().to_string();

    let response = send(&app, authed("GET", &format!("/v1/tasks/{task_id}"), None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let task = json_body(response).await;
    assert_eq!(task["id"], task_id.as_str());
    assert_eq!(task["domain"], "shop.example");
    assert_eq!(task["priority"], 8);
    assert_eq!(task["attempts"], 0);
    assert!(task.get("result").is_none());
}

#[tokio::test]
async fn duplicate_enqueue_is_skipped() {
    let app = setup_test_app().await;
    let body = serde_json::json!({"url": "https://shop.example/p/2"});

    let first = send(&app, authed("POST", "/v1/tasks", Some(body.clone()))).await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);

    let second = send(
        &app,
        authed(
            "POST",
            "/v1/tasks",
            Some(serde_json::json!({"url": "https://shop.example/p/2/?gclid=abc"})),
        ),
    )
    .await;
    assert_eq!(second.status(), StatusCode::OK);
    let json = json_body(second).await;
    assert_eq!(json["status"], "duplicate_skipped");
    assert!(json["task_id"].is_null());

    assert_eq!(app.tasks.counts().await.unwrap().total(), 1);
}

#[tokio::test]
async fn invalid_url_returns_400() {
    let app = setup_test_app().await;

    let response = send(
        &app,
        authed(
            "POST",
            "/v1/tasks",
            Some(serde_json::json!({"url": "ftp://shop.example/p/1"})),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_url");
}

#[tokio::test]
async fn list_tasks_filters_by_status() {
    let app = setup_test_app().await;
    for i in 0..3 {
        app.tasks
            .enqueue(EnqueueRequest::new(format!("https://shop.example/p/{i}")))
            .await
            .unwrap();
    }
    let claimed = app.tasks.claim_next("w1", &[]).await.unwrap().unwrap();

    let response = send(&app, authed("GET", "/v1/tasks?status=pending", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["total"], 2);

    let response = send(&app, authed("GET", "/v1/tasks?status=leased", None)).await;
    let json = json_body(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["tasks"][0]["id"], claimed.id.to_string());
    assert_eq!(json["tasks"][0]["worker_id"], "w1");

    let response = send(&app, authed("GET", "/v1/tasks?limit=1&offset=1", None)).await;
    let json = json_body(response).await;
    assert_eq!(json["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(json["total"], 3);

    let response = send(&app, authed("GET", "/v1/tasks?status=pending&limit=1", None)).await;
    let json = json_body(response).await;
    assert_eq!(json["tasks"].as_array().unwrap().len(), 1);
    assert_eq!(json["total"], 2);

    let response = send(&app, authed("GET", "/v1/tasks?status=bogus", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn completed_task_includes_result() {
    let app = setup_test_app().await;
    app.tasks
        .enqueue(EnqueueRequest::new("https://shop.example/p/9"))
        .await
        .unwrap();
    let task = app.tasks.claim_next("w1", &[]).await.unwrap().unwrap();
    app.tasks.mark_running(task.id).await.unwrap();

    let result_id = app
        .db
        .result_repo()
        .save(&NewResult {
            task_id: task.id,
            url: task.url.clone(),
            canonical_link: None,
            result: ExtractionResult {
                strategy_used: StrategyKind::StructuredData,
                confidence: 0.95,
                fields: ProductFields {
                    title: Some("Widget X".into()),
                    price: Some(180_000.0),
                    original_price: Some(200_000.0),
                    currency: Some("IRT".into()),
                    ..Default::default()
                },
                fallback_count: 0,
            },
            content_hash: "cd".repeat(32),
        })
        .await
        .unwrap();
    app.tasks.mark_completed(task.id, result_id).await.unwrap();

    let response = send(&app, authed("GET", &format!("/v1/tasks/{}", task.id), None)).await;
    let json = json_body(response).await;
    assert_eq!(json["status"], "completed");
    assert_eq!(json["result"]["strategy_used"], "structured_data");
    assert_eq!(json["result"]["fields"]["title"], "Widget X");
    assert_eq!(json["result"]["discount_percent"], 10.0);

    let response = send(
        &app,
        authed(
            "GET",
            "/v1/results/latest?url=https%3A%2F%2Fshop.example%2Fp%2F9%3Futm_medium%3Dx",
            None,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["id"], result_id.to_string());
}

#[tokio::test]
async fn lookup_by_url_and_stats() {
    let app = setup_test_app().await;
    app.tasks
        .enqueue(EnqueueRequest::new("https://shop.example/p/5"))
        .await
        .unwrap();

    let response = send(
        &app,
        authed("GET", "/v1/tasks/lookup?url=https%3A%2F%2FSHOP.example%2Fp%2F5%2F", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["url"], "https://shop.example/p/5");

    let response = send(
        &app,
        authed("GET", "/v1/tasks/lookup?url=https%3A%2F%2Fshop.example%2Fnope", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, authed("GET", "/v1/stats", None)).await;
    let json = json_body(response).await;
    assert_eq!(json["pending"], 1);
    assert_eq!(json["total"], 1);
}

#[tokio::test]
async fn unknown_task_returns_404() {
    let app = setup_test_app().await;

    let id = uuid::Uuid::new_v4();
    let response = send(&app, authed("GET", &format!("/v1/tasks/{id}"), None)).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "not_found");
}

#[tokio::test]
async fn rate_limit_rejects_burst() {
    let app = setup_test_app().await;
    let limited = routes::with_rate_limit(app.router.clone(), Duration::from_secs(60), 2).unwrap();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = limited
            .clone()
            .oneshot(
                Request::get("/health")
                    .header("x-forwarded-for", "203.0.113.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert_eq!(statuses[..2], [StatusCode::OK, StatusCode::OK]);
    assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
}
