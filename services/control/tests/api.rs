//! HTTP command surface end to end.


use edgeward_control::{api, app::AppState};
use harness::{container, Stack, OPERATOR};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

struct ApiFixture {
    base_url: String,
    client: reqwest::Client,
    stack: Stack,
}

impl ApiFixture {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str, workload: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .bearer_auth(format!("workload:{workload}"))
    }

    fn post(&self, path: &str, workload: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(format!("workload:{workload}"))
    }

    fn delete(&self, path: &str, workload: &str) -> reqwest::RequestBuilder {
        self.client
            .delete(self.url(path))
            .bearer_auth(format!("workload:{workload}"))
    }
}

async fn start_api() -> ApiFixture {
    let stack = Stack::builder()
        .allocate("teamA", 5000)
        .allocate("teamA", 6000)
        .allocate("teamB", 5073)
        .host_listener(5000)
        .container(container("web", &["net-tunnel"], &[(5073, None)]))
        .build();

    let app = api::create_router(AppState::new(stack.broker.clone(), stack.store.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ApiFixture {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        stack,
    }
}

async fn create(fixture: &ApiFixture, workload: &str, body: Value) -> reqwest::Response {
    fixture
        .post("/v1/routes", workload)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_endpoints_need_no_identity() {
    let fixture = start_api().await;

    for path in ["/healthz", "/livez", "/readyz"] {
        let response = fixture.client.get(fixture.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }

    let body: Value = fixture
        .client
        .get(fixture.url("/readyz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["components"]["state_store"]["status"], "ok");
}

#[tokio::test]
async fn requests_without_identity_are_rejected() {
    let fixture = start_api().await;

    let response = fixture
        .client
        .get(fixture.url("/v1/routes"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "missing_authorization");
}

#[tokio::test]
async fn route_lifecycle() {
    let fixture = start_api().await;

    let response = create(
        &fixture,
        "teamA",
        json!({"subdomain": "api", "domain": "example.com", "target_port": 5000}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["public_url"], "https://api.example.com");
    assert_eq!(body["target"], "host:localhost:5000");
    assert_eq!(body["owning_workload"], "teamA");

    let response = create(
        &fixture,
        "teamA",
        json!({"subdomain": "api", "domain": "example.com", "target_port": 5000}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "conflict");
    assert_eq!(problem["detail"], "api.example.com already in use");
    assert_eq!(problem["retryable"], false);
    assert!(problem["hint"].is_string());

    let list: Value = fixture
        .get("/v1/routes", "teamA")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let response = fixture
        .delete("/v1/routes/api.example.com", "teamA")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deleted: Value = response.json().await.unwrap();
    assert_eq!(deleted["status"], "deleted");
    assert!(deleted.get("warnings").is_none());

    fixture.stack.assert_consistent();
    assert!(fixture.stack.active_hostnames().is_empty());
}

#[tokio::test]
async fn container_route_over_http() {
    let fixture = start_api().await;

    let response = create(
        &fixture,
        "teamB",
        json!({"subdomain": "app", "domain": "example.com", "target_port": 5073}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["target"], "container:web:5073");
    assert_eq!(body["target_kind"], "container");
}

#[tokio::test]
async fn error_statuses() {
    let fixture = start_api().await;

    // Port belongs to teamB
    let response = create(
        &fixture,
        "teamA",
        json!({"subdomain": "x", "domain": "example.com", "target_port": 5073}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Allocated but nothing listens
    let response = create(
        &fixture,
        "teamA",
        json!({"subdomain": "y", "domain": "example.com", "target_port": 6000}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "unreachable");
    assert!(problem["hint"].as_str().unwrap().contains("cloudflared"));

    let response = create(
        &fixture,
        "teamA",
        json!({"subdomain": "bad_label", "domain": "example.com", "target_port": 5000}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = fixture
        .delete("/v1/routes/ghost.example.com", "teamA")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "not_found");
}

#[tokio::test]
async fn privileged_flag_only_counts_for_operators() {
    let fixture = start_api().await;
    create(
        &fixture,
        "teamA",
        json!({"subdomain": "api", "domain": "example.com", "target_port": 5000}),
    )
    .await;

    let list: Value = fixture
        .get("/v1/routes?workload=teamA&privileged=true", "teamB")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list["items"].as_array().unwrap().is_empty());

    let response = fixture
        .delete("/v1/routes/api.example.com?privileged=true", "teamB")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let list: Value = fixture
        .get("/v1/routes?privileged=true", OPERATOR)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let response = fixture
        .delete("/v1/routes/api.example.com?privileged=true", OPERATOR)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn zones_and_status() {
    let fixture = start_api().await;

    let zones: Value = fixture
        .get("/v1/zones", "teamA")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(zones["items"][0]["domain"], "example.com");
    assert!(zones["refreshed_at"].is_string());

    let status: Value = fixture
        .get("/v1/status", "teamA")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["tunnel_id"], "tunnel-1");
    assert_eq!(status["state"], "up");
    assert_eq!(status["active_routes"], 0);
}

#[tokio::test]
async fn problems_carry_the_request_id() {
    let stack = Stack::builder().build();
    let app = api::create_router(AppState::new(stack.broker.clone(), stack.store.clone()));

    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri("/v1/routes/ghost.example.com")
                .method("DELETE")
                .header("authorization", "Bearer workload:teamA")
                .header("x-request-id", "req-42")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-request-id"], "req-42");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let problem: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(problem["request_id"], "req-42");
}

#[tokio::test]
async fn malformed_bodies_and_unknown_paths_are_problems() {
    let fixture = start_api().await;

    let response = fixture
        .post("/v1/routes", "teamA")
        .header("content-type", "application/json")
        .body(r#"{"subdomain": "api", "domain": "example.com"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_body");
    assert!(problem["request_id"].is_string());

    let response = fixture.get("/v2/routes", "teamA").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let problem: Value = response.json().await.unwrap();
    assert_eq!(problem["code"], "unknown_endpoint");
}
