//! REST surface tests driving the axum router directly.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use moor_sandbox::SandboxManager;
use moor_sandbox::mock::MockProvider;
use moor_server::{AppState, ServerConfig, Store};
use moor_shared::crypto::EnvelopeCipher;
use moor_shared::models::sandbox::ProviderType;

fn test_router() -> Router {
    let cipher = EnvelopeCipher::from_key_bytes(&[7u8; 32]);
    let store = Store::open_in_memory(cipher).expect("store");

    let mut manager = SandboxManager::new(ProviderType::Mock);
    manager.register(Arc::new(MockProvider::new()));

    let state = AppState::new(store, Arc::new(manager), ServerConfig::default());
    moor_server::router(state)
}

async fn request(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    };

    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_ok_and_version() {
    let router = test_router();
    let (status, body) = request(&router, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ok"], true);
    assert!(body["data"]["version"].is_string());
    assert!(body["error"].is_null());
}

#[tokio::test]
async fn session_lifecycle_over_rest() {
    let router = test_router();

    let (status, body) = request(
        &router,
        "POST",
        "/api/sessions",
        Some(json!({"mode": "chat"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = body["data"]["id"].as_str().expect("id").to_string();
    assert_eq!(body["data"]["status"], "creating");
    assert_eq!(
        body["data"]["wsEndpoint"],
        format!("/ws/sessions/{session_id}")
    );

    // Provisioning over the mock provider resolves quickly.
    let mut ready = false;
    for _ in 0..200 {
        let (_, body) =
            request(&router, "GET", &format!("/api/sessions/{session_id}"), None).await;
        if body["data"]["status"] == "ready" {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready, "session never became ready");

    let (status, body) = request(
        &router,
        "GET",
        &format!("/api/sessions/{session_id}/connect"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sandboxReady"], true);
    assert_eq!(body["data"]["lastSeq"], 0);

    let (status, body) = request(
        &router,
        "GET",
        &format!("/api/sessions/{session_id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["events"], json!([]));

    let (status, _) = request(
        &router,
        "DELETE",
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) =
        request(&router, "GET", &format!("/api/sessions/{session_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["data"].is_null());

    let (_, body) = request(&router, "GET", "/api/sessions", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn invalid_session_requests_are_rejected() {
    let router = test_router();

    let (status, body) = request(
        &router,
        "POST",
        "/api/sessions",
        Some(json!({"mode": "quantum"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION");

    let (status, body) = request(
        &router,
        "POST",
        "/api/sessions",
        Some(json!({"mode": "code"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]["message"]
            .as_str()
            .expect("message")
            .contains("repoId")
    );

    let (status, _) = request(&router, "GET", "/api/sessions/unknown-id", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn secrets_rest_never_exposes_plaintext() {
    let router = test_router();

    let (status, body) = request(
        &router,
        "PUT",
        "/api/secrets/anthropic_api_key",
        Some(json!({"value": "sk-ant-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["envVarName"], "ANTHROPIC_API_KEY");
    assert_eq!(body["data"]["kind"], "ai_provider");
    assert!(
        !body.to_string().contains("sk-ant-secret"),
        "plaintext must not appear in the response"
    );

    let (_, body) = request(&router, "GET", "/api/secrets", None).await;
    let listed = body["data"].as_array().expect("array");
    assert_eq!(listed.len(), 1);
    assert!(!body.to_string().contains("sk-ant-secret"));

    // Custom secrets need kind + envVarName.
    let (status, _) = request(
        &router,
        "PUT",
        "/api/secrets/my_custom",
        Some(json!({"value": "v"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(
        &router,
        "PUT",
        "/api/secrets/my_custom",
        Some(json!({"value": "v", "kind": "env_var", "envVarName": "MY_VAR"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(&router, "DELETE", "/api/secrets/my_custom", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(&router, "DELETE", "/api/secrets/my_custom", None).await;
    assert_eq!(status, StatusCode::OK, "delete is idempotent");
}

#[tokio::test]
async fn environments_enforce_a_single_default() {
    let router = test_router();

    let (status, body) = request(
        &router,
        "POST",
        "/api/environments",
        Some(json!({
            "name": "small",
            "sandboxType": "mock",
            "image": "agent:one",
            "resources": "small",
            "isDefault": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first_id = body["data"]["id"].as_str().expect("id").to_string();

    let (status, _) = request(
        &router,
        "POST",
        "/api/environments",
        Some(json!({
            "name": "big",
            "sandboxType": "mock",
            "image": "agent:two",
            "resources": "large",
            "isDefault": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = request(&router, "GET", "/api/environments", None).await;
    let environments = body["data"].as_array().expect("array");
    let defaults: Vec<&Value> = environments
        .iter()
        .filter(|environment| environment["isDefault"] == true)
        .collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0]["name"], "big");

    let (status, _) = request(
        &router,
        "DELETE",
        &format!("/api/environments/{first_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &router,
        "PUT",
        "/api/environments/does-not-exist",
        Some(json!({"name": "x", "sandboxType": "mock", "image": "i"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn provider_status_lists_all_provider_types() {
    let router = test_router();
    let (status, body) = request(&router, "GET", "/api/providers", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["mock"]["enabled"], true);
    assert_eq!(body["data"]["mock"]["available"], true);
    assert_eq!(body["data"]["container"]["enabled"], false);
    assert_eq!(body["data"]["microvm"]["enabled"], false);
}
