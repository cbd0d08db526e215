//! HTTP surface tests: callback, manual exchange, status, and login

use std::sync::Arc;

use axum_test::TestServer;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tokenkeeper::authority::OAuth2Authority;
use tokenkeeper::http::{build_router, AppState};
use tokenkeeper::store::InMemoryTokenStore;
use tokenkeeper::{ClientId, ClientSecret, KeeperConfig, Scope, TokenKeeper, TokenLifetimeConfig};

fn authority(provider: &MockServer) -> OAuth2Authority {
    let base = reqwest::Url::parse(&provider.uri()).unwrap();
    OAuth2Authority::new(
        reqwest::Client::new(),
        base.join("/v1/oauth/token").unwrap(),
        base.join("/v1/oauth/authorize").unwrap(),
        "https://app.example.com/oauth/callback".into(),
        ClientId::from_static("my-client"),
        ClientSecret::from_static("hush"),
        Scope::from_static("accounts trading"),
    )
}

async fn serve(provider: &MockServer) -> TestServer {
    let authority = authority(provider);
    let authorization_url = authority.authorization_url();
    let handle = TokenKeeper::spawn(
        InMemoryTokenStore::new(),
        authority,
        TokenLifetimeConfig::default(),
        KeeperConfig::default(),
    )
    .await
    .unwrap();

    let state = Arc::new(AppState {
        handle,
        authorization_url,
    });
    TestServer::new(build_router(state)).unwrap()
}

fn mock_token_grant(access: &str, refresh: &str) -> Mock {
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
}

#[tokio::test]
async fn status_starts_unauthorized() {
    let provider = MockServer::start().await;
    let server = serve(&provider).await;

    let resp = server.get("/token/status").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["state"], "unauthorized");
    assert!(body.get("expires_in").is_none());
}

#[tokio::test]
async fn login_returns_the_authorization_url() {
    let provider = MockServer::start().await;
    let server = serve(&provider).await;

    let resp = server.get("/oauth/login").await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    let url = body["authorization_url"].as_str().unwrap();
    assert!(url.contains("client_id=my-client"));
    assert!(url.contains("response_type=code"));
}

#[tokio::test]
async fn callback_exchanges_the_code_without_echoing_secrets() {
    let provider = MockServer::start().await;
    mock_token_grant("super-secret-access-token", "rt-1")
        .expect(1)
        .mount(&provider)
        .await;
    let server = serve(&provider).await;

    let resp = server.get("/oauth/callback?code=abc123").await;
    resp.assert_status_ok();
    assert_eq!(resp.header("cache-control"), "no-store");

    // the confirmation page must not leak the token or the code
    let page = resp.text();
    assert!(!page.contains("super-secret-access-token"));
    assert!(!page.contains("abc123"));

    let status: serde_json::Value = server.get("/token/status").await.json();
    assert_eq!(status["state"], "valid");
    assert!(status["expires_in"].as_u64().unwrap() > 3_000);
}

#[tokio::test]
async fn callback_with_provider_error_is_a_bad_request() {
    let provider = MockServer::start().await;
    let server = serve(&provider).await;

    let resp = server.get("/oauth/callback?error=access_denied").await;
    resp.assert_status_bad_request();
    assert_eq!(resp.header("cache-control"), "no-store");
    assert!(resp.text().contains("access_denied"));
}

#[tokio::test]
async fn callback_without_code_or_error_is_a_bad_request() {
    let provider = MockServer::start().await;
    let server = serve(&provider).await;

    let resp = server.get("/oauth/callback").await;
    resp.assert_status_bad_request();
}

#[tokio::test]
async fn manual_exchange_accepts_json_and_rejects_replays() {
    let provider = MockServer::start().await;
    mock_token_grant("at-1", "rt-1").expect(1).mount(&provider).await;
    let server = serve(&provider).await;

    let resp = server
        .post("/token/exchange")
        .json(&serde_json::json!({ "code": "abc123" }))
        .await;
    resp.assert_status_ok();
    let body: serde_json::Value = resp.json();
    assert_eq!(body["status"], "authorized");

    let replay = server
        .post("/token/exchange")
        .json(&serde_json::json!({ "code": "abc123" }))
        .await;
    replay.assert_status_bad_request();
    let body: serde_json::Value = replay.json();
    assert!(body["error"].as_str().unwrap().contains("already consumed"));
}

#[tokio::test]
async fn provider_outage_maps_to_bad_gateway() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&provider)
        .await;
    let server = serve(&provider).await;

    let resp = server
        .post("/token/exchange")
        .json(&serde_json::json!({ "code": "abc123" }))
        .await;
    resp.assert_status(axum::http::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn provider_denial_maps_to_bad_request() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
        })))
        .mount(&provider)
        .await;
    let server = serve(&provider).await;

    let resp = server
        .post("/token/exchange")
        .json(&serde_json::json!({ "code": "bad-code" }))
        .await;
    resp.assert_status_bad_request();
}
