//! End-to-end tests driving the full router: pipeline, gate, routes and
//! error rendering together.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    AUTHORIZATION, CONTENT_TYPE, ORIGIN, WWW_AUTHENTICATE,
};
use http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::auth::jwks::JwksCacheOptions;
use crate::auth::test_support::*;
use crate::auth::{JwksCache, TokenValidator, ValidationOptions};
use crate::build_router;
use crate::config::{AuthSettings, CorsModeSetting, Settings};

fn static_validator() -> Arc<TokenValidator> {
    let keys = Arc::new(JwksCache::from_document(jwks_document()).unwrap());
    Arc::new(TokenValidator::new(
        ValidationOptions::new(TEST_ISSUER, vec![TEST_AUDIENCE.to_string()]),
        keys,
    ))
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth = Some(AuthSettings::new(
        TEST_ISSUER,
        vec![TEST_AUDIENCE.to_string()],
        "https://login.example.com/keys",
    ));
    settings.cors.origins = vec!["https://a.com".to_string(), "http://localhost:*".to_string()];
    settings
}

fn app() -> Router {
    build_router(&settings(), Some(static_validator()))
}

fn request(method: Method, uri: &str) -> http::request::Builder {
    Request::builder().method(method).uri(uri)
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_permissive_preflight_echoes_origin() {
    let mut settings = settings();
    settings.cors.mode = CorsModeSetting::Permissive;
    let app = build_router(&settings, Some(static_validator()));

    let response = app
        .oneshot(
            request(Method::OPTIONS, "/api/compounds")
                .header(ORIGIN, "https://random.site")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://random.site"
    );
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(response.headers().get(ACCESS_CONTROL_MAX_AGE).is_some());
}

#[tokio::test]
async fn test_preflight_on_mandatory_route_needs_no_token() {
    let response = app()
        .oneshot(
            request(Method::OPTIONS, "/api/user/me")
                .header(ORIGIN, "https://a.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.com");
}

#[tokio::test]
async fn test_valid_token_reaches_protected_route() {
    let response = app()
        .oneshot(
            request(Method::GET, "/api/user/me")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["id"], "user-42");
    assert_eq!(body["data"]["tenant_id"], "tenant-1");
    assert_eq!(body["data"]["source"], "token");
}

#[tokio::test]
async fn test_expired_token_is_401_with_cors() {
    let token = sign(&with(valid_claims(), "exp", json!(now() - 600)));
    let response = app()
        .oneshot(
            request(Method::GET, "/api/compounds")
                .header(ORIGIN, "https://a.com")
                .header(AUTHORIZATION, bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.com");

    let body = body_json(response).await;
    assert_eq!(body["detail"], "Authentication required");
    assert_eq!(body["status_code"], 401);
    assert_eq!(body["auth_info"]["type"], "Bearer");
}

#[tokio::test]
async fn test_wrong_audience_is_401_not_403() {
    let token = sign(&with(valid_claims(), "aud", json!("someone-else")));
    let response = app()
        .oneshot(
            request(Method::GET, "/api/test-connection")
                .header(AUTHORIZATION, bearer(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_provider_timeout_is_401() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let keys = JwksCache::remote(
        format!("http://{}/keys", addr),
        JwksCacheOptions {
            fetch_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .unwrap();
    let validator = TokenValidator::new(
        ValidationOptions::new(TEST_ISSUER, vec![TEST_AUDIENCE.to_string()]),
        Arc::new(keys),
    );
    let app = build_router(&settings(), Some(Arc::new(validator)));

    let response = app
        .oneshot(
            request(Method::GET, "/api/documents")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_origin_gets_no_cors_headers() {
    let response = app()
        .oneshot(
            request(Method::GET, "/health")
                .header(ORIGIN, "https://app.example.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    assert!(response.headers().get(ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
}

#[tokio::test]
async fn test_wildcard_origin_matches() {
    let response = app()
        .oneshot(
            request(Method::GET, "/health")
                .header(ORIGIN, "http://localhost:5173")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:5173"
    );
}

#[tokio::test]
async fn test_not_found_carries_path() {
    let response = app()
        .oneshot(
            request(Method::GET, "/api/nothing-here")
                .header(ORIGIN, "https://a.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.com");
    let body = body_json(response).await;
    assert_eq!(body["path"], "/api/nothing-here");
    assert_eq!(body["status_code"], 404);
}

#[tokio::test]
async fn test_auth_status_without_token() {
    let response = app()
        .oneshot(
            request(Method::GET, "/api/auth/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["authenticated"], false);
}

#[tokio::test]
async fn test_auth_status_debug_fallback() {
    let mut settings = settings();
    settings.debug = true;
    let app = build_router(&settings, Some(static_validator()));

    let response = app
        .clone()
        .oneshot(
            request(Method::GET, "/api/auth/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user"]["id"], "debug-user-id");
    assert_eq!(body["source"], "debug_fallback");

    // Mandatory routes never see the fallback.
    let response = app
        .oneshot(request(Method::GET, "/api/user/me").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_root_reports_optional_user() {
    let response = app()
        .oneshot(
            request(Method::GET, "/")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["user_info"]["authenticated"], true);
    assert_eq!(body["user_info"]["name"], "Ada Lovelace");
}

#[tokio::test]
async fn test_crud_round_trip() {
    let app = app();
    let token = bearer(&sign(&valid_claims()));

    let response = app
        .clone()
        .oneshot(
            request(Method::POST, "/api/templates")
                .header(AUTHORIZATION, &token)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"code":"T-1","name":"Template one"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            request(Method::GET, &format!("/api/templates/{}", id))
                .header(AUTHORIZATION, &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["name"], "Template one");

    let response = app
        .clone()
        .oneshot(
            request(Method::POST, "/api/templates")
                .header(AUTHORIZATION, &token)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"code":"T-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            request(Method::DELETE, &format!("/api/templates/{}", id))
                .header(AUTHORIZATION, &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            request(Method::GET, &format!("/api/templates/{}", id))
                .header(AUTHORIZATION, &token)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["detail"], format!("Template with id {} not found", id));
}

#[tokio::test]
async fn test_init_defaults() {
    let response = app()
        .oneshot(
            request(Method::POST, "/api/compounds/init-defaults")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body.as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_missing_write_role_is_403_with_cors() {
    let mut settings = settings();
    settings.authorization.write_role = Some("admin".to_string());
    let app = build_router(&settings, Some(static_validator()));

    let response = app
        .oneshot(
            request(Method::POST, "/api/compounds")
                .header(ORIGIN, "https://a.com")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"code":"C-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "https://a.com");
    assert_eq!(body_json(response).await["detail"], "Access forbidden");
}

#[tokio::test]
async fn test_writer_role_may_write() {
    let mut settings = settings();
    settings.authorization.write_role = Some("writer".to_string());
    let app = build_router(&settings, Some(static_validator()));

    let response = app
        .oneshot(
            request(Method::POST, "/api/compounds")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"code":"C-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_unconfigured_provider_rejects_tokens() {
    let mut settings = settings();
    settings.auth = None;
    let app = build_router(&settings, None);

    let response = app
        .oneshot(
            request(Method::GET, "/api/user/me")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_record_id_is_400() {
    let response = app()
        .oneshot(
            request(Method::GET, "/api/compounds/not-a-uuid")
                .header(AUTHORIZATION, bearer(&sign(&valid_claims())))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
