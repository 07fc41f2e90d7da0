//! API layer - HTTP handlers and routing
//!
//! JSON endpoints for the identity operations under `/api/v1/identity`, plus
//! `GET /health`.

pub mod auth;
pub mod health;
pub mod middleware;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use middleware::{ApiError, AppState};

/// Build the main API router
pub fn build_api_router() -> Router<AppState> {
    Router::new().nest("/identity", auth::router())
}

/// Build the complete router with middleware
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", build_api_router())
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::ScriptedBackend;
    use crate::cache::{MemorySessionBackend, SessionBackend, SessionStore};
    use crate::db::repositories::SqlxUserRepository;
    use crate::db::{create_test_pool, migrations};
    use crate::models::TokenDetail;
    use crate::services::{IdentityService, TokenAuthority};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup_with_backend(backend: Arc<dyn SessionBackend>) -> Router {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let users = SqlxUserRepository::boxed(pool);
        let sessions = Arc::new(SessionStore::new(backend, 2, Duration::ZERO));
        let tokens = Arc::new(TokenAuthority::new(
            "access-secret",
            "refresh-secret",
            Duration::from_secs(900),
            Duration::from_secs(3600),
        ));
        let identity = Arc::new(IdentityService::new(users.clone(), sessions.clone(), tokens));

        build_router(AppState {
            identity,
            users,
            sessions,
            request_timeout: Duration::from_secs(10),
        })
    }

    async fn setup_test_app() -> Router {
        setup_with_backend(Arc::new(MemorySessionBackend::new())).await
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

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

    async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        send(app, Method::POST, uri, Some(body)).await
    }

    fn alice() -> Value {
        json!({
            "user_name": "alice",
            "password": "pw1",
            "contact_info": { "email": "alice@x.com" }
        })
    }

    #[tokio::test]
    async fn test_register_returns_created_without_hash() {
        let app = setup_test_app().await;

        let (status, body) = post(&app, "/api/v1/identity/register", alice()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user_name"], "alice");
        assert_eq!(body["status"], "active");
        assert!(body.get("password_hash").is_none());

        let (status, body) = post(&app, "/api/v1/identity/register", alice()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn test_register_missing_email_is_bad_request() {
        let app = setup_test_app().await;
        let (status, body) = post(
            &app,
            "/api/v1/identity/register",
            json!({ "user_name": "alice", "password": "pw1" }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_login_validate_refresh_flow() {
        let app = setup_test_app().await;
        post(&app, "/api/v1/identity/register", alice()).await;

        let (status, body) = post(
            &app,
            "/api/v1/identity/login",
            json!({ "user_name": "alice", "password": "pw1" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let detail: TokenDetail = serde_json::from_value(body).unwrap();
        assert!(!detail.access_token.is_empty());
        assert!(!detail.refresh_token.is_empty());

        let (status, body) = post(
            &app,
            "/api/v1/identity/validate",
            json!({ "access_token": detail.access_token, "user_id": detail.user_id }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["access_session_id"], detail.access_session_id.as_str());

        let (status, body) = post(
            &app,
            "/api/v1/identity/refresh",
            serde_json::to_value(&detail).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refresh_token"], detail.refresh_token.as_str());
        assert_ne!(body["access_token"], detail.access_token.as_str());

        // The replaced access token is revoked
        let (status, _) = post(
            &app,
            "/api/v1/identity/validate",
            json!({ "access_token": detail.access_token, "user_id": detail.user_id }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_validate_accepts_authorization_header() {
        let app = setup_test_app().await;
        post(&app, "/api/v1/identity/register", alice()).await;
        let (_, body) = post(
            &app,
            "/api/v1/identity/login",
            json!({ "user_name": "alice", "password": "pw1" }),
        )
        .await;
        let detail: TokenDetail = serde_json::from_value(body).unwrap();

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/identity/validate")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", detail.access_token))
            .body(Body::from(json!({ "user_id": detail.user_id }).to_string()))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_credentials_and_tokens_are_unauthorized() {
        let app = setup_test_app().await;
        post(&app, "/api/v1/identity/register", alice()).await;

        let (status, body) = post(
            &app,
            "/api/v1/identity/login",
            json!({ "user_name": "alice", "password": "wrong" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHORIZED");

        let (status, body) = post(
            &app,
            "/api/v1/identity/validate",
            json!({ "access_token": "not-a-jwt", "user_id": "x" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "MALFORMED_TOKEN");
    }

    #[tokio::test]
    async fn test_lookup_user() {
        let app = setup_test_app().await;
        post(&app, "/api/v1/identity/register", alice()).await;

        let (status, body) = post(
            &app,
            "/api/v1/identity/users/lookup",
            json!({ "email": "alice@x.com" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_name"], "alice");

        let (status, _) = post(
            &app,
            "/api/v1/identity/users/lookup",
            json!({ "email": "nobody@x.com" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = post(&app, "/api/v1/identity/users/lookup", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lookup_user_by_mobile_or_phone() {
        let app = setup_test_app().await;
        let (status, _) = post(
            &app,
            "/api/v1/identity/register",
            json!({
                "user_name": "alice",
                "password": "pw1",
                "contact_info": {
                    "email": "alice@x.com",
                    "mobile": "+15550100",
                    "phone": "+15550199"
                }
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = post(
            &app,
            "/api/v1/identity/users/lookup",
            json!({ "mobile": "+15550100" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_name"], "alice");

        let (status, body) = post(
            &app,
            "/api/v1/identity/users/lookup",
            json!({ "phone": "+15550199" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_name"], "alice");

        let (status, body) = post(&app, "/api/v1/identity/users/lookup", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health() {
        let app = setup_test_app().await;
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_session_store_outage_is_service_unavailable() {
        let backend = Arc::new(ScriptedBackend::new());
        let app = setup_with_backend(backend.clone()).await;
        post(&app, "/api/v1/identity/register", alice()).await;

        backend.sever(2);
        let (status, body) = post(
            &app,
            "/api/v1/identity/login",
            json!({ "user_name": "alice", "password": "pw1" }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["details"]["attempts"], 2);

        backend.sever(2);
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["directory"], "ok");
        assert_eq!(body["session_store"], "unavailable");
    }
}
