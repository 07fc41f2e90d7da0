//! Identity API endpoints
//!
//! - POST /api/v1/identity/register - Create an account
//! - POST /api/v1/identity/login - Open a session
//! - POST /api/v1/identity/validate - Check an access token
//! - POST /api/v1/identity/refresh - Mint a new access token
//! - POST /api/v1/identity/users/lookup - Find a user by contact info

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{ApiError, AppState};
use crate::models::{ContactInfo, Credentials, NewUser, PermissionRef, TokenDetail, User};

/// Request body for user registration
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_name: String,
    pub password: String,
    #[serde(default)]
    pub contact_info: ContactInfo,
    #[serde(default)]
    pub permissions: Vec<PermissionRef>,
}

/// Request body for user login
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_name: String,
    pub password: String,
}

/// Response for user info
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: String,
    pub user_name: String,
    pub contact_info: ContactInfo,
    pub status: String,
    pub permissions: Vec<PermissionRef>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            user_name: user.user_name,
            contact_info: user.contact_info,
            status: user.status.status.to_string(),
            permissions: user.permissions,
            created_at: user.created_at.to_rfc3339(),
            updated_at: user.updated_at.to_rfc3339(),
        }
    }
}

/// Build the identity router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/validate", post(validate))
        .route("/refresh", post(refresh))
        .route("/users/lookup", post(lookup_user))
}

/// POST /api/v1/identity/register - User registration
async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let input = NewUser {
        user_name: body.user_name,
        password: body.password,
        contact_info: body.contact_info,
        status: None,
        permissions: body.permissions,
    };

    let user = state
        .identity
        .register(&state.request_context(), input)
        .await?;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

/// POST /api/v1/identity/login - User login
async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenDetail>, ApiError> {
    let detail = state
        .identity
        .login(
            &state.request_context(),
            Credentials::new(body.user_name, body.password),
        )
        .await?;

    Ok(Json(detail))
}

/// POST /api/v1/identity/validate - Access token validation
///
/// The token may be given in the body or as an `Authorization: Bearer` header.
async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<TokenDetail>,
) -> Result<Json<TokenDetail>, ApiError> {
    if body.access_token.is_empty() {
        body.access_token = bearer_token(&headers)
            .ok_or_else(|| ApiError::unauthorized("Missing access token"))?;
    }

    let detail = state
        .identity
        .validate(&state.request_context(), body)
        .await?;

    Ok(Json(detail))
}

/// POST /api/v1/identity/refresh - Access token renewal
async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<TokenDetail>,
) -> Result<Json<TokenDetail>, ApiError> {
    let detail = state
        .identity
        .refresh_token(&state.request_context(), body)
        .await?;

    Ok(Json(detail))
}

/// POST /api/v1/identity/users/lookup - Find a user by email, mobile or phone
async fn lookup_user(
    State(state): State<AppState>,
    Json(body): Json<ContactInfo>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state
        .identity
        .get_user(&state.request_context(), body)
        .await?;

    Ok(Json(user.into()))
}

/// Extract a bearer token from the Authorization header
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn test_bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert!(bearer_token(&headers).is_none());
        assert!(bearer_token(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_register_request_defaults() {
        let body: RegisterRequest =
            serde_json::from_str(r#"{"user_name":"alice","password":"pw1"}"#).unwrap();
        assert!(body.contact_info.is_empty());
        assert!(body.permissions.is_empty());
    }
}
