//! Health check endpoint
//!
//! GET /health pings the user directory and the session store.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::api::middleware::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub directory: &'static str,
    pub session_store: &'static str,
}

fn component_status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "unavailable"
    }
}

/// GET /health - Liveness of the backing stores
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let ctx = state.request_context();

    let directory = match state.users.ping(&ctx).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "User directory health check failed");
            false
        }
    };
    let session_store = match state.sessions.ping(&ctx).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Session store health check failed");
            false
        }
    };

    let healthy = directory && session_store;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: component_status(healthy),
            directory: component_status(directory),
            session_store: component_status(session_store),
        }),
    )
}
