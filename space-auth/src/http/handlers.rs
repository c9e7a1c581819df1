//! HTTP handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::extract::{Authenticated, JsonBody};
use crate::error::{Error, Result};
use crate::service::{ClientMeta, LoginOutcome, RefreshOutcome};
use crate::session::Session;
use crate::state::AppState;
use uuid::Uuid;

/// Success envelope: `{"status":"success","data":...}`
#[derive(Debug, Clone, Serialize)]
pub struct ApiSuccess<T> {
    status: &'static str,
    data: T,
}

impl<T> ApiSuccess<T> {
    /// Wrap a response payload
    pub fn new(data: T) -> Self {
        Self {
            status: "success",
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiSuccess<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Login request body
#[derive(Deserialize)]
pub struct LoginRequest {
    /// Login identifier; trimmed and lowercased before lookup
    pub email: String,
    /// Plaintext password
    pub password: String,
}

/// Body carrying a refresh token
#[derive(Deserialize)]
pub struct RefreshTokenRequest {
    /// Refresh token issued at login
    pub refresh_token: String,
}

/// Logout response
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    /// Always true on success
    pub logged_out: bool,
}

/// Logout-everywhere response
#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    /// Sessions newly blocked
    pub revoked: u64,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    pub version: String,
}

/// Liveness check
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (StatusCode::OK, Json(response))
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    client: ClientMeta,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<ApiSuccess<LoginOutcome>> {
    let outcome = state.auth().login(&req.email, &req.password, &client).await?;
    Ok(ApiSuccess::new(outcome))
}

/// `POST /refresh`
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientMeta,
    JsonBody(req): JsonBody<RefreshTokenRequest>,
) -> Result<ApiSuccess<RefreshOutcome>> {
    let outcome = state.auth().refresh(&req.refresh_token, &client).await?;
    Ok(ApiSuccess::new(outcome))
}

/// `POST /logout`
pub async fn logout(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    JsonBody(req): JsonBody<RefreshTokenRequest>,
) -> Result<ApiSuccess<LogoutResponse>> {
    state.auth().logout(&caller, &req.refresh_token).await?;
    Ok(ApiSuccess::new(LogoutResponse { logged_out: true }))
}

/// `POST /logout/all`
pub async fn logout_all(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<ApiSuccess<RevokeResponse>> {
    let revoked = state.auth().logout_all(&caller).await?;
    Ok(ApiSuccess::new(RevokeResponse { revoked }))
}

/// `GET /sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
) -> Result<ApiSuccess<Vec<Session>>> {
    let sessions = state.auth().list_sessions(&caller).await?;
    Ok(ApiSuccess::new(sessions))
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Authenticated(caller): Authenticated,
    Path(id): Path<String>,
) -> Result<ApiSuccess<Session>> {
    let session_id: Uuid = id
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid session id: {}", id)))?;
    let session = state.auth().get_session(&caller, session_id).await?;
    Ok(ApiSuccess::new(session))
}
