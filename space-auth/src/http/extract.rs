//! Request extractors
//!
//! Rejections are [`Error`] values so every failure renders through the
//! same JSON error body.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRef, FromRequest, FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::service::ClientMeta;
use crate::state::AppState;
use crate::token::TokenPayload;

/// Extract token from Authorization header (Bearer scheme)
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, Error> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("Missing Authorization header".to_string()))?;

    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Unauthorized("Invalid Authorization header format".to_string()))
}

/// Client address, from proxy headers only when `trust_forwarded` is set
///
/// Trusted order: first `X-Forwarded-For` entry, `X-Real-IP`, the
/// connection's peer address, then `0.0.0.0`. Untrusted requests use the
/// peer address alone. Unparseable header values are skipped.
pub fn client_ip(parts: &Parts, trust_forwarded: bool) -> IpAddr {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if !trust_forwarded {
        return peer.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    let forwarded: Option<IpAddr> = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    let real_ip = || {
        parts
            .headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    forwarded
        .or_else(real_ip)
        .or(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

impl<S> FromRequestParts<S> for ClientMeta
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let trust_forwarded = AppState::from_ref(state)
            .config()
            .service
            .trust_forwarded_headers;
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(ClientMeta {
            ip_address: client_ip(parts, trust_forwarded),
            user_agent,
        })
    }
}

/// Payload of a verified bearer access token
#[derive(Debug, Clone)]
pub struct Authenticated(pub TokenPayload);

impl<S> FromRequestParts<S> for Authenticated
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer(&parts.headers)?;
        let app = AppState::from_ref(state);
        let payload = app.auth().authenticate(token)?;
        Ok(Authenticated(payload))
    }
}

/// JSON body whose rejections are reported as `VALIDATION_ERROR`
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| Error::ValidationError(rejection.body_text()))?;
        Ok(JsonBody(value))
    }
}
