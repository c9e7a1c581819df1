//! HTTP surface
//!
//! | Route | Auth | Body |
//! |---|---|---|
//! | `POST /login` | none | `{email, password}` |
//! | `POST /refresh` | none | `{refresh_token}` |
//! | `POST /logout` | bearer | `{refresh_token}` |
//! | `POST /logout/all` | bearer | none |
//! | `GET /sessions` | bearer | none |
//! | `GET /sessions/{id}` | bearer | none |
//! | `GET /health` | none | none |

pub mod extract;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use extract::{Authenticated, JsonBody};
pub use handlers::ApiSuccess;

/// Build the auth router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/login", post(handlers::login))
        .route("/refresh", post(handlers::refresh))
        .route("/logout", post(handlers::logout))
        .route("/logout/all", post(handlers::logout_all))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .with_state(state)
}
