//! # space-auth
//!
//! Authentication and session security for multi-tenant community spaces.
//!
//! ## Features
//!
//! - **Tokens**: PASETO v4.local access and refresh tokens under a shared key
//! - **Sessions**: server-side rows behind every refresh token, with logout,
//!   logout-everywhere and optional refresh-token rotation
//! - **Brute-force defense**: windowed attempt counting per username and per
//!   address, plus account lockout on consecutive failures
//! - **Administration**: audited suspend, unlock, password reset and revoke
//! - **Storage**: PostgreSQL (`database` feature) or in-process memory
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use space_auth::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let stores = Stores::from_backend(Arc::new(MemoryStore::new()));
//!     let state = AppState::new(config.clone(), stores, Arc::new(SystemClock))?;
//!
//!     Server::new(config)
//!         .serve(router(state), CancellationToken::new())
//!         .await
//! }
//! ```

pub mod admin;
pub mod attempts;
pub mod audit;
pub mod clock;
pub mod config;
#[cfg(feature = "database")]
pub mod database;
pub mod error;
pub mod http;
pub mod lockout;
pub mod maintenance;
pub mod observability;
pub mod password;
pub mod server;
pub mod service;
pub mod session;
pub mod state;
pub mod store;
pub mod token;
pub mod user;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::admin::AccountAdmin;
    pub use crate::attempts::{AttemptConfig, AttemptKey, LoginAttempt, LoginAttemptTracker};
    pub use crate::audit::{AuditAction, AuditEntry, AuditLogger};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{Config, DatabaseConfig, ServiceConfig, TokenConfig};
    pub use crate::error::{Error, Result, StorageError, StorageErrorKind, StorageOperation};
    pub use crate::http::{router, ApiSuccess, Authenticated};
    pub use crate::lockout::{
        AccountLockManager, AuditLockoutNotification, LockoutConfig, LockoutEvent,
        LockoutNotification, LockoutStatus, UnlockReason,
    };
    pub use crate::maintenance::{Maintenance, MaintenanceConfig, MaintenanceReport};
    pub use crate::observability::init_tracing;
    pub use crate::password::{PasswordConfig, PasswordHasher};
    pub use crate::server::Server;
    pub use crate::service::{AuthService, ClientMeta, LoginOutcome, RefreshOutcome};
    pub use crate::session::{NewSession, Session, SessionRejection};
    pub use crate::state::AppState;
    pub use crate::store::{
        AuditStorage, LoginAttemptStorage, MemoryStore, SessionStorage, Stores, UserStorage,
    };
    pub use crate::token::{PasetoMaker, TokenKind, TokenMaker, TokenPayload};
    pub use crate::user::{AccountLockState, LockState, LockedUser, User, UserSummary};

    #[cfg(feature = "database")]
    pub use crate::database::create_pool;
    #[cfg(feature = "database")]
    pub use crate::store::PgStore;

    // Re-export commonly used external types
    pub use tokio_util::sync::CancellationToken;
}
