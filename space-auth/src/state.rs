//! Application state management

use std::sync::Arc;

use crate::admin::AccountAdmin;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::service::AuthService;
use crate::store::Stores;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    auth: AuthService,
}

impl AppState {
    /// Build the auth components from configuration over `stores`
    pub fn new(config: Config, stores: Stores, clock: Arc<dyn Clock>) -> Result<Self> {
        let auth = AuthService::new(&config, stores, clock)?;
        Ok(Self::from_parts(config, auth))
    }

    /// Wrap an already built service
    pub fn from_parts(config: Config, auth: AuthService) -> Self {
        Self {
            config: Arc::new(config),
            auth,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Session flows
    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    /// Administrative operations over the same components
    pub fn admin(&self) -> AccountAdmin {
        AccountAdmin::new(&self.auth)
    }
}
