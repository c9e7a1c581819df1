//! space-auth service binary
//!
//! Loads configuration, connects to PostgreSQL, initializes the schema,
//! starts the maintenance loop and serves the HTTP API until shutdown.

use std::sync::Arc;

use space_auth::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("SPACE_AUTH_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load_from(&config_path)?;
    init_tracing(&config)?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| {
            Error::Config(Box::new(figment::Error::from(
                "database.url must be configured".to_string(),
            )))
        })?;
    let pool = create_pool(database).await?;

    let store = Arc::new(PgStore::new(pool));
    store.initialize().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(config.clone(), Stores::from_backend(store), clock)?;

    let shutdown = CancellationToken::new();
    let maintenance = if config.maintenance.enabled {
        let runner = Maintenance::new(
            state.auth().locks().clone(),
            state.auth().tracker().clone(),
        );
        Some(runner.spawn(config.maintenance.interval(), shutdown.clone()))
    } else {
        tracing::info!("Maintenance task disabled");
        None
    };

    let result = Server::new(config)
        .serve(router(state), shutdown.clone())
        .await;

    shutdown.cancel();
    if let Some(handle) = maintenance {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Maintenance task ended abnormally");
        }
    }

    result
}
