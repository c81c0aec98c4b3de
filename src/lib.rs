pub mod config;
pub mod core_state;
pub mod db;
pub mod intake;
pub mod models;
pub mod pipeline;
pub mod review;
pub mod storage;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, Settings};
use crate::core_state::{CoreError, CoreState};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup failed: {0}")]
    Core(#[from] CoreError),

    #[error("Signal handler error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Start the worker process and block until ctrl-c.
pub async fn run() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} starting v{}", config::APP_NAME, config::APP_VERSION);

    let settings = Settings::from_env()?;
    let state = Arc::new(CoreState::from_settings(&settings)?);
    let pool = state.start_workers();

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown requested, draining workers");
    pool.shutdown().await;
    signal?;
    Ok(())
}
