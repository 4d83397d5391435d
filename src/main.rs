//! Worker-process entry point.

use mindcanvas::config::AppConfig;
use mindcanvas::server::{self, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .compact()
        .init();

    let config = AppConfig::from_env()?;
    let state = AppState::from_config(config).await?;
    server::serve(state).await?;
    Ok(())
}
