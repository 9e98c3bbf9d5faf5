use std::sync::Arc;

use anyhow::Result;
use res_api::{create_app, AppState, Config};
use res_engine::{Engine, EngineConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = res_logging::init_subscriber();

    info!("Starting res-api service...");

    let config = Config::from_env();
    info!(
        "Configuration loaded: bind_addr={}, poll_interval_ms={}",
        config.bind_addr, config.poll_interval_ms
    );

    let engine_config = EngineConfig::load()?;
    let engine = Engine::builder().config(engine_config).build()?;
    let state = AppState::new(Arc::new(engine), &config);

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
