use std::sync::Arc;
use std::time::Duration;

use res_engine::EngineHandle;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn EngineHandle>,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

impl AppState {
    pub fn new(engine: Arc<dyn EngineHandle>, config: &Config) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}
