use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Delay between `mgrstatus` queries while waiting for the hypervisor.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting for an idle hypervisor after this long.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    std::env::var("RES_API_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string())
}

fn default_poll_interval_ms() -> u64 {
    std::env::var("RES_API_POLL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(100)
}

fn default_idle_timeout_secs() -> u64 {
    std::env::var("RES_API_IDLE_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600) // 10 minutes
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            poll_interval_ms: default_poll_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
