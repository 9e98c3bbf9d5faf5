//! Engine configuration.
//!
//! Loaded from the YAML file named by `RES_ENGINE_CONFIG` when set. Keys the
//! file leaves out fall back to `RES_*` environment variables, then to
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use res_hypervisor::{HypervisorKind, HypervisorSettings};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::completion::PollPolicy;
use crate::error::{EngineError, Result};

/// How a lifecycle command walks its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOut {
    /// One instance at a time, in declared order.
    #[default]
    Sequential,
    /// All instances concurrently; results still reported in declared order.
    Parallel,
}

impl FromStr for FanOut {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(FanOut::Sequential),
            "parallel" => Ok(FanOut::Parallel),
            other => Err(EngineError::Config(format!("unknown fan-out mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_hypervisor")]
    pub hypervisor: HypervisorSettings,

    /// Holds one `<name>/experiment.yaml` per experiment.
    #[serde(default = "default_experiments_dir")]
    pub experiments_dir: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Unset means poll until the backend reports idle, however long that takes.
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: Option<u64>,

    #[serde(default = "default_fan_out")]
    pub fan_out: FanOut,

    /// Address remote-display connections point at (the hypervisor host as
    /// seen from the display broker).
    #[serde(default = "default_display_host")]
    pub display_host: String,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn default_hypervisor() -> HypervisorSettings {
    HypervisorSettings {
        active: env_parse::<HypervisorKind>("RES_HYPERVISOR").unwrap_or_default(),
        ..Default::default()
    }
}

fn default_experiments_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RES_EXPERIMENTS_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|dir| dir.join("res").join("experiments"))
        .unwrap_or_else(|| PathBuf::from("experiments"))
}

fn default_poll_interval_ms() -> u64 {
    env_parse("RES_POLL_INTERVAL_MS").unwrap_or(100)
}

fn default_poll_deadline_secs() -> Option<u64> {
    env_parse("RES_POLL_DEADLINE_SECS")
}

fn default_fan_out() -> FanOut {
    env_parse("RES_FAN_OUT").unwrap_or_default()
}

fn default_display_host() -> String {
    std::env::var("RES_DISPLAY_HOST").unwrap_or_else(|_| "localhost".to_string())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hypervisor: default_hypervisor(),
            experiments_dir: default_experiments_dir(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_deadline_secs: default_poll_deadline_secs(),
            fan_out: default_fan_out(),
            display_host: default_display_host(),
        }
    }
}

impl EngineConfig {
    /// Load from `RES_ENGINE_CONFIG` if set, otherwise from the environment alone.
    pub fn load() -> Result<Self> {
        match std::env::var("RES_ENGINE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading engine config");
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(content)?;
        if config.poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            deadline: self.poll_deadline_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_full() {
        let config = EngineConfig::from_yaml(
            r#"
hypervisor:
  active: vmware
  vm_directory: /srv/vms
experiments_dir: /srv/res/experiments
poll_interval_ms: 250
poll_deadline_secs: 600
fan_out: parallel
display_host: 10.0.0.5
"#,
        )
        .unwrap();

        assert_eq!(config.hypervisor.active, HypervisorKind::Vmware);
        assert_eq!(config.experiments_dir, PathBuf::from("/srv/res/experiments"));
        assert_eq!(config.fan_out, FanOut::Parallel);
        assert_eq!(config.display_host, "10.0.0.5");

        let policy = config.poll_policy();
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.deadline, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let error = EngineConfig::from_yaml("poll_interval_ms: 0\n").unwrap_err();
        assert!(matches!(error, EngineError::Config(_)));
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        let error = EngineConfig::from_yaml("fan_out: sideways\n").unwrap_err();
        assert!(matches!(error, EngineError::Config(_)));
    }

    #[test]
    fn test_fan_out_parsing() {
        assert_eq!("Parallel".parse::<FanOut>().unwrap(), FanOut::Parallel);
        assert!("zigzag".parse::<FanOut>().is_err());
    }
}
