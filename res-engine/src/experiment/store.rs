use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::ExperimentConfig;
use crate::error::{EngineError, Result};

pub const CONFIG_FILE: &str = "experiment.yaml";

/// Directory-backed experiment configurations, one folder per experiment.
#[derive(Debug, Clone)]
pub struct ExperimentStore {
    root: PathBuf,
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl ExperimentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(CONFIG_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        is_plain_name(name) && self.config_path(name).is_file()
    }

    /// Load the named configuration. Unknown names are `ConfigurationNotFound`.
    pub fn load(&self, name: &str) -> Result<ExperimentConfig> {
        let name = name.trim();
        if !self.exists(name) {
            return Err(EngineError::ConfigurationNotFound(name.to_string()));
        }
        let path = self.config_path(name);
        debug!(path = %path.display(), "Loading experiment config");
        let content = fs::read_to_string(&path)?;
        let config = ExperimentConfig::from_yaml(&content)?;
        if config.name != name {
            return Err(EngineError::Config(format!(
                "{} declares name {:?}, expected {:?}",
                path.display(),
                config.name,
                name
            )));
        }
        Ok(config)
    }

    pub fn save(&self, config: &ExperimentConfig) -> Result<PathBuf> {
        config.validate()?;
        let path = self.config_path(&config.name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, config.to_yaml()?)?;
        info!(experiment = %config.name, path = %path.display(), "Stored experiment config");
        Ok(path)
    }

    /// Names of every stored experiment, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(CONFIG_FILE).is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
