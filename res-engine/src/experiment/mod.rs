//! Experiment configurations and the instances they declare.

pub mod manager;
pub mod selector;
pub mod store;

use std::collections::HashSet;

use res_hypervisor::GuestCommand;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub use manager::{ExperimentManager, LifecycleVerb};
pub use selector::{InstanceType, Selector};
pub use store::ExperimentStore;

fn default_clones() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_vrdp_base_port() -> u16 {
    5000
}

/// One experiment, as stored in `<experiments_dir>/<name>/experiment.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub linked_clones: bool,
    #[serde(default = "default_true")]
    pub snapshot_on_create: bool,
    #[serde(default = "default_vrdp_base_port")]
    pub vrdp_base_port: u16,
    pub groups: Vec<InstanceGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    /// Number of sets this group contributes.
    #[serde(default = "default_clones")]
    pub clones: u32,
    pub templates: Vec<VmTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,
    #[serde(default)]
    pub vrdp_enabled: bool,
    #[serde(default)]
    pub internal_networks: Vec<String>,
    /// Snapshot linked clones are taken from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub startup_commands: Vec<GuestCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stored_commands: Vec<GuestCommand>,
}

/// One clone of a template, with everything derived from its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// `{experiment}-{template}-{set}`
    pub name: String,
    pub template: String,
    pub set: u32,
    /// Position in declared order, starting at 0.
    pub index: usize,
    pub vrdp_port: Option<u16>,
    /// Template networks, suffixed with the set number.
    pub internal_networks: Vec<String>,
}

pub fn clone_name(experiment: &str, template: &str, set: u32) -> String {
    format!("{experiment}-{template}-{set}")
}

impl ExperimentConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(EngineError::Config(format!(
                "invalid experiment name: {:?}",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for template in self.groups.iter().flat_map(|g| &g.templates) {
            if !seen.insert(template.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "template {} declared more than once in {}",
                    template.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Total number of sets across all groups.
    pub fn set_count(&self) -> u32 {
        self.groups.iter().map(|g| g.clones).sum()
    }

    pub fn template(&self, name: &str) -> Option<&VmTemplate> {
        self.groups
            .iter()
            .flat_map(|g| &g.templates)
            .find(|t| t.name == name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &VmTemplate> {
        self.groups.iter().flat_map(|g| &g.templates)
    }

    /// Every instance in declared order: group, then set, then template.
    pub fn instances(&self) -> Vec<Instance> {
        let mut instances = Vec::new();
        let mut set = 0u32;
        for group in &self.groups {
            for _ in 0..group.clones {
                set += 1;
                for template in &group.templates {
                    let index = instances.len();
                    let vrdp_port = if template.vrdp_enabled {
                        u16::try_from(index)
                            .ok()
                            .and_then(|offset| self.vrdp_base_port.checked_add(offset))
                    } else {
                        None
                    };
                    instances.push(Instance {
                        name: clone_name(&self.name, &template.name, set),
                        template: template.name.clone(),
                        set,
                        index,
                        vrdp_port,
                        internal_networks: template
                            .internal_networks
                            .iter()
                            .map(|net| format!("{net}-{set}"))
                            .collect(),
                    });
                }
            }
        }
        instances
    }
}
