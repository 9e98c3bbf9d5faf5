//! Instance selector resolution.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Instance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// A set number
    Set,
    /// A template name; selects every clone of it
    Template,
    /// A clone name
    #[default]
    Vm,
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceType::Set => "set",
            InstanceType::Template => "template",
            InstanceType::Vm => "vm",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub itype: InstanceType,
    pub name: String,
}

impl Default for Selector {
    fn default() -> Self {
        Self::all()
    }
}

impl Selector {
    pub fn new(itype: InstanceType, name: impl Into<String>) -> Self {
        // Callers sometimes forward names with their quotes still attached.
        let name: String = name.into();
        Self {
            itype,
            name: name.replace(['"', '\''], ""),
        }
    }

    pub fn all() -> Self {
        Self::new(InstanceType::Vm, "all")
    }

    pub fn vm(name: impl Into<String>) -> Self {
        Self::new(InstanceType::Vm, name)
    }

    pub fn is_all(&self) -> bool {
        self.name == "all"
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        if self.is_all() {
            return true;
        }
        match self.itype {
            InstanceType::Set => self
                .name
                .trim()
                .parse::<u32>()
                .is_ok_and(|set| instance.set == set),
            InstanceType::Template => instance.template == self.name,
            InstanceType::Vm => instance.name == self.name,
        }
    }

    /// Select from `instances`, keeping their order. Unknown names select nothing.
    pub fn resolve(&self, instances: &[Instance]) -> Vec<Instance> {
        let selected: Vec<Instance> = instances
            .iter()
            .filter(|instance| self.matches(instance))
            .cloned()
            .collect();
        debug!(
            itype = %self.itype,
            name = %self.name,
            selected = selected.len(),
            declared = instances.len(),
            "Resolved selector"
        );
        selected
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.itype, self.name)
    }
}
