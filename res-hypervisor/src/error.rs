//! Error types for hypervisor backend operations.
//!
//! These cover the ways a backend can refuse to issue a write or fail to read
//! VM information. Faults that happen *after* a write was issued are reported
//! through [`crate::Hypervisor::take_fault`] instead, since the write runs in
//! the background.

use thiserror::Error;

/// Errors that can occur while talking to a hypervisor backend.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Unknown hypervisor backend: {0}")]
    UnknownBackend(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Dependency not found: {0}")]
    Dependency(String),

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypervisorError {
    /// Convert the error into a short message with a hint where one helps.
    pub fn user_friendly(&self) -> String {
        match self {
            Self::Dependency(tool) => {
                format!("{tool} is not installed or not on PATH\n💡 Install it or set hypervisor.executable in the engine config")
            }
            Self::CommandFailed(msg) if msg.contains("VBOX_E_INVALID_OBJECT_STATE") => {
                format!("{msg}\n💡 The VM is in a state that does not allow this operation; run a refresh first")
            }
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HypervisorError>;
