use std::time::Duration;

use res_hypervisor::HypervisorError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Kind of a structured error, as seen by callers of `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidCommand,
    ConfigurationNotFound,
    AuthenticationFailed,
    BackendFault,
    Timeout,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid command near `{token}`\n{usage}")]
    InvalidCommand { token: String, usage: String },

    #[error("Configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Backend fault: {0}")]
    BackendFault(String),

    #[error("Timed out after {waited:?} waiting for {vm}")]
    Timeout { vm: String, waited: Duration },

    #[error("Engine configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidCommand { .. } => ErrorKind::InvalidCommand,
            EngineError::ConfigurationNotFound(_) => ErrorKind::ConfigurationNotFound,
            EngineError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::BackendFault(_)
            | EngineError::Config(_)
            | EngineError::Io(_)
            | EngineError::Hypervisor(_)
            | EngineError::Http(_) => ErrorKind::BackendFault,
        }
    }

    pub fn invalid(token: impl Into<String>, usage: impl Into<String>) -> Self {
        EngineError::InvalidCommand {
            token: token.into(),
            usage: usage.into(),
        }
    }
}

impl From<serde_yaml_ng::Error> for EngineError {
    fn from(error: serde_yaml_ng::Error) -> Self {
        EngineError::Config(error.to_string())
    }
}

/// The only error shape that leaves [`crate::Engine::execute`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<EngineError> for CommandError {
    fn from(error: EngineError) -> Self {
        let message = match &error {
            EngineError::Hypervisor(inner) => inner.user_friendly(),
            other => other.to_string(),
        };
        Self {
            kind: error.kind(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors_are_backend_faults() {
        let io = EngineError::from(std::io::Error::other("disk"));
        assert_eq!(io.kind(), ErrorKind::BackendFault);
        assert_eq!(EngineError::Config("x".into()).kind(), ErrorKind::BackendFault);
        let hv = EngineError::from(HypervisorError::CommandFailed("x".into()));
        assert_eq!(hv.kind(), ErrorKind::BackendFault);
    }

    #[test]
    fn test_command_error_keeps_kind_and_message() {
        let error = CommandError::from(EngineError::invalid("foo", "Usage: <domain> <operation>"));
        assert_eq!(error.kind, ErrorKind::InvalidCommand);
        assert!(error.message.contains("`foo`"));
        assert!(error.message.contains("Usage"));
    }
}
