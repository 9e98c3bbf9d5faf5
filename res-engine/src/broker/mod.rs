//! Remote-display broker and scoring service integration.
//!
//! The wire protocols live behind [`DisplayBroker`] and [`ScoringService`];
//! the managers in [`connections`] and [`challenges`] only speak those traits.

pub mod challenges;
pub mod connections;
pub mod ctfd;
pub mod guacamole;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::error::{EngineError, Result};

pub use challenges::ChallengesManager;
pub use connections::ConnectionManager;

/// Where a broker or scoring service lives and how to log in to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Path prefix, e.g. `/guacamole`. Empty for services at the root.
    pub path: String,
    /// `http` or `https`.
    pub method: String,
}

impl Endpoint {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            path: path.into(),
            method: method.into(),
        }
    }

    /// `{method}://{host}{path}` with no trailing slash.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = self.method.trim().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(EngineError::invalid(
                self.method.clone(),
                "method must be http or https",
            ));
        }
        let path = self.path.trim().trim_end_matches('/');
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let raw = format!("{scheme}://{}{path}", self.host.trim());
        Url::parse(&raw).map_err(|e| EngineError::invalid(raw.clone(), format!("bad service address: {e}")))
    }

    /// Base URL joined with `suffix` (which must start with `/`).
    pub fn url(&self, suffix: &str) -> Result<Url> {
        let base = self.base_url()?;
        let raw = format!("{}{suffix}", base.as_str().trim_end_matches('/'));
        Url::parse(&raw).map_err(|e| EngineError::BackendFault(format!("bad URL {raw}: {e}")))
    }

    /// Cache key for per-endpoint sessions.
    pub fn key(&self) -> String {
        format!("{}://{}{}#{}", self.method, self.host, self.path, self.username)
    }
}

/// Remote-display sizing and limits for created connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplaySettings {
    pub max_connections: u32,
    pub max_connections_per_user: u32,
    pub width: u32,
    pub height: u32,
    pub bitdepth: u32,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_connections_per_user: 1,
            width: 1400,
            height: 1050,
            bitdepth: 16,
        }
    }
}

/// An RDP connection to create on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Connection name; the clone name.
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub settings: DisplaySettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerConnection {
    pub identifier: String,
    pub name: String,
}

/// Remote-display session broker (Apache Guacamole in production).
#[async_trait]
pub trait DisplayBroker: Send + Sync {
    /// Check the endpoint credentials. Rejected credentials are `AuthenticationFailed`.
    async fn login(&self, endpoint: &Endpoint) -> Result<()>;

    /// Create a user; an existing user with the same name is left as is.
    async fn create_user(&self, endpoint: &Endpoint, username: &str, password: &str) -> Result<()>;

    async fn delete_user(&self, endpoint: &Endpoint, username: &str) -> Result<()>;

    async fn list_users(&self, endpoint: &Endpoint) -> Result<Vec<String>>;

    /// Create a connection and return its identifier.
    async fn create_connection(&self, endpoint: &Endpoint, request: &ConnectionRequest) -> Result<String>;

    async fn delete_connection(&self, endpoint: &Endpoint, identifier: &str) -> Result<()>;

    async fn list_connections(&self, endpoint: &Endpoint) -> Result<Vec<BrokerConnection>>;

    /// Give `username` read access to a connection.
    async fn grant_connection(&self, endpoint: &Endpoint, username: &str, identifier: &str) -> Result<()>;

    async fn active_connections(&self, endpoint: &Endpoint) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoringUser {
    pub id: u64,
    pub name: String,
}

/// Challenge scoring service (CTFd in production).
#[async_trait]
pub trait ScoringService: Send + Sync {
    async fn login(&self, endpoint: &Endpoint) -> Result<()>;

    async fn list_users(&self, endpoint: &Endpoint) -> Result<Vec<ScoringUser>>;

    /// Create a user and return its id.
    async fn create_user(&self, endpoint: &Endpoint, name: &str, password: &str) -> Result<u64>;

    async fn delete_user(&self, endpoint: &Endpoint, id: u64) -> Result<()>;

    async fn statistics(&self, endpoint: &Endpoint) -> Result<Value>;

    async fn scoreboard(&self, endpoint: &Endpoint) -> Result<Value>;
}

/// Map an HTTP response status onto the engine's error kinds.
pub(crate) async fn check_response(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(EngineError::AuthenticationFailed(
            format!("{what}: {status}"),
        )),
        _ => Err(EngineError::BackendFault(format!(
            "{what}: {status} {}",
            body.trim()
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording substitutes for the broker traits.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct RecordingBroker {
        pub reject_login: bool,
        pub users: Mutex<BTreeMap<String, String>>,
        pub connections: Mutex<Vec<(BrokerConnection, ConnectionRequest)>>,
        pub grants: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DisplayBroker for RecordingBroker {
        async fn login(&self, endpoint: &Endpoint) -> Result<()> {
            if self.reject_login {
                return Err(EngineError::AuthenticationFailed(endpoint.username.clone()));
            }
            Ok(())
        }

        async fn create_user(&self, _: &Endpoint, username: &str, password: &str) -> Result<()> {
            self.users
                .lock()
                .unwrap()
                .entry(username.to_string())
                .or_insert_with(|| password.to_string());
            Ok(())
        }

        async fn delete_user(&self, _: &Endpoint, username: &str) -> Result<()> {
            self.users.lock().unwrap().remove(username);
            Ok(())
        }

        async fn list_users(&self, _: &Endpoint) -> Result<Vec<String>> {
            Ok(self.users.lock().unwrap().keys().cloned().collect())
        }

        async fn create_connection(&self, _: &Endpoint, request: &ConnectionRequest) -> Result<String> {
            let mut connections = self.connections.lock().unwrap();
            let identifier = (connections.len() + 1).to_string();
            connections.push((
                BrokerConnection {
                    identifier: identifier.clone(),
                    name: request.name.clone(),
                },
                request.clone(),
            ));
            Ok(identifier)
        }

        async fn delete_connection(&self, _: &Endpoint, identifier: &str) -> Result<()> {
            self.connections
                .lock()
                .unwrap()
                .retain(|(c, _)| c.identifier != identifier);
            Ok(())
        }

        async fn list_connections(&self, _: &Endpoint) -> Result<Vec<BrokerConnection>> {
            Ok(self
                .connections
                .lock()
                .unwrap()
                .iter()
                .map(|(c, _)| c.clone())
                .collect())
        }

        async fn grant_connection(&self, _: &Endpoint, username: &str, identifier: &str) -> Result<()> {
            self.grants
                .lock()
                .unwrap()
                .push((username.to_string(), identifier.to_string()));
            Ok(())
        }

        async fn active_connections(&self, _: &Endpoint) -> Result<usize> {
            Ok(0)
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingScoring {
        pub users: Mutex<Vec<ScoringUser>>,
    }

    #[async_trait]
    impl ScoringService for RecordingScoring {
        async fn login(&self, _: &Endpoint) -> Result<()> {
            Ok(())
        }

        async fn list_users(&self, _: &Endpoint) -> Result<Vec<ScoringUser>> {
            Ok(self.users.lock().unwrap().clone())
        }

        async fn create_user(&self, _: &Endpoint, name: &str, _password: &str) -> Result<u64> {
            let mut users = self.users.lock().unwrap();
            let id = users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
            users.push(ScoringUser {
                id,
                name: name.to_string(),
            });
            Ok(id)
        }

        async fn delete_user(&self, _: &Endpoint, id: u64) -> Result<()> {
            self.users.lock().unwrap().retain(|u| u.id != id);
            Ok(())
        }

        async fn statistics(&self, _: &Endpoint) -> Result<Value> {
            Ok(serde_json::json!({"registered": self.users.lock().unwrap().len()}))
        }

        async fn scoreboard(&self, _: &Endpoint) -> Result<Value> {
            Ok(serde_json::json!([]))
        }
    }
}
