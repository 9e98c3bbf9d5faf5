//! Apache Guacamole REST client.
//!
//! Logs in through `POST /api/tokens` and keeps one token per endpoint. A
//! token the server stops accepting is dropped and fetched again once.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{check_response, BrokerConnection, ConnectionRequest, DisplayBroker, Endpoint};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    auth_token: String,
    data_source: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    data_source: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionEntry {
    identifier: String,
    name: String,
}

#[derive(Debug, Default)]
pub struct GuacamoleClient {
    http: Client,
    sessions: Mutex<HashMap<String, Session>>,
}

impl GuacamoleClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, endpoint: &Endpoint) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint.key())
            .cloned()
    }

    fn forget(&self, endpoint: &Endpoint) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint.key());
    }

    async fn authenticate(&self, endpoint: &Endpoint) -> Result<Session> {
        let url = endpoint.url("/api/tokens")?;
        debug!(url = %url, user = %endpoint.username, "Requesting Guacamole token");
        let response = self
            .http
            .post(url)
            .form(&[
                ("username", endpoint.username.as_str()),
                ("password", endpoint.password.as_str()),
            ])
            .send()
            .await?;
        let response = check_response(response, "Guacamole login").await?;
        let token: TokenResponse = response.json().await?;
        let session = Session {
            token: token.auth_token,
            data_source: token.data_source,
        };
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.key(), session.clone());
        Ok(session)
    }

    async fn session(&self, endpoint: &Endpoint) -> Result<Session> {
        match self.cached(endpoint) {
            Some(session) => Ok(session),
            None => self.authenticate(endpoint).await,
        }
    }

    /// Send one data-source request, re-authenticating once on a rejected token.
    async fn call(
        &self,
        endpoint: &Endpoint,
        method: Method,
        resource: &[&str],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let label = resource.join("/");
        let mut retried = false;
        loop {
            let session = self.session(endpoint).await?;
            let mut url = endpoint.url("/api/session/data")?;
            let url_text = url.to_string();
            // Each segment is percent-encoded, so names cannot escape their slot.
            url.path_segments_mut()
                .map_err(|_| EngineError::BackendFault(format!("Guacamole URL has no path: {url_text}")))?
                .push(&session.data_source)
                .extend(resource);
            let mut request = self
                .http
                .request(method.clone(), url)
                .query(&[("token", session.token.as_str())]);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            if (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN) && !retried {
                debug!(resource = %label, "Guacamole token rejected, logging in again");
                self.forget(endpoint);
                retried = true;
                continue;
            }
            return check_response(response, &format!("Guacamole {method} {label}")).await;
        }
    }
}

#[async_trait]
impl DisplayBroker for GuacamoleClient {
    async fn login(&self, endpoint: &Endpoint) -> Result<()> {
        self.forget(endpoint);
        self.authenticate(endpoint).await.map(|_| ())
    }

    async fn create_user(&self, endpoint: &Endpoint, username: &str, password: &str) -> Result<()> {
        let body = json!({ "username": username, "password": password, "attributes": {} });
        match self.call(endpoint, Method::POST, &["users"], Some(&body)).await {
            Ok(_) => {
                info!(user = %username, "Created broker user");
                Ok(())
            }
            // Guacamole answers 400 for a user that already exists.
            Err(EngineError::BackendFault(message)) if message.contains("already exists") => {
                debug!(user = %username, "Broker user already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_user(&self, endpoint: &Endpoint, username: &str) -> Result<()> {
        self.call(endpoint, Method::DELETE, &["users", username], None)
            .await
            .map(|_| ())
    }

    async fn list_users(&self, endpoint: &Endpoint) -> Result<Vec<String>> {
        let users: HashMap<String, Value> = self
            .call(endpoint, Method::GET, &["users"], None)
            .await?
            .json()
            .await?;
        let mut names: Vec<String> = users.into_keys().collect();
        names.sort();
        Ok(names)
    }

    async fn create_connection(&self, endpoint: &Endpoint, request: &ConnectionRequest) -> Result<String> {
        let settings = &request.settings;
        let body = json!({
            "parentIdentifier": "ROOT",
            "name": request.name,
            "protocol": "rdp",
            "parameters": {
                "hostname": request.hostname,
                "port": request.port.to_string(),
                "width": settings.width.to_string(),
                "height": settings.height.to_string(),
                "color-depth": settings.bitdepth.to_string(),
            },
            "attributes": {
                "max-connections": settings.max_connections.to_string(),
                "max-connections-per-user": settings.max_connections_per_user.to_string(),
            },
        });
        let created: ConnectionEntry = self
            .call(endpoint, Method::POST, &["connections"], Some(&body))
            .await?
            .json()
            .await?;
        info!(connection = %created.name, id = %created.identifier, "Created broker connection");
        Ok(created.identifier)
    }

    async fn delete_connection(&self, endpoint: &Endpoint, identifier: &str) -> Result<()> {
        self.call(endpoint, Method::DELETE, &["connections", identifier], None)
            .await
            .map(|_| ())
    }

    async fn list_connections(&self, endpoint: &Endpoint) -> Result<Vec<BrokerConnection>> {
        let connections: HashMap<String, ConnectionEntry> = self
            .call(endpoint, Method::GET, &["connections"], None)
            .await?
            .json()
            .await?;
        let mut list: Vec<BrokerConnection> = connections
            .into_values()
            .map(|c| BrokerConnection {
                identifier: c.identifier,
                name: c.name,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn grant_connection(&self, endpoint: &Endpoint, username: &str, identifier: &str) -> Result<()> {
        let patch = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{identifier}"),
            "value": "READ",
        }]);
        self.call(
            endpoint,
            Method::PATCH,
            &["users", username, "permissions"],
            Some(&patch),
        )
        .await
        .map(|_| ())
    }

    async fn active_connections(&self, endpoint: &Endpoint) -> Result<usize> {
        let active: HashMap<String, Value> = self
            .call(endpoint, Method::GET, &["activeConnections"], None)
            .await?
            .json()
            .await?;
        Ok(active.len())
    }
}
