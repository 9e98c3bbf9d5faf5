//! CTFd REST v1 client. The endpoint password carries an admin API token.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{check_response, Endpoint, ScoringService, ScoringUser};
use crate::error::{EngineError, Result};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    errors: Option<Value>,
}

impl<T> Envelope<T> {
    fn into_data(self, what: &str) -> Result<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            _ => Err(EngineError::BackendFault(format!(
                "{what}: {}",
                self.errors.map(|e| e.to_string()).unwrap_or_else(|| "no data".into())
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: u64,
    name: String,
}

#[derive(Debug, Default)]
pub struct CtfdClient {
    http: Client,
}

impl CtfdClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn headers(endpoint: &Endpoint) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Token {}", endpoint.password))
            .map_err(|_| EngineError::AuthenticationFailed("API token is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn get(&self, endpoint: &Endpoint, suffix: &str) -> Result<RequestBuilder> {
        Ok(self.http.get(endpoint.url(suffix)?).headers(Self::headers(endpoint)?))
    }

    async fn data<T: for<'de> Deserialize<'de>>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = check_response(request.send().await?, what).await?;
        let envelope: Envelope<T> = response.json().await?;
        envelope.into_data(what)
    }
}

#[async_trait]
impl ScoringService for CtfdClient {
    async fn login(&self, endpoint: &Endpoint) -> Result<()> {
        debug!(host = %endpoint.host, "Checking CTFd API token");
        self.list_users(endpoint).await.map(|_| ())
    }

    async fn list_users(&self, endpoint: &Endpoint) -> Result<Vec<ScoringUser>> {
        let users: Vec<UserEntry> = self
            .data(self.get(endpoint, "/api/v1/users?view=admin")?, "CTFd list users")
            .await?;
        Ok(users
            .into_iter()
            .map(|u| ScoringUser { id: u.id, name: u.name })
            .collect())
    }

    async fn create_user(&self, endpoint: &Endpoint, name: &str, password: &str) -> Result<u64> {
        let body = json!({
            "name": name,
            "email": format!("{name}@res.local"),
            "password": password,
        });
        let request = self
            .http
            .post(endpoint.url("/api/v1/users")?)
            .headers(Self::headers(endpoint)?)
            .json(&body);
        match self.data::<UserEntry>(request, "CTFd create user").await {
            Ok(user) => {
                info!(user = %name, id = user.id, "Created scoring user");
                Ok(user.id)
            }
            // Name already taken: reuse the existing account.
            Err(EngineError::BackendFault(message)) if message.contains("already been taken") => {
                self.list_users(endpoint)
                    .await?
                    .into_iter()
                    .find(|u| u.name == name)
                    .map(|u| u.id)
                    .ok_or(EngineError::BackendFault(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_user(&self, endpoint: &Endpoint, id: u64) -> Result<()> {
        let request = self
            .http
            .delete(endpoint.url(&format!("/api/v1/users/{id}"))?)
            .headers(Self::headers(endpoint)?);
        check_response(request.send().await?, "CTFd delete user").await?;
        Ok(())
    }

    async fn statistics(&self, endpoint: &Endpoint) -> Result<Value> {
        self.data(self.get(endpoint, "/api/v1/statistics/users")?, "CTFd statistics")
            .await
    }

    async fn scoreboard(&self, endpoint: &Endpoint) -> Result<Value> {
        self.data(self.get(endpoint, "/api/v1/scoreboard")?, "CTFd scoreboard")
            .await
    }
}
