//! Remote-display connections for experiment users.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ConnectionRequest, DisplayBroker, DisplaySettings, Endpoint};
use crate::config::FanOut;
use crate::error::Result;
use crate::experiment::{ExperimentStore, Instance, Selector};
use crate::fleet;
use crate::output::{CommandOutput, FleetReport, Progress};
use crate::status::{ManagerStatus, StatusTracker};
use crate::users::{UserConnections, UserPool};

pub struct ConnectionManager {
    broker: Arc<dyn DisplayBroker>,
    users: Arc<UserPool>,
    store: Arc<ExperimentStore>,
    display_host: String,
    fan_out: FanOut,
    status: StatusTracker,
}

/// Clone name to the user it is assigned to.
fn owners(connections: &UserConnections) -> HashMap<&str, (&str, &str)> {
    connections
        .users
        .iter()
        .flat_map(|user| {
            user.instances
                .iter()
                .map(move |i| (i.clone.as_str(), (user.username.as_str(), user.password.as_str())))
        })
        .collect()
}

/// Instances of `config` picked by `selector`, narrowed to one set when
/// `experiment_id` is a set number.
pub(crate) fn open_targets(instances: &[Instance], experiment_id: &str, selector: &Selector) -> Vec<Instance> {
    let set = experiment_id.trim().parse::<u32>().ok();
    selector
        .resolve(instances)
        .into_iter()
        .filter(|i| set.is_none_or(|set| i.set == set))
        .collect()
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn DisplayBroker>,
        users: Arc<UserPool>,
        store: Arc<ExperimentStore>,
        display_host: impl Into<String>,
        fan_out: FanOut,
    ) -> Self {
        Self {
            broker,
            users,
            store,
            display_host: display_host.into(),
            fan_out,
            status: StatusTracker::new("ConnectionMgr"),
        }
    }

    /// Check the endpoint address, then its credentials.
    async fn login(&self, endpoint: &Endpoint) -> Result<()> {
        endpoint.base_url()?;
        self.broker.login(endpoint).await
    }

    /// Create a broker user per credential pair and one RDP connection per
    /// selected instance with a remote display, granted to its owner.
    ///
    /// Rejected broker credentials abort the whole command.
    pub async fn create(
        &self,
        config: &str,
        endpoint: &Endpoint,
        settings: DisplaySettings,
        creds_file: Option<&Path>,
        selector: &Selector,
        progress: &Progress,
    ) -> Result<FleetReport> {
        let guard = self.status.begin(format!("create {config}"));
        if let Err(e) = self.login(endpoint).await {
            guard.fail(e.to_string());
            return Err(e);
        }
        if let Some(path) = creds_file {
            self.users.register_creds_file(config, path);
        }
        let experiment = self.store.load(config)?;
        let connections = self.users.generate_users_conns(config, None)?;
        let owners = owners(&connections);
        let targets = selector.resolve(&experiment.instances());

        let report = fleet::run("create", config, targets, self.fan_out, progress, |instance| {
            let owner = owners.get(instance.name.as_str()).copied();
            async move {
                let Some((username, password)) = owner else {
                    return Ok("no user assigned".to_string());
                };
                let Some(port) = instance.vrdp_port else {
                    return Ok("no remote display".to_string());
                };
                self.broker.create_user(endpoint, username, password).await?;
                let request = ConnectionRequest {
                    name: instance.name.clone(),
                    hostname: self.display_host.clone(),
                    port,
                    settings,
                };
                let identifier = self.broker.create_connection(endpoint, &request).await?;
                self.broker
                    .grant_connection(endpoint, username, &identifier)
                    .await?;
                Ok(format!("{username} -> rdp://{}:{port}", self.display_host))
            }
        })
        .await;
        guard.finish_counts(report.succeeded(), report.failed());
        Ok(report)
    }

    /// Delete the connections of the selected instances, then each user that
    /// owned one of them.
    pub async fn remove(
        &self,
        config: &str,
        endpoint: &Endpoint,
        creds_file: Option<&Path>,
        selector: &Selector,
        progress: &Progress,
    ) -> Result<FleetReport> {
        let guard = self.status.begin(format!("remove {config}"));
        if let Err(e) = self.login(endpoint).await {
            guard.fail(e.to_string());
            return Err(e);
        }
        let experiment = self.store.load(config)?;
        let connections = self.users.generate_users_conns(config, creds_file)?;
        let owners = owners(&connections);
        let targets = selector.resolve(&experiment.instances());

        let existing: HashMap<String, String> = self
            .broker
            .list_connections(endpoint)
            .await?
            .into_iter()
            .map(|c| (c.name, c.identifier))
            .collect();
        let affected: Vec<&str> = {
            let mut seen = HashSet::new();
            targets
                .iter()
                .filter_map(|i| owners.get(i.name.as_str()).map(|(user, _)| *user))
                .filter(|user| seen.insert(*user))
                .collect()
        };

        let report = fleet::run("remove", config, targets, self.fan_out, progress, |instance| {
            let identifier = existing.get(&instance.name).cloned();
            async move {
                match identifier {
                    Some(id) => {
                        self.broker.delete_connection(endpoint, &id).await?;
                        Ok("connection removed".to_string())
                    }
                    None => Ok("no connection".to_string()),
                }
            }
        })
        .await;

        for user in affected {
            if let Err(e) = self.broker.delete_user(endpoint, user).await {
                warn!(user, error = %e, "Failed to remove broker user");
            }
        }
        guard.finish_counts(report.succeeded(), report.failed());
        Ok(report)
    }

    /// Delete every connection and every user except the one logged in.
    pub async fn clear(&self, endpoint: &Endpoint) -> Result<CommandOutput> {
        let guard = self.status.begin("clear");
        let result = self.clear_inner(endpoint).await;
        match &result {
            Ok(_) => guard.succeed("cleared"),
            Err(e) => guard.fail(e.to_string()),
        }
        result
    }

    async fn clear_inner(&self, endpoint: &Endpoint) -> Result<CommandOutput> {
        self.login(endpoint).await?;
        let connections = self.broker.list_connections(endpoint).await?;
        for connection in &connections {
            self.broker
                .delete_connection(endpoint, &connection.identifier)
                .await?;
        }
        let users: Vec<String> = self
            .broker
            .list_users(endpoint)
            .await?
            .into_iter()
            .filter(|u| *u != endpoint.username)
            .collect();
        for user in &users {
            self.broker.delete_user(endpoint, user).await?;
        }
        info!(connections = connections.len(), users = users.len(), "Cleared broker");
        Ok(CommandOutput::message(format!(
            "Removed {} connections and {} users",
            connections.len(),
            users.len()
        )))
    }

    pub async fn refresh(&self, endpoint: &Endpoint) -> Result<CommandOutput> {
        self.login(endpoint).await?;
        let users = self.broker.list_users(endpoint).await?;
        let connections: Vec<String> = self
            .broker
            .list_connections(endpoint)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        let active = self.broker.active_connections(endpoint).await?;
        Ok(CommandOutput::Status(BTreeMap::from([
            ("users".to_string(), json!(users)),
            ("connections".to_string(), json!(connections)),
            ("active_connections".to_string(), Value::from(active)),
        ])))
    }

    /// Remote-display URLs of the selected instances, one per line.
    pub fn open(&self, config: &str, experiment_id: &str, selector: &Selector) -> Result<CommandOutput> {
        let experiment = self.store.load(config)?;
        let lines: Vec<String> = open_targets(&experiment.instances(), experiment_id, selector)
            .into_iter()
            .filter_map(|i| {
                i.vrdp_port
                    .map(|port| format!("{}: rdp://{}:{port}", i.name, self.display_host))
            })
            .collect();
        if lines.is_empty() {
            return Ok(CommandOutput::message(format!("{config}: no remote displays selected")));
        }
        Ok(CommandOutput::message(lines.join("\n")))
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.snapshot(0)
    }
}
