//! Scoring-service accounts for experiment users.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::connections::open_targets;
use super::{Endpoint, ScoringService};
use crate::config::FanOut;
use crate::error::Result;
use crate::experiment::{ExperimentStore, Selector};
use crate::fleet;
use crate::output::{CommandOutput, FleetReport, Progress};
use crate::status::{ManagerStatus, StatusTracker};
use crate::users::{UserAssignment, UserConnections, UserPool};

pub struct ChallengesManager {
    scoring: Arc<dyn ScoringService>,
    users: Arc<UserPool>,
    store: Arc<ExperimentStore>,
    fan_out: FanOut,
    status: StatusTracker,
}

/// Users owning at least one selected instance, in set order.
fn selected_users(
    connections: &UserConnections,
    store: &ExperimentStore,
    selector: &Selector,
) -> Result<Vec<UserAssignment>> {
    let experiment = store.load(&connections.config)?;
    let selected: HashSet<String> = selector
        .resolve(&experiment.instances())
        .into_iter()
        .map(|i| i.name)
        .collect();
    Ok(connections
        .users
        .iter()
        .filter(|user| user.instances.iter().any(|i| selected.contains(&i.clone)))
        .cloned()
        .collect())
}

impl ChallengesManager {
    pub fn new(
        scoring: Arc<dyn ScoringService>,
        users: Arc<UserPool>,
        store: Arc<ExperimentStore>,
        fan_out: FanOut,
    ) -> Self {
        Self {
            scoring,
            users,
            store,
            fan_out,
            status: StatusTracker::new("ChallengesMgr"),
        }
    }

    async fn login(&self, endpoint: &Endpoint) -> Result<()> {
        endpoint.base_url()?;
        self.scoring.login(endpoint).await
    }

    /// Register one scoring account per user owning a selected instance.
    pub async fn create(
        &self,
        config: &str,
        endpoint: &Endpoint,
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
        let connections = self.users.generate_users_conns(config, None)?;
        let targets = selected_users(&connections, &self.store, selector)?;

        let report = fleet::run("create", config, targets, self.fan_out, progress, |user| async move {
            let id = self
                .scoring
                .create_user(endpoint, &user.username, &user.password)
                .await?;
            Ok(format!("registered as user {id}"))
        })
        .await;
        guard.finish_counts(report.succeeded(), report.failed());
        Ok(report)
    }

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
        let connections = self.users.generate_users_conns(config, creds_file)?;
        let targets = selected_users(&connections, &self.store, selector)?;
        let registered: HashMap<String, u64> = self
            .scoring
            .list_users(endpoint)
            .await?
            .into_iter()
            .map(|u| (u.name, u.id))
            .collect();

        let report = fleet::run("remove", config, targets, self.fan_out, progress, |user| {
            let id = registered.get(&user.username).copied();
            async move {
                match id {
                    Some(id) => {
                        self.scoring.delete_user(endpoint, id).await?;
                        Ok("removed".to_string())
                    }
                    None => Ok("not registered".to_string()),
                }
            }
        })
        .await;
        guard.finish_counts(report.succeeded(), report.failed());
        Ok(report)
    }

    /// Delete every scoring account except the admin the endpoint logs in as.
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
        let users = self.scoring.list_users(endpoint).await?;
        let mut removed = 0usize;
        for user in users.iter().filter(|u| u.name != endpoint.username) {
            self.scoring.delete_user(endpoint, user.id).await?;
            removed += 1;
        }
        info!(removed, "Cleared scoring service");
        Ok(CommandOutput::message(format!("Removed {removed} users")))
    }

    pub async fn refresh(&self, endpoint: &Endpoint) -> Result<CommandOutput> {
        self.login(endpoint).await?;
        let users: Vec<String> = self
            .scoring
            .list_users(endpoint)
            .await?
            .into_iter()
            .map(|u| u.name)
            .collect();
        Ok(CommandOutput::Status(BTreeMap::from([
            ("user_count".to_string(), json!(users.len())),
            ("users".to_string(), json!(users)),
        ])))
    }

    pub async fn getstats(&self, endpoint: &Endpoint) -> Result<CommandOutput> {
        self.login(endpoint).await?;
        let statistics = self.scoring.statistics(endpoint).await?;
        let scoreboard = self.scoring.scoreboard(endpoint).await?;
        Ok(CommandOutput::Status(BTreeMap::from([
            ("statistics".to_string(), statistics),
            ("scoreboard".to_string(), scoreboard),
        ])))
    }

    /// Each selected user with the clones they play on, one per line.
    pub fn open(&self, config: &str, experiment_id: &str, selector: &Selector) -> Result<CommandOutput> {
        let experiment = self.store.load(config)?;
        let picked: HashSet<String> = open_targets(&experiment.instances(), experiment_id, selector)
            .into_iter()
            .map(|i| i.name)
            .collect();
        let connections = self.users.generate_users_conns(config, None)?;
        let lines: Vec<String> = connections
            .users
            .iter()
            .filter_map(|user| {
                let clones: Vec<&str> = user
                    .instances
                    .iter()
                    .map(|i| i.clone.as_str())
                    .filter(|clone| picked.contains(*clone))
                    .collect();
                (!clones.is_empty()).then(|| format!("{}: {}", user.username, clones.join(", ")))
            })
            .collect();
        if lines.is_empty() {
            return Ok(CommandOutput::message(format!("{config}: no users selected")));
        }
        Ok(CommandOutput::message(lines.join("\n")))
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.snapshot(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::RecordingScoring;
    use crate::broker::ScoringUser;
    use crate::experiment::tests::MIXED;
    use crate::experiment::{ExperimentConfig, InstanceType};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<RecordingScoring>, ChallengesManager) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ExperimentStore::new(dir.path()));
        store.save(&ExperimentConfig::from_yaml(MIXED).unwrap()).unwrap();
        let users = Arc::new(UserPool::new(store.clone()));
        let scoring = Arc::new(RecordingScoring::default());
        let manager = ChallengesManager::new(scoring.clone(), users, store, FanOut::Parallel);
        (dir, scoring, manager)
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("ctfd", "admin", "token", "", "http")
    }

    #[tokio::test]
    async fn test_create_one_account_per_user() {
        let (_dir, scoring, manager) = fixture();
        let report = manager
            .create("mixed", &endpoint(), None, &Selector::all(), &Progress::none())
            .await
            .unwrap();

        let keys: Vec<&str> = report.instances.iter().map(|o| o.instance.as_str()).collect();
        assert_eq!(keys, vec!["mixed-user1", "mixed-user2", "mixed-user3"]);
        assert_eq!(scoring.users.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_selector_narrows_users() {
        let (_dir, scoring, manager) = fixture();
        let report = manager
            .create(
                "mixed",
                &endpoint(),
                None,
                &Selector::new(InstanceType::Template, "server"),
                &Progress::none(),
            )
            .await
            .unwrap();
        assert_eq!(report.instances.len(), 1);
        assert_eq!(scoring.users.lock().unwrap()[0].name, "mixed-user3");
    }

    #[tokio::test]
    async fn test_remove_and_clear_keep_admin() {
        let (_dir, scoring, manager) = fixture();
        let ep = endpoint();
        scoring.users.lock().unwrap().push(ScoringUser {
            id: 100,
            name: "admin".into(),
        });
        manager
            .create("mixed", &ep, None, &Selector::all(), &Progress::none())
            .await
            .unwrap();

        let report = manager
            .remove("mixed", &ep, None, &Selector::new(InstanceType::Set, "1"), &Progress::none())
            .await
            .unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(scoring.users.lock().unwrap().len(), 3);

        let output = manager.clear(&ep).await.unwrap();
        assert_eq!(output.to_text(), "Removed 2 users");
        assert_eq!(scoring.users.lock().unwrap()[0].name, "admin");
    }

    #[tokio::test]
    async fn test_getstats() {
        let (_dir, _scoring, manager) = fixture();
        match manager.getstats(&endpoint()).await.unwrap() {
            CommandOutput::Status(map) => {
                assert!(map.contains_key("statistics"));
                assert!(map.contains_key("scoreboard"));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_open_lists_clones_per_user() {
        let (_dir, _scoring, manager) = fixture();
        let output = manager.open("mixed", "1", &Selector::all()).unwrap();
        assert_eq!(output.to_text(), "mixed-user1: mixed-kali-1, mixed-target-1");
    }
}
