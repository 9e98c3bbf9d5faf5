//! Shared fixtures for res-engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use res_engine::broker::{BrokerConnection, ConnectionRequest, DisplayBroker, Endpoint};
use res_engine::{Engine, EngineConfig, ExperimentConfig, FanOut};
use res_hypervisor::mock::MockHypervisor;
use res_hypervisor::VmState;
use tempfile::TempDir;

pub const LAB1: &str = r#"
name: lab1
vrdp_base_port: 5000
groups:
  - clones: 2
    templates:
      - name: win10
        vrdp_enabled: true
        internal_networks: [intnet]
"#;

/// Three templates in one set, declared A, B, C.
pub const ABC: &str = r#"
name: abc
snapshot_on_create: false
groups:
  - clones: 1
    templates:
      - name: a
      - name: b
      - name: c
"#;

pub struct TestEngine {
    pub dir: TempDir,
    pub mock: Arc<MockHypervisor>,
    pub broker: Arc<RecordingBroker>,
    pub engine: Arc<Engine>,
}

pub fn engine_config(dir: &TempDir, fan_out: FanOut) -> EngineConfig {
    EngineConfig {
        experiments_dir: dir.path().join("experiments"),
        poll_interval_ms: 1,
        poll_deadline_secs: None,
        fan_out,
        display_host: "10.0.0.5".to_string(),
        ..EngineConfig::default()
    }
}

/// An engine over `mock` with `experiments` already stored.
pub fn build_with(mock: MockHypervisor, experiments: &[&str], config: impl FnOnce(&TempDir) -> EngineConfig) -> TestEngine {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mock = Arc::new(mock);
    let broker = Arc::new(RecordingBroker::default());
    let engine = Engine::builder()
        .config(config(&dir))
        .hypervisor(mock.clone())
        .display_broker(broker.clone())
        .build()
        .expect("Failed to build engine");
    for yaml in experiments {
        let experiment = ExperimentConfig::from_yaml(yaml).expect("Invalid fixture experiment");
        engine.store().save(&experiment).expect("Failed to store experiment");
    }
    TestEngine {
        dir,
        mock,
        broker,
        engine: Arc::new(engine),
    }
}

pub fn build(mock: MockHypervisor, experiments: &[&str]) -> TestEngine {
    build_with(mock, experiments, |dir| engine_config(dir, FanOut::Sequential))
}

/// A mock with every template of LAB1 and ABC registered.
pub fn templates() -> MockHypervisor {
    MockHypervisor::new()
        .with_vm("win10", VmState::Stopped)
        .with_vm("a", VmState::Stopped)
        .with_vm("b", VmState::Stopped)
        .with_vm("c", VmState::Stopped)
}

/// Display broker that records what it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    pub users: Mutex<BTreeMap<String, String>>,
    pub connections: Mutex<Vec<ConnectionRequest>>,
    pub grants: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DisplayBroker for RecordingBroker {
    async fn login(&self, _: &Endpoint) -> res_engine::Result<()> {
        Ok(())
    }

    async fn create_user(&self, _: &Endpoint, username: &str, password: &str) -> res_engine::Result<()> {
        self.users
            .lock()
            .unwrap()
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn delete_user(&self, _: &Endpoint, username: &str) -> res_engine::Result<()> {
        self.users.lock().unwrap().remove(username);
        Ok(())
    }

    async fn list_users(&self, _: &Endpoint) -> res_engine::Result<Vec<String>> {
        Ok(self.users.lock().unwrap().keys().cloned().collect())
    }

    async fn create_connection(&self, _: &Endpoint, request: &ConnectionRequest) -> res_engine::Result<String> {
        let mut connections = self.connections.lock().unwrap();
        connections.push(request.clone());
        Ok(connections.len().to_string())
    }

    async fn delete_connection(&self, _: &Endpoint, _identifier: &str) -> res_engine::Result<()> {
        Ok(())
    }

    async fn list_connections(&self, _: &Endpoint) -> res_engine::Result<Vec<BrokerConnection>> {
        Ok(self
            .connections
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, c)| BrokerConnection {
                identifier: (i + 1).to_string(),
                name: c.name.clone(),
            })
            .collect())
    }

    async fn grant_connection(&self, _: &Endpoint, username: &str, identifier: &str) -> res_engine::Result<()> {
        self.grants
            .lock()
            .unwrap()
            .push((username.to_string(), identifier.to_string()));
        Ok(())
    }

    async fn active_connections(&self, _: &Endpoint) -> res_engine::Result<usize> {
        Ok(0)
    }
}
