//! Shared fixtures for res-api integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{body::Body, http::Request, response::Response, Router};
use res_api::{create_app, AppState, Config};
use res_engine::{Engine, EngineConfig, ExperimentConfig};
use res_hypervisor::mock::MockHypervisor;
use res_hypervisor::VmState;
use serde::de::DeserializeOwned;
use tempfile::TempDir;

pub const LAB1: &str = r#"
name: lab1
vrdp_base_port: 5000
groups:
  - clones: 2
    templates:
      - name: win10
        vrdp_enabled: true
"#;

/// Two templates per set, so every user owns two clones.
pub const DUO: &str = r#"
name: duo
groups:
  - clones: 2
    templates:
      - name: kali
      - name: target
"#;

pub struct TestApp {
    pub dir: TempDir,
    pub mock: Arc<MockHypervisor>,
    pub engine: Arc<Engine>,
    pub app: Router,
}

/// A gateway over an engine with `lab1` stored.
pub fn create_test_app(mock: MockHypervisor) -> TestApp {
    create_test_app_with(mock, &[LAB1])
}

/// A gateway over an engine with `experiments` stored and their templates
/// registered on the mock.
pub fn create_test_app_with(mock: MockHypervisor, experiments: &[&str]) -> TestApp {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mock = Arc::new(
        mock.with_vm("win10", VmState::Stopped)
            .with_vm("kali", VmState::Stopped)
            .with_vm("target", VmState::Stopped),
    );
    let engine = Engine::builder()
        .config(EngineConfig {
            experiments_dir: dir.path().join("experiments"),
            poll_interval_ms: 1,
            ..EngineConfig::default()
        })
        .hypervisor(mock.clone())
        .build()
        .expect("Failed to build engine");
    for yaml in experiments {
        let experiment = ExperimentConfig::from_yaml(yaml).expect("Invalid fixture experiment");
        engine.store().save(&experiment).expect("Failed to store experiment");
    }
    let engine = Arc::new(engine);

    let config = Config {
        bind_addr: "127.0.0.1:0".to_string(),
        poll_interval_ms: 1,
        idle_timeout_secs: 5,
    };
    let app = create_app(AppState::new(engine.clone(), &config));
    TestApp {
        dir,
        mock,
        engine,
        app,
    }
}

pub fn run_command_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/run_command")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn extract_json_body<T: DeserializeOwned>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
