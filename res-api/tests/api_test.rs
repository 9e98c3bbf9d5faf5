//! Integration tests for the user-facing command endpoint.

mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use common::{create_test_app, create_test_app_with, extract_json_body, run_command_request, DUO};
use res_hypervisor::mock::MockHypervisor;
use res_hypervisor::{VmState, WriteKind};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

async fn create_lab1(t: &common::TestApp) {
    t.engine.execute("experiment create lab1").await.unwrap();
}

#[tokio::test]
async fn test_health_endpoint() {
    let t = create_test_app(MockHypervisor::new());
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = t.app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "res-api");
}

#[tokio::test]
async fn test_missing_configname_is_bad_request() {
    let t = create_test_app(MockHypervisor::new());
    let response = t
        .app
        .oneshot(run_command_request(json!({
            "username": "lab1-user1",
            "password": "lab1-user1",
            "command": "start"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"], "No Scenario Name Provided");
}

#[tokio::test]
async fn test_unknown_credentials_are_forbidden() {
    let t = create_test_app(MockHypervisor::new());
    let response = t
        .app
        .oneshot(run_command_request(json!({
            "username": "lab1-user1",
            "password": "wrong",
            "configname": "lab1",
            "command": "start"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(t.mock.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_configuration_is_bad_request() {
    let t = create_test_app(MockHypervisor::new());
    let response = t
        .app
        .oneshot(run_command_request(json!({
            "username": "lab9-user1",
            "password": "lab9-user1",
            "configname": "lab9",
            "command": "start"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_command_is_bad_request() {
    let t = create_test_app(MockHypervisor::new());
    let response = t
        .app
        .oneshot(run_command_request(json!({
            "username": "lab1-user1",
            "password": "lab1-user1",
            "configname": "lab1",
            "command": "remove"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_start_touches_only_the_callers_clone() {
    let t = create_test_app(MockHypervisor::new());
    create_lab1(&t).await;
    let before = t.mock.calls().len();

    let response = t
        .app
        .clone()
        .oneshot(run_command_request(json!({
            "username": "lab1-user2",
            "password": "lab1-user2",
            "configname": "lab1",
            "command": "start"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["output"], "lab1-win10-2: started");

    let starts: Vec<String> = t.mock.calls()[before..]
        .iter()
        .filter(|c| c.kind == WriteKind::Start)
        .map(|c| c.vm.clone())
        .collect();
    assert_eq!(starts, vec!["lab1-win10-2"]);
    assert_eq!(t.mock.state_of("lab1-win10-1"), Some(VmState::Stopped));
    assert_eq!(t.mock.state_of("lab1-win10-2"), Some(VmState::Running));
}

#[tokio::test]
async fn test_status_waits_for_refresh_then_reports() {
    let t = create_test_app(MockHypervisor::new().with_busy_polls(2));
    create_lab1(&t).await;

    let response = t
        .app
        .clone()
        .oneshot(run_command_request(json!({
            "username": "lab1-user1",
            "password": "lab1-user1",
            "configname": "lab1",
            "command": "status"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["output"], "VM: lab1-win10-1\nStatus: stopped");
    assert!(t
        .mock
        .calls()
        .iter()
        .any(|c| c.kind == WriteKind::Refresh && c.vm == "lab1-win10-1"));
}

#[tokio::test]
async fn test_failed_write_is_reported_as_server_error() {
    let t = create_test_app(MockHypervisor::new());
    create_lab1(&t).await;
    t.mock.fail_on("lab1-win10-1", WriteKind::Start);

    let response = t
        .app
        .clone()
        .oneshot(run_command_request(json!({
            "username": "lab1-user1",
            "password": "lab1-user1",
            "configname": "lab1",
            "command": "start"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = extract_json_body(response).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("lab1-win10-1: failed"), "{error}");
    assert_eq!(t.mock.state_of("lab1-win10-1"), Some(VmState::Stopped));
}

#[tokio::test]
async fn test_every_assigned_clone_is_driven() {
    let t = create_test_app_with(MockHypervisor::new(), &[DUO]);
    t.engine.execute("experiment create duo").await.unwrap();

    let start = t
        .app
        .clone()
        .oneshot(run_command_request(json!({
            "username": "duo-user2",
            "password": "duo-user2",
            "configname": "duo",
            "command": "start"
        })))
        .await
        .unwrap();
    assert_eq!(start.status(), StatusCode::OK);
    let body: Value = extract_json_body(start).await;
    assert_eq!(body["output"], "duo-kali-2: started\nduo-target-2: started");
    assert_eq!(t.mock.state_of("duo-kali-2"), Some(VmState::Running));
    assert_eq!(t.mock.state_of("duo-target-2"), Some(VmState::Running));
    assert_eq!(t.mock.state_of("duo-kali-1"), Some(VmState::Stopped));

    let status = t
        .app
        .clone()
        .oneshot(run_command_request(json!({
            "username": "duo-user2",
            "password": "duo-user2",
            "configname": "duo",
            "command": "status"
        })))
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::OK);
    let body: Value = extract_json_body(status).await;
    assert_eq!(
        body["output"],
        "VM: duo-kali-2\nStatus: running\nVM: duo-target-2\nStatus: running"
    );
}
