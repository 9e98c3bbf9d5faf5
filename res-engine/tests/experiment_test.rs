//! Experiment lifecycle through the command router, against the mock backend.

mod common;

use common::{build, build_with, engine_config, templates, ABC, LAB1};
use res_engine::{CommandOutput, ErrorKind, FanOut, FleetReport, Outcome};
use res_hypervisor::mock::MockHypervisor;
use res_hypervisor::{VmState, WriteKind};

fn fleet(output: CommandOutput) -> FleetReport {
    match output {
        CommandOutput::Fleet(report) => report,
        other => panic!("expected a fleet report, got {other:?}"),
    }
}

#[tokio::test]
async fn test_lab1_create_then_status() {
    let t = build(templates(), &[LAB1]);

    let created = fleet(t.engine.execute("experiment create lab1").await.unwrap());
    assert_eq!(created.succeeded(), 2);

    let status = t.engine.execute("experiment status lab1").await.unwrap();
    assert_eq!(status.to_text(), "lab1-win10-1: stopped\nlab1-win10-2: stopped");

    let clones: Vec<String> = t
        .mock
        .calls()
        .into_iter()
        .filter(|c| c.kind == WriteKind::Clone)
        .map(|c| c.vm)
        .collect();
    assert_eq!(clones, vec!["lab1-win10-1", "lab1-win10-2"]);
}

#[tokio::test]
async fn test_full_lifecycle() {
    let t = build(templates(), &[LAB1]);
    for line in [
        "experiment create lab1",
        "experiment start lab1",
        "experiment pause lab1 set 1",
        "experiment snapshot lab1 vm lab1-win10-2",
        "experiment restore lab1",
    ] {
        let report = fleet(t.engine.execute(line).await.unwrap());
        assert_eq!(report.failed(), 0, "{line}: {}", report.to_text());
    }
    assert_eq!(t.mock.state_of("lab1-win10-1"), Some(VmState::Running));

    let removed = fleet(t.engine.execute("experiment remove lab1").await.unwrap());
    assert_eq!(removed.succeeded(), 2);
    let status = t.engine.execute("experiment status lab1").await.unwrap();
    assert_eq!(status.to_text(), "lab1-win10-1: missing\nlab1-win10-2: missing");
}

#[tokio::test]
async fn test_writes_follow_declared_order() {
    let t = build(templates(), &[ABC]);
    t.engine.execute("experiment create abc").await.unwrap();

    // Sequential mode finishes every write of A before B starts.
    let order: Vec<String> = t.mock.calls().into_iter().map(|c| c.vm).collect();
    assert_eq!(
        order,
        vec!["abc-a-1", "abc-a-1", "abc-b-1", "abc-b-1", "abc-c-1", "abc-c-1"]
    );
}

#[tokio::test]
async fn test_parallel_reports_in_declared_order() {
    let t = build_with(templates().with_busy_polls(2), &[ABC], |dir| {
        engine_config(dir, FanOut::Parallel)
    });
    let report = fleet(t.engine.execute("experiment create abc").await.unwrap());
    let names: Vec<&str> = report.instances.iter().map(|o| o.instance.as_str()).collect();
    assert_eq!(names, vec!["abc-a-1", "abc-b-1", "abc-c-1"]);
    assert_eq!(report.succeeded(), 3);
}

#[tokio::test]
async fn test_busy_backend_costs_k_plus_one_queries() {
    let mock = MockHypervisor::new()
        .with_busy_polls(3)
        .with_vm("lab1-win10-1", VmState::Stopped);
    let t = build(mock, &[LAB1]);

    let report = fleet(t.engine.execute("experiment start lab1 vm lab1-win10-1").await.unwrap());
    assert_eq!(report.succeeded(), 1);
    assert_eq!(t.mock.pending_queries(), 4);
}

#[tokio::test]
async fn test_fault_is_isolated_to_its_instance() {
    let mock = templates();
    mock.fail_on("lab1-win10-1", WriteKind::Configure);
    let t = build(mock, &[LAB1]);

    let report = fleet(t.engine.execute("experiment create lab1").await.unwrap());
    assert_eq!(report.instances.len(), 2);
    match &report.get("lab1-win10-1").unwrap().outcome {
        Outcome::Failed { kind, message } => {
            assert_eq!(*kind, ErrorKind::BackendFault);
            assert!(message.contains("configure lab1-win10-1"), "{message}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(report.get("lab1-win10-2").unwrap().is_success());

    // The failed plan stopped before its snapshot.
    let snapshots: Vec<String> = t
        .mock
        .calls()
        .into_iter()
        .filter(|c| c.kind == WriteKind::Snapshot)
        .map(|c| c.vm)
        .collect();
    assert_eq!(snapshots, vec!["lab1-win10-2"]);
}

#[tokio::test]
async fn test_deadline_yields_timeout() {
    let mock = MockHypervisor::new()
        .with_busy_polls(1_000)
        .with_vm("lab1-win10-1", VmState::Stopped)
        .with_vm("lab1-win10-2", VmState::Stopped);
    let t = build_with(mock, &[LAB1], |dir| {
        let mut config = engine_config(dir, FanOut::Sequential);
        config.poll_deadline_secs = Some(0);
        config
    });

    let report = fleet(t.engine.execute("experiment start lab1").await.unwrap());
    assert_eq!(report.failed(), 2);
    assert!(report.instances.iter().all(|o| matches!(
        o.outcome,
        Outcome::Failed {
            kind: ErrorKind::Timeout,
            ..
        }
    )));
}

#[tokio::test]
async fn test_unknown_selector_selects_nothing() {
    let t = build(templates(), &[LAB1]);
    let output = t.engine.execute("experiment start lab1 vm ghost").await.unwrap();
    assert_eq!(output.to_text(), "start lab1: no instances selected");
    assert!(t.mock.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_configuration() {
    let t = build(templates(), &[LAB1]);
    let error = t.engine.execute("experiment start lab9").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ConfigurationNotFound);
}

#[tokio::test]
async fn test_guest_commands_need_a_running_guest() {
    let guest = r#"
name: guest
snapshot_on_create: false
groups:
  - templates:
      - name: win10
        guest_username: student
        guest_password: student
        startup_commands:
          - executable: C:\Windows\System32\cmd.exe
            args: ["/c", "echo hello"]
"#;
    let t = build(templates(), &[guest]);
    t.engine.execute("experiment create guest").await.unwrap();

    let stopped = fleet(t.engine.execute("experiment guestcmd guest").await.unwrap());
    assert_eq!(stopped.failed(), 1);

    t.engine.execute("experiment start guest").await.unwrap();
    let running = fleet(t.engine.execute("experiment guestcmd guest").await.unwrap());
    assert_eq!(running.succeeded(), 1);
}
