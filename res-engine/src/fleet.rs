//! Fan-out of one operation across selected instances.

use std::future::Future;

use futures_util::future::join_all;
use tracing::{info, info_span, warn, Instrument};

use crate::config::FanOut;
use crate::error::Result;
use crate::experiment::Instance;
use crate::output::{FleetReport, InstanceOutcome, Progress, ProgressEvent};
use crate::users::UserAssignment;

/// Something a fan-out reports on by name.
pub trait FleetItem {
    fn label(&self) -> &str;
    fn set(&self) -> Option<u32>;
}

impl FleetItem for Instance {
    fn label(&self) -> &str {
        &self.name
    }

    fn set(&self) -> Option<u32> {
        Some(self.set)
    }
}

impl FleetItem for UserAssignment {
    fn label(&self) -> &str {
        &self.username
    }

    fn set(&self) -> Option<u32> {
        self.instances.first().map(|i| i.session.set)
    }
}

/// Run `operation` once per item and collect one outcome per item.
///
/// Sequential mode awaits each instance before starting the next. Parallel
/// mode starts all of them and joins. Either way the report lists instances in
/// the order given, and a failure on one instance never stops the others.
pub async fn run<T, F, Fut>(
    command: &str,
    config: &str,
    instances: Vec<T>,
    mode: FanOut,
    progress: &Progress,
    operation: F,
) -> FleetReport
where
    T: FleetItem,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let mut report = FleetReport::new(command, config);
    let total = instances.len();

    report.instances = match mode {
        FanOut::Sequential => {
            let mut outcomes = Vec::with_capacity(total);
            for instance in instances {
                outcomes.push(run_one(&operation, instance, progress).await);
            }
            outcomes
        }
        FanOut::Parallel => {
            join_all(
                instances
                    .into_iter()
                    .map(|instance| run_one(&operation, instance, progress)),
            )
            .await
        }
    };

    info!(
        command,
        config,
        total,
        succeeded = report.succeeded(),
        failed = report.failed(),
        "Fan-out finished"
    );
    report
}

async fn run_one<T, F, Fut>(operation: &F, instance: T, progress: &Progress) -> InstanceOutcome
where
    T: FleetItem,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let name = instance.label().to_string();
    let span = info_span!("instance", vm = %name, set = instance.set());
    progress.emit(ProgressEvent::InstanceStarted {
        instance: name.clone(),
    });

    let outcome = match operation(instance).instrument(span).await {
        Ok(detail) => InstanceOutcome::succeeded(&name, detail),
        Err(e) => {
            warn!(vm = %name, error = %e, "Instance failed");
            InstanceOutcome::failed(&name, &e)
        }
    };

    progress.emit(ProgressEvent::InstanceFinished {
        instance: name,
        succeeded: outcome.is_success(),
    });
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::experiment::tests::MIXED;
    use crate::experiment::ExperimentConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn instances() -> Vec<Instance> {
        ExperimentConfig::from_yaml(MIXED).unwrap().instances()
    }

    #[tokio::test]
    async fn test_failure_is_isolated_per_instance() {
        let report = run("start", "mixed", instances(), FanOut::Sequential, &Progress::none(), |i| async move {
            if i.name == "mixed-target-1" {
                Err(EngineError::BackendFault("locked".into()))
            } else {
                Ok("started".to_string())
            }
        })
        .await;

        assert_eq!(report.instances.len(), 5);
        assert_eq!(report.failed(), 1);
        assert!(!report.get("mixed-target-1").unwrap().is_success());
        assert!(report.get("mixed-server-3").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_parallel_keeps_declared_order() {
        let declared: Vec<String> = instances().iter().map(|i| i.name.clone()).collect();
        // Later instances finish first.
        let report = run("start", "mixed", instances(), FanOut::Parallel, &Progress::none(), |i| async move {
            let delay = 5 * (5 - i.index as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(i.name)
        })
        .await;

        let reported: Vec<String> = report.instances.iter().map(|o| o.instance.clone()).collect();
        assert_eq!(reported, declared);
    }

    #[tokio::test]
    async fn test_sequential_never_overlaps() {
        let active = Arc::new(Mutex::new(0usize));
        let peak = Arc::new(Mutex::new(0usize));
        run("stop", "mixed", instances(), FanOut::Sequential, &Progress::none(), |_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                {
                    let mut now = active.lock().unwrap();
                    *now += 1;
                    let mut max = peak.lock().unwrap();
                    *max = (*max).max(*now);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                *active.lock().unwrap() -= 1;
                Ok(String::new())
            }
        })
        .await;
        assert_eq!(*peak.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subset: Vec<Instance> = instances().into_iter().take(1).collect();
        run("start", "mixed", subset, FanOut::Sequential, &Progress::to(tx), |_| async {
            Ok("ok".to_string())
        })
        .await;

        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::InstanceStarted {
                instance: "mixed-kali-1".into()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::InstanceFinished {
                instance: "mixed-kali-1".into(),
                succeeded: true
            })
        );
    }
}
