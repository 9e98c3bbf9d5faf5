//! Experiment lifecycle: resolve a selector, then drive every selected
//! instance through its write plan, polling each write to completion.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use res_hypervisor::{CloneSpec, GuestCommand, Hypervisor, VmState, WriteOp};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use super::{ExperimentConfig, ExperimentStore, Instance, Selector, VmTemplate};
use crate::completion::{complete_write, PollPolicy};
use crate::config::FanOut;
use crate::error::{ErrorKind, Result};
use crate::fleet;
use crate::output::{FleetReport, Progress, ProgressEvent};
use crate::status::{ManagerStatus, StatusTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleVerb {
    Create,
    Start,
    Stop,
    Suspend,
    Pause,
    Snapshot,
    Restore,
    Remove,
    GuestCmd,
    GuestStored,
    Refresh,
}

impl LifecycleVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleVerb::Create => "create",
            LifecycleVerb::Start => "start",
            LifecycleVerb::Stop => "stop",
            LifecycleVerb::Suspend => "suspend",
            LifecycleVerb::Pause => "pause",
            LifecycleVerb::Snapshot => "snapshot",
            LifecycleVerb::Restore => "restore",
            LifecycleVerb::Remove => "remove",
            LifecycleVerb::GuestCmd => "guestcmd",
            LifecycleVerb::GuestStored => "gueststored",
            LifecycleVerb::Refresh => "refresh",
        }
    }

    /// Detail reported for an instance whose plan ran to the end.
    fn done(&self) -> &'static str {
        match self {
            LifecycleVerb::Create => "created",
            LifecycleVerb::Start => "started",
            LifecycleVerb::Stop => "stopped",
            LifecycleVerb::Suspend => "suspended",
            LifecycleVerb::Pause => "paused",
            LifecycleVerb::Snapshot => "snapshot taken",
            LifecycleVerb::Restore => "restored",
            LifecycleVerb::Remove => "removed",
            LifecycleVerb::GuestCmd | LifecycleVerb::GuestStored => "guest commands completed",
            LifecycleVerb::Refresh => "refreshed",
        }
    }
}

impl fmt::Display for LifecycleVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write of an instance plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub op: WriteOp,
    /// A backend fault on this step does not stop the plan (e.g. stopping a
    /// VM that is already off).
    pub tolerate_fault: bool,
}

impl Step {
    fn required(op: WriteOp) -> Self {
        Self {
            op,
            tolerate_fault: false,
        }
    }

    fn tolerant(op: WriteOp) -> Self {
        Self {
            op,
            tolerate_fault: true,
        }
    }
}

pub fn snapshot_name() -> String {
    format!("snap-{}", Utc::now().format("%Y%m%d%H%M%S"))
}

/// Fill in guest credentials the command leaves out from its template.
fn with_template_credentials(command: &GuestCommand, template: Option<&VmTemplate>) -> GuestCommand {
    let mut command = command.clone();
    if let Some(template) = template {
        if command.username.is_none() {
            command.username = template.guest_username.clone();
        }
        if command.password.is_none() {
            command.password = template.guest_password.clone();
        }
    }
    command
}

/// The writes `verb` performs on `instance`, in order.
pub fn plan(verb: LifecycleVerb, config: &ExperimentConfig, instance: &Instance) -> Vec<Step> {
    let template = config.template(&instance.template);
    match verb {
        LifecycleVerb::Create => {
            let spec = CloneSpec {
                template: instance.template.clone(),
                clone: instance.name.clone(),
                linked: config.linked_clones,
                base_snapshot: template.and_then(|t| t.base_snapshot.clone()),
                group: config.name.clone(),
                internal_networks: instance.internal_networks.clone(),
                vrdp_port: instance.vrdp_port,
            };
            let mut steps = vec![
                Step::required(WriteOp::Clone(spec.clone())),
                Step::required(WriteOp::Configure(spec)),
            ];
            if config.snapshot_on_create {
                steps.push(Step::required(WriteOp::Snapshot(snapshot_name())));
            }
            steps
        }
        LifecycleVerb::Start => vec![Step::required(WriteOp::Start)],
        LifecycleVerb::Stop => vec![Step::required(WriteOp::Stop)],
        LifecycleVerb::Suspend => vec![Step::required(WriteOp::Suspend)],
        LifecycleVerb::Pause => vec![Step::required(WriteOp::Pause)],
        LifecycleVerb::Snapshot => vec![Step::required(WriteOp::Snapshot(snapshot_name()))],
        LifecycleVerb::Restore => vec![
            Step::tolerant(WriteOp::Stop),
            Step::required(WriteOp::RestoreSnapshot),
            Step::required(WriteOp::Start),
        ],
        LifecycleVerb::Remove => vec![
            Step::tolerant(WriteOp::Stop),
            Step::required(WriteOp::Remove),
        ],
        LifecycleVerb::GuestCmd => template
            .map(|t| {
                t.startup_commands
                    .iter()
                    .map(|c| Step::required(WriteOp::Guest(with_template_credentials(c, Some(t)))))
                    .collect()
            })
            .unwrap_or_default(),
        LifecycleVerb::GuestStored => template
            .map(|t| {
                t.stored_commands
                    .iter()
                    .map(|c| Step::required(WriteOp::Guest(with_template_credentials(c, Some(t)))))
                    .collect()
            })
            .unwrap_or_default(),
        LifecycleVerb::Refresh => vec![Step::required(WriteOp::Refresh)],
    }
}

pub struct ExperimentManager {
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<ExperimentStore>,
    policy: PollPolicy,
    fan_out: FanOut,
    status: StatusTracker,
}

impl ExperimentManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<ExperimentStore>,
        policy: PollPolicy,
        fan_out: FanOut,
    ) -> Self {
        Self {
            hypervisor,
            store,
            policy,
            fan_out,
            status: StatusTracker::new("ExperimentMgr"),
        }
    }

    pub fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// Apply `verb` to every instance `selector` picks out of `config_name`.
    pub async fn run(
        &self,
        verb: LifecycleVerb,
        config_name: &str,
        selector: &Selector,
        progress: &Progress,
    ) -> Result<FleetReport> {
        let config = self.store.load(config_name)?;
        let targets = selector.resolve(&config.instances());
        info!(
            verb = %verb,
            config = %config.name,
            selector = %selector,
            instances = targets.len(),
            "Running experiment operation"
        );

        let guard = self.status.begin(format!("{verb} {}", config.name));
        let config = &config;
        let report = fleet::run(verb.as_str(), &config.name, targets, self.fan_out, progress, |instance| {
            self.apply(verb, config, instance, progress)
        })
        .instrument(info_span!("experiment", verb = %verb, config = %config.name))
        .await;
        guard.finish_counts(report.succeeded(), report.failed());
        Ok(report)
    }

    /// Refresh and report the state of every instance of `config_name`.
    pub async fn refresh(&self, config_name: &str, progress: &Progress) -> Result<FleetReport> {
        self.run(LifecycleVerb::Refresh, config_name, &Selector::all(), progress)
            .await
    }

    async fn apply(
        &self,
        verb: LifecycleVerb,
        config: &ExperimentConfig,
        instance: Instance,
        progress: &Progress,
    ) -> Result<String> {
        for step in plan(verb, config, &instance) {
            progress.emit(ProgressEvent::WriteIssued {
                instance: instance.name.clone(),
                write: step.op.kind(),
            });
            match complete_write(self.hypervisor.as_ref(), &instance.name, &step.op, &self.policy).await {
                Ok(()) => {}
                Err(e) if step.tolerate_fault && e.kind() == ErrorKind::BackendFault => {
                    debug!(vm = %instance.name, error = %e, "Ignoring tolerated fault");
                }
                Err(e) => return Err(e),
            }
        }

        if verb == LifecycleVerb::Refresh {
            return Ok(self.state_line(&instance.name));
        }
        Ok(verb.done().to_string())
    }

    /// Current state of `vm` as text. A VM the backend does not know is `missing`.
    fn state_line(&self, vm: &str) -> String {
        match self.hypervisor.vm_info(vm) {
            None => VmState::Missing.to_string(),
            Some(info) => info.state.to_string(),
        }
    }

    /// Manager snapshot; `write_status` includes the backend's pending writes.
    pub fn status(&self) -> ManagerStatus {
        self.status
            .snapshot(self.hypervisor.manager_status().write_status)
    }
}
