//! Generic backend for hypervisors driven through a command line tool.
//!
//! A [`Dialect`] knows how to spell each write for one tool (`VBoxManage`,
//! `vmrun`) and how to read VM information back. [`CliHypervisor`] supplies
//! everything else: it runs each write on a worker thread and accounts it in
//! a [`WriteTracker`] so status queries never wait on the tool.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, info_span};

use crate::error::Result;
use crate::runner::{self, Invocation};
use crate::tracker::WriteTracker;
use crate::{
    CloneSpec, GuestCommand, HostOs, Hypervisor, VmInfo, VmManagerStatus, WriteOp,
};

const REFRESH_ALL_KEY: &str = "*";

/// Tool-specific half of a CLI backend.
pub trait Dialect: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Invocations that carry out `op` on `vm`, in order. An empty plan
    /// completes immediately.
    fn plan(&self, vm: &str, op: &WriteOp, cached: Option<&VmInfo>) -> Result<Vec<Invocation>>;

    /// Read the current information for one VM. A VM the tool does not know
    /// is reported as [`crate::VmState::Missing`], not as an error.
    fn inspect(&self, vm: &str) -> Result<VmInfo>;

    /// Names of every VM the tool knows about.
    fn list(&self) -> Result<Vec<String>>;
}

pub struct CliHypervisor<D: Dialect> {
    dialect: Arc<D>,
    tracker: Arc<WriteTracker>,
    host_os: HostOs,
}

impl<D: Dialect> CliHypervisor<D> {
    pub fn new(dialect: D, host_os: HostOs) -> Self {
        Self {
            dialect: Arc::new(dialect),
            tracker: WriteTracker::new(),
            host_os,
        }
    }

    pub fn dialect(&self) -> &D {
        &self.dialect
    }

    /// Start `op` in the background and return once it is accounted.
    fn submit(&self, vm: &str, op: WriteOp) -> Result<()> {
        let cached = self.tracker.info(vm);
        let steps = self.dialect.plan(vm, &op, cached.as_ref())?;
        let guard = self.tracker.begin(vm);
        let tracker = Arc::clone(&self.tracker);
        let backend = self.dialect.name();

        debug!(backend, vm = %vm, op = %op.kind(), steps = steps.len(), "Issuing write");
        thread::Builder::new()
            .name(format!("res-{}-{}", op.kind(), vm))
            .spawn(move || {
                let span = info_span!("hypervisor_write", backend, vm = %guard.vm(), op = %op.kind());
                let _enter = span.enter();

                let outcome = steps
                    .iter()
                    .try_for_each(|step| runner::run_checked(step).map(|_| ()));

                match outcome {
                    Ok(()) => {
                        match &op {
                            WriteOp::Remove => tracker.forget(guard.vm()),
                            WriteOp::Clone(spec) => {
                                tracker.record_state(&spec.clone, crate::VmState::Stopped)
                            }
                            _ => {
                                if let Some(state) = op.expected_state() {
                                    tracker.record_state(guard.vm(), state);
                                }
                            }
                        }
                        guard.finish(Ok(()));
                    }
                    Err(e) => guard.finish(Err(e.to_string())),
                }
            })?;
        Ok(())
    }

    fn submit_refresh(&self, vm: &str) -> Result<()> {
        let guard = self.tracker.begin(vm);
        let tracker = Arc::clone(&self.tracker);
        let dialect = Arc::clone(&self.dialect);

        thread::Builder::new()
            .name(format!("res-refresh-{vm}"))
            .spawn(move || match dialect.inspect(guard.vm()) {
                Ok(info) => {
                    tracker.record_info(info);
                    guard.finish(Ok(()));
                }
                Err(e) => guard.finish(Err(e.to_string())),
            })?;
        Ok(())
    }
}

impl<D: Dialect> Hypervisor for CliHypervisor<D> {
    fn name(&self) -> &'static str {
        self.dialect.name()
    }

    fn host_os(&self) -> HostOs {
        self.host_os
    }

    fn clone_vm(&self, spec: &CloneSpec) -> Result<()> {
        // Accounted against the clone so callers poll the name they will use next.
        self.submit(&spec.clone, WriteOp::Clone(spec.clone()))
    }

    fn configure_vm(&self, spec: &CloneSpec) -> Result<()> {
        self.submit(&spec.clone, WriteOp::Configure(spec.clone()))
    }

    fn start(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::Start)
    }

    fn stop(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::Stop)
    }

    fn suspend(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::Suspend)
    }

    fn pause(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::Pause)
    }

    fn snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.submit(vm, WriteOp::Snapshot(snapshot.to_string()))
    }

    fn restore_snapshot(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::RestoreSnapshot)
    }

    fn remove(&self, vm: &str) -> Result<()> {
        self.submit(vm, WriteOp::Remove)
    }

    fn run_guest(&self, vm: &str, command: &GuestCommand) -> Result<()> {
        self.submit(vm, WriteOp::Guest(command.clone()))
    }

    fn import_vm(&self, appliance: &Path) -> Result<()> {
        let key = appliance
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| appliance.display().to_string());
        self.submit(&key, WriteOp::Import(appliance.to_path_buf()))
    }

    fn export_vm(&self, vm: &str, destination: &Path) -> Result<()> {
        self.submit(vm, WriteOp::Export(destination.to_path_buf()))
    }

    fn refresh_vm(&self, vm: &str) -> Result<()> {
        self.submit_refresh(vm)
    }

    fn refresh_all(&self) -> Result<()> {
        let guard = self.tracker.begin(REFRESH_ALL_KEY);
        let tracker = Arc::clone(&self.tracker);
        let dialect = Arc::clone(&self.dialect);

        thread::Builder::new()
            .name("res-refresh-all".to_string())
            .spawn(move || {
                let names = match dialect.list() {
                    Ok(names) => names,
                    Err(e) => return guard.finish(Err(e.to_string())),
                };
                let mut failures = Vec::new();
                for name in &names {
                    match dialect.inspect(name) {
                        Ok(info) => tracker.record_info(info),
                        Err(e) => failures.push(format!("{name}: {e}")),
                    }
                }
                info!(vms = names.len(), failed = failures.len(), "Refreshed all VMs");
                if failures.is_empty() {
                    guard.finish(Ok(()));
                } else {
                    guard.finish(Err(failures.join("; ")));
                }
            })?;
        Ok(())
    }

    fn pending_writes(&self, vm: &str) -> usize {
        self.tracker.pending(Some(vm))
    }

    fn manager_status(&self) -> VmManagerStatus {
        VmManagerStatus {
            backend: self.dialect.name().to_string(),
            host_os: self.host_os,
            write_status: self.tracker.pending(None),
            known_vms: self.tracker.all().len(),
            last_error: self.tracker.last_error(),
        }
    }

    fn vm_info(&self, vm: &str) -> Option<VmInfo> {
        self.tracker.info(vm)
    }

    fn list_vms(&self) -> Vec<VmInfo> {
        self.tracker.all()
    }

    fn take_fault(&self, vm: &str) -> Option<String> {
        self.tracker.take_fault(vm)
    }
}
