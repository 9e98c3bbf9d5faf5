//! In-memory backend for tests.
//!
//! Writes take effect immediately, but each write keeps its VM "busy" for a
//! configurable number of status queries so callers exercise their polling
//! loops. Faults can be injected per `(vm, write kind)`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::Result;
use crate::{
    CloneSpec, GuestCommand, HostOs, Hypervisor, VmInfo, VmManagerStatus, VmState, WriteKind,
    WriteOp,
};

/// One write observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub vm: String,
    pub kind: WriteKind,
    /// Free-form detail (snapshot name, guest command line, path).
    pub detail: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    vms: BTreeMap<String, VmInfo>,
    pending: HashMap<String, usize>,
    faults: HashMap<String, String>,
    fail_on: HashSet<(String, WriteKind)>,
    calls: Vec<MockCall>,
    pending_queries: usize,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockHypervisor {
    state: Mutex<MockState>,
    busy_polls: usize,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write reports busy for the next `polls` status queries on its VM.
    pub fn with_busy_polls(mut self, polls: usize) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Register an existing VM, typically a template.
    pub fn with_vm(self, name: &str, state: VmState) -> Self {
        self.lock().vms.insert(name.to_string(), VmInfo::new(name, state));
        self
    }

    /// Make every `kind` write on `vm` fail.
    pub fn fail_on(&self, vm: &str, kind: WriteKind) {
        self.lock().fail_on.insert((vm.to_string(), kind));
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of per-VM pending-write queries answered so far.
    pub fn pending_queries(&self) -> usize {
        self.lock().pending_queries
    }

    pub fn state_of(&self, vm: &str) -> Option<VmState> {
        self.lock().vms.get(vm).map(|info| info.state)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, vm: &str, op: WriteOp) -> Result<()> {
        let kind = op.kind();
        let detail = match &op {
            WriteOp::Clone(spec) | WriteOp::Configure(spec) => Some(spec.template.clone()),
            WriteOp::Snapshot(name) => Some(name.clone()),
            WriteOp::Guest(command) => Some(command.display()),
            WriteOp::Import(path) | WriteOp::Export(path) => Some(path.display().to_string()),
            _ => None,
        };

        let mut state = self.lock();
        state.calls.push(MockCall {
            vm: vm.to_string(),
            kind,
            detail,
        });
        state.faults.remove(vm);
        if self.busy_polls > 0 {
            *state.pending.entry(vm.to_string()).or_insert(0) += self.busy_polls;
        }

        let outcome = if state.fail_on.contains(&(vm.to_string(), kind)) {
            Err(format!("injected {kind} fault on {vm}"))
        } else {
            apply(&mut state.vms, vm, &op)
        };
        if let Err(message) = outcome {
            state.faults.insert(vm.to_string(), message.clone());
            state.last_error = Some(message);
        }
        Ok(())
    }
}

fn require<'a>(vms: &'a mut BTreeMap<String, VmInfo>, vm: &str) -> std::result::Result<&'a mut VmInfo, String> {
    vms.get_mut(vm).ok_or_else(|| format!("VM not found: {vm}"))
}

fn apply(vms: &mut BTreeMap<String, VmInfo>, vm: &str, op: &WriteOp) -> std::result::Result<(), String> {
    match op {
        WriteOp::Clone(spec) => {
            if !vms.contains_key(&spec.template) {
                return Err(format!("template not found: {}", spec.template));
            }
            if vms.contains_key(&spec.clone) {
                return Err(format!("VM already exists: {}", spec.clone));
            }
            vms.insert(spec.clone.clone(), VmInfo::new(&spec.clone, VmState::Stopped));
        }
        WriteOp::Configure(spec) => require(vms, &spec.clone)?.vrdp_port = spec.vrdp_port,
        WriteOp::Start | WriteOp::Stop | WriteOp::Suspend | WriteOp::Pause => {
            let info = require(vms, vm)?;
            if let Some(state) = op.expected_state() {
                info.state = state;
            }
        }
        WriteOp::Snapshot(name) => {
            let info = require(vms, vm)?;
            info.snapshots.push(name.clone());
            info.current_snapshot = Some(name.clone());
        }
        WriteOp::RestoreSnapshot => {
            let info = require(vms, vm)?;
            if info.current_snapshot.is_none() {
                return Err(format!("{vm} has no current snapshot"));
            }
            info.state = VmState::Stopped;
        }
        WriteOp::Remove => {
            vms.remove(vm).ok_or_else(|| format!("VM not found: {vm}"))?;
        }
        WriteOp::Guest(_) => {
            if require(vms, vm)?.state != VmState::Running {
                return Err(format!("{vm} is not running"));
            }
        }
        WriteOp::Import(_) => {
            vms.insert(vm.to_string(), VmInfo::new(vm, VmState::Stopped));
        }
        WriteOp::Export(path) => {
            require(vms, vm)?;
            fs::write(path, format!("mock appliance: {vm}\n")).map_err(|e| e.to_string())?;
        }
        WriteOp::Refresh => {
            if let Some(info) = vms.get_mut(vm) {
                info.refreshed_at = Some(Utc::now());
            }
        }
    }
    Ok(())
}

impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn host_os(&self) -> HostOs {
        HostOs::current()
    }

    fn clone_vm(&self, spec: &CloneSpec) -> Result<()> {
        self.write(&spec.clone, WriteOp::Clone(spec.clone()))
    }

    fn configure_vm(&self, spec: &CloneSpec) -> Result<()> {
        self.write(&spec.clone, WriteOp::Configure(spec.clone()))
    }

    fn start(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Start)
    }

    fn stop(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Stop)
    }

    fn suspend(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Suspend)
    }

    fn pause(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Pause)
    }

    fn snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.write(vm, WriteOp::Snapshot(snapshot.to_string()))
    }

    fn restore_snapshot(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::RestoreSnapshot)
    }

    fn remove(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Remove)
    }

    fn run_guest(&self, vm: &str, command: &GuestCommand) -> Result<()> {
        self.write(vm, WriteOp::Guest(command.clone()))
    }

    fn import_vm(&self, appliance: &Path) -> Result<()> {
        let name = appliance
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.write(&name, WriteOp::Import(appliance.to_path_buf()))
    }

    fn export_vm(&self, vm: &str, destination: &Path) -> Result<()> {
        self.write(vm, WriteOp::Export(destination.to_path_buf()))
    }

    fn refresh_vm(&self, vm: &str) -> Result<()> {
        self.write(vm, WriteOp::Refresh)
    }

    fn refresh_all(&self) -> Result<()> {
        let names: Vec<String> = self.lock().vms.keys().cloned().collect();
        for name in names {
            self.write(&name, WriteOp::Refresh)?;
        }
        Ok(())
    }

    fn pending_writes(&self, vm: &str) -> usize {
        let mut state = self.lock();
        state.pending_queries += 1;
        match state.pending.get_mut(vm) {
            Some(count) if *count > 0 => {
                let busy = *count;
                *count -= 1;
                busy
            }
            _ => 0,
        }
    }

    fn manager_status(&self) -> VmManagerStatus {
        let mut state = self.lock();
        let write_status = state.pending.values().sum();
        for count in state.pending.values_mut() {
            *count = count.saturating_sub(1);
        }
        state.pending.retain(|_, count| *count > 0);
        VmManagerStatus {
            backend: "mock".to_string(),
            host_os: HostOs::current(),
            write_status,
            known_vms: state.vms.len(),
            last_error: state.last_error.clone(),
        }
    }

    fn vm_info(&self, vm: &str) -> Option<VmInfo> {
        self.lock().vms.get(vm).cloned()
    }

    fn list_vms(&self) -> Vec<VmInfo> {
        self.lock().vms.values().cloned().collect()
    }

    fn take_fault(&self, vm: &str) -> Option<String> {
        self.lock().faults.remove(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(template: &str, clone: &str) -> CloneSpec {
        CloneSpec {
            template: template.into(),
            clone: clone.into(),
            linked: false,
            base_snapshot: None,
            group: "g".into(),
            internal_networks: vec![],
            vrdp_port: Some(5000),
        }
    }

    #[test]
    fn test_busy_for_configured_polls() {
        let mock = MockHypervisor::new()
            .with_busy_polls(3)
            .with_vm("a", VmState::Stopped);
        mock.start("a").unwrap();

        assert_eq!(mock.pending_writes("a"), 3);
        assert_eq!(mock.pending_writes("a"), 2);
        assert_eq!(mock.pending_writes("a"), 1);
        assert_eq!(mock.pending_writes("a"), 0);
        assert_eq!(mock.pending_queries(), 4);
    }

    #[test]
    fn test_clone_requires_template() {
        let mock = MockHypervisor::new();
        mock.clone_vm(&spec("missing", "c")).unwrap();
        assert!(mock.take_fault("c").unwrap().contains("template not found"));
        assert!(mock.vm_info("c").is_none());
    }

    #[test]
    fn test_lifecycle_effects() {
        let mock = MockHypervisor::new().with_vm("t", VmState::Stopped);
        mock.clone_vm(&spec("t", "c")).unwrap();
        mock.configure_vm(&spec("t", "c")).unwrap();
        mock.start("c").unwrap();
        mock.snapshot("c", "s1").unwrap();

        let info = mock.vm_info("c").unwrap();
        assert_eq!(info.state, VmState::Running);
        assert_eq!(info.vrdp_port, Some(5000));
        assert_eq!(info.current_snapshot.as_deref(), Some("s1"));

        mock.remove("c").unwrap();
        assert!(mock.vm_info("c").is_none());
        assert_eq!(mock.calls().len(), 5);
    }

    #[test]
    fn test_injected_fault() {
        let mock = MockHypervisor::new().with_vm("a", VmState::Stopped);
        mock.fail_on("a", WriteKind::Start);
        mock.start("a").unwrap();

        assert!(mock.take_fault("a").is_some());
        assert_eq!(mock.state_of("a"), Some(VmState::Stopped));
        assert!(mock.manager_status().last_error.is_some());
    }

    #[test]
    fn test_manager_status_ticks_down() {
        let mock = MockHypervisor::new()
            .with_busy_polls(2)
            .with_vm("a", VmState::Stopped);
        mock.start("a").unwrap();

        assert_eq!(mock.manager_status().write_status, 2);
        assert_eq!(mock.manager_status().write_status, 1);
        assert!(mock.manager_status().is_idle());
    }
}
