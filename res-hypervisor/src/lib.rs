//! Hypervisor backend abstraction library.
//!
//! This library provides a single [`Hypervisor`] interface over the hypervisor
//! products the engine can drive (VirtualBox and VMware, on Unix-like and
//! Windows hosts). Writes are *issued*, not awaited: a backend accepts the
//! write, performs it in the background, and reports progress through
//! [`Hypervisor::pending_writes`] and [`Hypervisor::manager_status`]. Callers
//! observe completion by polling those accessors.

// Standard library
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// External crates
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cli;
pub mod error;
pub mod runner;
pub mod tracker;
pub mod vbox;
pub mod vmware;

// When the `test-helpers` feature is enabled, include the mock backend.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use error::{HypervisorError, Result};
pub use tracker::{WriteGuard, WriteTracker};

/// State of a VM as last observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    #[default]
    Unknown,
    Stopped,
    Running,
    Suspended,
    Paused,
    Saved,
    Missing,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Unknown => "unknown",
            VmState::Stopped => "stopped",
            VmState::Running => "running",
            VmState::Suspended => "suspended",
            VmState::Paused => "paused",
            VmState::Saved => "saved",
            VmState::Missing => "missing",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed information about a single VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub snapshots: Vec<String>,
    pub current_snapshot: Option<String>,
    pub vrdp_port: Option<u16>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl VmInfo {
    pub fn new(name: impl Into<String>, state: VmState) -> Self {
        Self {
            name: name.into(),
            state,
            snapshots: Vec::new(),
            current_snapshot: None,
            vrdp_port: None,
            refreshed_at: None,
        }
    }

    /// Info for a VM the backend reported as not existing.
    pub fn missing(name: impl Into<String>) -> Self {
        let mut info = Self::new(name, VmState::Missing);
        info.refreshed_at = Some(Utc::now());
        info
    }
}

/// Snapshot of the backend's own health and activity.
#[derive(Debug, Clone, Serialize)]
pub struct VmManagerStatus {
    pub backend: String,
    pub host_os: HostOs,
    /// Number of writes issued but not yet observed complete. Zero means idle.
    pub write_status: usize,
    pub known_vms: usize,
    pub last_error: Option<String>,
}

impl VmManagerStatus {
    pub fn is_idle(&self) -> bool {
        self.write_status == 0
    }
}

/// Everything a backend needs to clone and wire up one experiment instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    pub template: String,
    pub clone: String,
    /// Produce a linked clone from `base_snapshot` instead of a full copy.
    pub linked: bool,
    pub base_snapshot: Option<String>,
    /// Hypervisor-side group the clone is filed under.
    pub group: String,
    pub internal_networks: Vec<String>,
    pub vrdp_port: Option<u16>,
}

/// A program to run inside a guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCommand {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl GuestCommand {
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, self.args.join(" "))
        }
    }
}

/// One hypervisor write, as issued against a single VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Clone(CloneSpec),
    Configure(CloneSpec),
    Start,
    Stop,
    Suspend,
    Pause,
    Snapshot(String),
    RestoreSnapshot,
    Remove,
    Guest(GuestCommand),
    Import(PathBuf),
    Export(PathBuf),
    Refresh,
}

impl WriteOp {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteOp::Clone(_) => WriteKind::Clone,
            WriteOp::Configure(_) => WriteKind::Configure,
            WriteOp::Start => WriteKind::Start,
            WriteOp::Stop => WriteKind::Stop,
            WriteOp::Suspend => WriteKind::Suspend,
            WriteOp::Pause => WriteKind::Pause,
            WriteOp::Snapshot(_) => WriteKind::Snapshot,
            WriteOp::RestoreSnapshot => WriteKind::Restore,
            WriteOp::Remove => WriteKind::Remove,
            WriteOp::Guest(_) => WriteKind::Guest,
            WriteOp::Import(_) => WriteKind::Import,
            WriteOp::Export(_) => WriteKind::Export,
            WriteOp::Refresh => WriteKind::Refresh,
        }
    }

    /// State the VM is expected to be in once this write succeeds.
    pub fn expected_state(&self) -> Option<VmState> {
        match self {
            WriteOp::Clone(_) | WriteOp::Stop | WriteOp::Import(_) => Some(VmState::Stopped),
            WriteOp::Start => Some(VmState::Running),
            WriteOp::Suspend => Some(VmState::Saved),
            WriteOp::Pause => Some(VmState::Paused),
            _ => None,
        }
    }
}

/// Payload-free discriminant of [`WriteOp`], used for logging and call records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Clone,
    Configure,
    Start,
    Stop,
    Suspend,
    Pause,
    Snapshot,
    Restore,
    Remove,
    Guest,
    Import,
    Export,
    Refresh,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WriteKind::Clone => "clone",
            WriteKind::Configure => "configure",
            WriteKind::Start => "start",
            WriteKind::Stop => "stop",
            WriteKind::Suspend => "suspend",
            WriteKind::Pause => "pause",
            WriteKind::Snapshot => "snapshot",
            WriteKind::Restore => "restore",
            WriteKind::Remove => "remove",
            WriteKind::Guest => "guest",
            WriteKind::Import => "import",
            WriteKind::Export => "export",
            WriteKind::Refresh => "refresh",
        };
        f.write_str(label)
    }
}

/// Host operating system family a backend runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else if cfg!(target_os = "macos") {
            HostOs::MacOs
        } else {
            HostOs::Linux
        }
    }
}

/// Which hypervisor product the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HypervisorKind {
    #[default]
    #[serde(rename = "vbox", alias = "VBOX", alias = "virtualbox")]
    VirtualBox,
    #[serde(rename = "vmware", alias = "VMWARE")]
    Vmware,
    #[serde(rename = "mock")]
    Mock,
}

impl std::str::FromStr for HypervisorKind {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vbox" | "virtualbox" => Ok(HypervisorKind::VirtualBox),
            "vmware" => Ok(HypervisorKind::Vmware),
            "mock" => Ok(HypervisorKind::Mock),
            other => Err(HypervisorError::UnknownBackend(other.to_string())),
        }
    }
}

/// Backend selection and tool locations, as read from the engine config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorSettings {
    pub active: HypervisorKind,
    /// Path to `VBoxManage`/`vmrun`; discovered from well-known locations when unset.
    pub executable: Option<PathBuf>,
    /// Directory holding VMware VM folders. Unused by VirtualBox.
    pub vm_directory: Option<PathBuf>,
}

/// The capability set every hypervisor backend provides.
///
/// Write methods return as soon as the write is accepted. `Err` means the write
/// could not be issued at all; a failure while the write runs is reported by
/// [`Hypervisor::take_fault`] once [`Hypervisor::pending_writes`] drops to zero.
pub trait Hypervisor: Send + Sync {
    /// Get the name of the backend (e.g., "vbox", "vmware").
    fn name(&self) -> &'static str;

    fn host_os(&self) -> HostOs {
        HostOs::current()
    }

    /// Clone a template into a new, registered VM.
    fn clone_vm(&self, spec: &CloneSpec) -> Result<()>;

    /// Apply networking and remote-display settings to a clone.
    fn configure_vm(&self, spec: &CloneSpec) -> Result<()>;

    /// Start a VM headless.
    fn start(&self, vm: &str) -> Result<()>;

    /// Power a VM off.
    fn stop(&self, vm: &str) -> Result<()>;

    /// Save the VM's state to disk and stop it.
    fn suspend(&self, vm: &str) -> Result<()>;

    fn pause(&self, vm: &str) -> Result<()>;

    fn snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;

    /// Restore the VM's current snapshot.
    fn restore_snapshot(&self, vm: &str) -> Result<()>;

    /// Unregister a VM and delete its files.
    fn remove(&self, vm: &str) -> Result<()>;

    /// Run a program inside the guest. Requires guest additions/tools.
    fn run_guest(&self, vm: &str, command: &GuestCommand) -> Result<()>;

    /// Import an appliance file as a new VM.
    fn import_vm(&self, appliance: &Path) -> Result<()>;

    /// Export a VM to an appliance file.
    fn export_vm(&self, vm: &str, destination: &Path) -> Result<()>;

    /// Re-read one VM's information into the backend's cache.
    fn refresh_vm(&self, vm: &str) -> Result<()>;

    /// Re-read every VM the hypervisor knows about.
    fn refresh_all(&self) -> Result<()>;

    /// Number of writes still in flight for `vm`. Cheap; never blocks on a write.
    fn pending_writes(&self, vm: &str) -> usize;

    /// Overall backend status. Cheap; never blocks on a write.
    fn manager_status(&self) -> VmManagerStatus;

    /// Cached information about one VM, if the backend has seen it.
    fn vm_info(&self, vm: &str) -> Option<VmInfo>;

    /// Cached information about every VM the backend has seen.
    fn list_vms(&self) -> Vec<VmInfo>;

    /// Take the fault recorded by the most recent completed write on `vm`.
    fn take_fault(&self, vm: &str) -> Option<String>;

    /// Issue any [`WriteOp`] through the matching capability.
    fn issue(&self, vm: &str, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Clone(spec) => self.clone_vm(spec),
            WriteOp::Configure(spec) => self.configure_vm(spec),
            WriteOp::Start => self.start(vm),
            WriteOp::Stop => self.stop(vm),
            WriteOp::Suspend => self.suspend(vm),
            WriteOp::Pause => self.pause(vm),
            WriteOp::Snapshot(name) => self.snapshot(vm, name),
            WriteOp::RestoreSnapshot => self.restore_snapshot(vm),
            WriteOp::Remove => self.remove(vm),
            WriteOp::Guest(command) => self.run_guest(vm, command),
            WriteOp::Import(path) => self.import_vm(path),
            WriteOp::Export(path) => self.export_vm(vm, path),
            WriteOp::Refresh => self.refresh_vm(vm),
        }
    }
}

/// Creates the backend selected by `settings` for the current host.
///
/// Selection happens once, at engine construction; nothing else in the
/// workspace branches on hypervisor product or host OS.
pub fn get_hypervisor(settings: &HypervisorSettings) -> Result<Arc<dyn Hypervisor>> {
    let host = HostOs::current();
    match settings.active {
        HypervisorKind::VirtualBox => {
            let dialect = vbox::VBoxManage::locate(host, settings.executable.as_deref())?;
            Ok(Arc::new(cli::CliHypervisor::new(dialect, host)))
        }
        HypervisorKind::Vmware => {
            let dialect = vmware::VmRun::locate(
                host,
                settings.executable.as_deref(),
                settings.vm_directory.as_deref(),
            )?;
            Ok(Arc::new(cli::CliHypervisor::new(dialect, host)))
        }
        #[cfg(any(test, feature = "test-helpers"))]
        HypervisorKind::Mock => Ok(Arc::new(mock::MockHypervisor::new())),
        #[cfg(not(any(test, feature = "test-helpers")))]
        HypervisorKind::Mock => Err(HypervisorError::UnknownBackend(
            "mock (build with the test-helpers feature)".to_string(),
        )),
    }
}
