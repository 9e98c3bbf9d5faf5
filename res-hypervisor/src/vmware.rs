//! VMware Workstation/Fusion dialect, driven through `vmrun` and `ovftool`.
//!
//! VMware addresses VMs by `.vmx` path. Every VM lives in
//! `<vm_directory>/<name>/<name>.vmx`, so names map to paths directly.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;
use which::which;

use crate::cli::Dialect;
use crate::error::{HypervisorError, Result};
use crate::runner::{self, Invocation};
use crate::{HostOs, VmInfo, VmState, WriteOp};

const WINDOWS_VMRUN: &str = r"C:\Program Files (x86)\VMware\VMware Workstation\vmrun.exe";
const WINDOWS_OVFTOOL: &str = r"C:\Program Files (x86)\VMware\VMware Workstation\OVFTool\ovftool.exe";
const MACOS_VMRUN: &str = "/Applications/VMware Fusion.app/Contents/Library/vmrun";
const MACOS_OVFTOOL: &str = "/Applications/VMware Fusion.app/Contents/Library/VMware OVF Tool/ovftool";

#[derive(Debug, Clone)]
pub struct VmRun {
    vmrun: PathBuf,
    ovftool: PathBuf,
    vm_directory: PathBuf,
    /// `ws` for Workstation, `fusion` on macOS.
    host_type: &'static str,
}

fn find_tool(name: &str, host: HostOs, windows: &str, macos: &str) -> Option<PathBuf> {
    if let Ok(path) = which(name) {
        return Some(path);
    }
    let fallback = match host {
        HostOs::Windows => Path::new(windows),
        HostOs::MacOs => Path::new(macos),
        HostOs::Linux => return None,
    };
    fallback.exists().then(|| fallback.to_path_buf())
}

impl VmRun {
    pub fn new(vmrun: impl Into<PathBuf>, ovftool: impl Into<PathBuf>, vm_directory: impl Into<PathBuf>, host: HostOs) -> Self {
        Self {
            vmrun: vmrun.into(),
            ovftool: ovftool.into(),
            vm_directory: vm_directory.into(),
            host_type: if host == HostOs::MacOs { "fusion" } else { "ws" },
        }
    }

    pub fn locate(host: HostOs, configured: Option<&Path>, vm_directory: Option<&Path>) -> Result<Self> {
        let vmrun = match configured {
            Some(path) if path.exists() => path.to_path_buf(),
            Some(path) => return Err(HypervisorError::Dependency(path.display().to_string())),
            None => find_tool("vmrun", host, WINDOWS_VMRUN, MACOS_VMRUN)
                .ok_or_else(|| HypervisorError::Dependency("vmrun".to_string()))?,
        };
        // ovftool is only needed for import/export; fall back to PATH lookup at run time.
        let ovftool = find_tool("ovftool", host, WINDOWS_OVFTOOL, MACOS_OVFTOOL)
            .unwrap_or_else(|| PathBuf::from("ovftool"));
        let vm_directory = match vm_directory {
            Some(dir) => dir.to_path_buf(),
            None => dirs::home_dir()
                .map(|home| home.join("vmware"))
                .ok_or_else(|| HypervisorError::Dependency("VMware VM directory".to_string()))?,
        };
        Ok(Self::new(vmrun, ovftool, vm_directory, host))
    }

    pub fn vmx_path(&self, vm: &str) -> PathBuf {
        self.vm_directory.join(vm).join(format!("{vm}.vmx"))
    }

    fn vmrun<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec!["-T".to_string(), self.host_type.to_string()];
        all.extend(args.into_iter().map(Into::into));
        Invocation::new(self.vmrun.clone(), all)
    }

    fn vmx(&self, vm: &str) -> String {
        self.vmx_path(vm).display().to_string()
    }
}

impl Dialect for VmRun {
    fn name(&self) -> &'static str {
        "vmware"
    }

    fn plan(&self, vm: &str, op: &WriteOp, cached: Option<&VmInfo>) -> Result<Vec<Invocation>> {
        let vmx = self.vmx(vm);
        let steps = match op {
            WriteOp::Clone(spec) => {
                let mut args = vec![
                    "clone".to_string(),
                    self.vmx(&spec.template),
                    self.vmx(&spec.clone),
                ];
                match (spec.linked, spec.base_snapshot.as_ref()) {
                    (true, Some(base)) => {
                        args.push("linked".to_string());
                        args.push(format!("-snapshot={base}"));
                    }
                    _ => args.push("full".to_string()),
                }
                args.push(format!("-cloneName={}", spec.clone));
                vec![self.vmrun(args)]
            }
            // vmrun has no settings editor; networks and VNC ports come from the template.
            WriteOp::Configure(_) => Vec::new(),
            WriteOp::Start => vec![self.vmrun(["start".to_string(), vmx, "nogui".to_string()])],
            WriteOp::Stop => vec![self.vmrun(["stop".to_string(), vmx, "hard".to_string()])],
            WriteOp::Suspend => vec![self.vmrun(["suspend".to_string(), vmx])],
            WriteOp::Pause => vec![self.vmrun(["pause".to_string(), vmx])],
            WriteOp::Snapshot(name) => {
                vec![self.vmrun(["snapshot".to_string(), vmx, name.clone()])]
            }
            WriteOp::RestoreSnapshot => {
                let snapshot = cached
                    .and_then(|info| info.current_snapshot.clone().or_else(|| info.snapshots.last().cloned()))
                    .ok_or_else(|| {
                        HypervisorError::CommandFailed(format!(
                            "no known snapshot for {vm}; refresh it first"
                        ))
                    })?;
                vec![self.vmrun(["revertToSnapshot".to_string(), vmx, snapshot])]
            }
            WriteOp::Remove => vec![self.vmrun(["deleteVM".to_string(), vmx])],
            WriteOp::Guest(command) => {
                let mut args = Vec::new();
                if let Some(user) = &command.username {
                    args.extend(["-gu".to_string(), user.clone()]);
                }
                if let Some(password) = &command.password {
                    args.extend(["-gp".to_string(), password.clone()]);
                }
                args.extend(["runProgramInGuest".to_string(), vmx, command.executable.clone()]);
                args.extend(command.args.iter().cloned());
                vec![self.vmrun(args)]
            }
            WriteOp::Import(path) => vec![Invocation::new(
                self.ovftool.clone(),
                [
                    "--lax".to_string(),
                    path.display().to_string(),
                    self.vm_directory.display().to_string(),
                ],
            )],
            WriteOp::Export(path) => vec![Invocation::new(
                self.ovftool.clone(),
                [vmx, path.display().to_string()],
            )],
            WriteOp::Refresh => Vec::new(),
        };
        Ok(steps)
    }

    fn inspect(&self, vm: &str) -> Result<VmInfo> {
        let vmx_path = self.vmx_path(vm);
        if !vmx_path.exists() {
            debug!(vm = %vm, path = %vmx_path.display(), "No .vmx file");
            return Ok(VmInfo::missing(vm));
        }

        let running = runner::run_checked(&self.vmrun(["list"]))?;
        let mut info = VmInfo::new(vm, VmState::Stopped);
        if running
            .stdout
            .lines()
            .any(|line| Path::new(line.trim()) == vmx_path.as_path())
        {
            info.state = VmState::Running;
        } else if has_suspend_file(&vmx_path) {
            info.state = VmState::Suspended;
        }

        let snapshots = runner::run(&self.vmrun(["listSnapshots".to_string(), self.vmx(vm)]))?;
        if snapshots.success {
            info.snapshots = parse_snapshot_list(&snapshots.stdout);
            info.current_snapshot = info.snapshots.last().cloned();
        }
        info.refreshed_at = Some(Utc::now());
        Ok(info)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.vm_directory)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().join(format!("{name}.vmx")).exists() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn has_suspend_file(vmx_path: &Path) -> bool {
    let Some(dir) = vmx_path.parent() else {
        return false;
    };
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|entry| entry.path().extension().is_some_and(|ext| ext == "vmss"))
        })
        .unwrap_or(false)
}

/// Parse `listSnapshots` output. The first line is a `Total snapshots: N` header.
pub fn parse_snapshot_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|line| !line.starts_with("Total snapshots"))
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
