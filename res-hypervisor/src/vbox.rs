//! VirtualBox dialect, driven through `VBoxManage`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use regex::Regex;
use tracing::debug;
use which::which;

use crate::cli::Dialect;
use crate::error::{HypervisorError, Result};
use crate::runner::{self, Invocation};
use crate::{HostOs, VmInfo, VmState, WriteOp};

const WINDOWS_DEFAULT: &str = r"C:\Program Files\Oracle\VirtualBox\VBoxManage.exe";

#[derive(Debug, Clone)]
pub struct VBoxManage {
    program: PathBuf,
}

impl VBoxManage {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find `VBoxManage` for `host`, preferring an explicitly configured path.
    pub fn locate(host: HostOs, configured: Option<&Path>) -> Result<Self> {
        if let Some(path) = configured {
            return if path.exists() {
                Ok(Self::new(path))
            } else {
                Err(HypervisorError::Dependency(path.display().to_string()))
            };
        }
        if let Ok(path) = which("VBoxManage") {
            return Ok(Self::new(path));
        }
        if host == HostOs::Windows && Path::new(WINDOWS_DEFAULT).exists() {
            return Ok(Self::new(WINDOWS_DEFAULT));
        }
        Err(HypervisorError::Dependency("VBoxManage".to_string()))
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(self.program.clone(), args)
    }
}

impl Dialect for VBoxManage {
    fn name(&self) -> &'static str {
        "vbox"
    }

    fn plan(&self, vm: &str, op: &WriteOp, _cached: Option<&VmInfo>) -> Result<Vec<Invocation>> {
        let steps = match op {
            WriteOp::Clone(spec) => {
                let mut args = vec![
                    "clonevm".to_string(),
                    spec.template.clone(),
                    "--name".to_string(),
                    spec.clone.clone(),
                    "--register".to_string(),
                    "--groups".to_string(),
                    format!("/{}", spec.group),
                ];
                if let (true, Some(base)) = (spec.linked, spec.base_snapshot.as_ref()) {
                    args.extend([
                        "--snapshot".to_string(),
                        base.clone(),
                        "--options".to_string(),
                        "link".to_string(),
                    ]);
                }
                vec![self.invocation(args)]
            }
            WriteOp::Configure(spec) => {
                let mut args = vec!["modifyvm".to_string(), spec.clone.clone()];
                for (index, network) in spec.internal_networks.iter().enumerate() {
                    args.push(format!("--intnet{}", index + 1));
                    args.push(network.clone());
                }
                if let Some(port) = spec.vrdp_port {
                    args.extend([
                        "--vrde".to_string(),
                        "on".to_string(),
                        "--vrdeport".to_string(),
                        port.to_string(),
                    ]);
                }
                if args.len() == 2 {
                    Vec::new()
                } else {
                    vec![self.invocation(args)]
                }
            }
            WriteOp::Start => vec![self.invocation(["startvm", vm, "--type", "headless"])],
            WriteOp::Stop => vec![self.invocation(["controlvm", vm, "poweroff"])],
            WriteOp::Suspend => vec![self.invocation(["controlvm", vm, "savestate"])],
            WriteOp::Pause => vec![self.invocation(["controlvm", vm, "pause"])],
            WriteOp::Snapshot(name) => {
                vec![self.invocation(["snapshot", vm, "take", name.as_str()])]
            }
            WriteOp::RestoreSnapshot => vec![self.invocation(["snapshot", vm, "restorecurrent"])],
            WriteOp::Remove => vec![self.invocation(["unregistervm", vm, "--delete"])],
            WriteOp::Guest(command) => {
                let mut args = vec![
                    "guestcontrol".to_string(),
                    vm.to_string(),
                    "run".to_string(),
                    "--exe".to_string(),
                    command.executable.clone(),
                ];
                if let Some(user) = &command.username {
                    args.extend(["--username".to_string(), user.clone()]);
                }
                if let Some(password) = &command.password {
                    args.extend(["--password".to_string(), password.clone()]);
                }
                args.push("--".to_string());
                args.push(command.executable.clone());
                args.extend(command.args.iter().cloned());
                vec![self.invocation(args)]
            }
            WriteOp::Import(path) => {
                vec![self.invocation(["import".to_string(), path.display().to_string()])]
            }
            WriteOp::Export(path) => vec![self.invocation([
                "export".to_string(),
                vm.to_string(),
                "-o".to_string(),
                path.display().to_string(),
            ])],
            WriteOp::Refresh => Vec::new(),
        };
        Ok(steps)
    }

    fn inspect(&self, vm: &str) -> Result<VmInfo> {
        let output = runner::run(&self.invocation(["showvminfo", vm, "--machinereadable"]))?;
        if !output.success {
            if is_not_found(&output.stderr) {
                debug!(vm = %vm, "VirtualBox does not know this VM");
                return Ok(VmInfo::missing(vm));
            }
            return Err(HypervisorError::CommandFailed(format!(
                "showvminfo {vm}: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_machine_readable(vm, &output.stdout))
    }

    fn list(&self) -> Result<Vec<String>> {
        let output = runner::run_checked(&self.invocation(["list", "vms"]))?;
        Ok(parse_vm_list(&output.stdout))
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("VBOX_E_OBJECT_NOT_FOUND") || stderr.contains("Could not find a registered machine")
}

fn map_state(raw: &str) -> VmState {
    match raw {
        "poweroff" | "aborted" | "aborted-saved" => VmState::Stopped,
        "running" => VmState::Running,
        "saved" => VmState::Saved,
        "paused" => VmState::Paused,
        _ => VmState::Unknown,
    }
}

/// Parse `showvminfo --machinereadable` output.
pub fn parse_machine_readable(vm: &str, stdout: &str) -> VmInfo {
    let mut info = VmInfo::new(vm, VmState::Unknown);
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "VMState" => info.state = map_state(value),
            "CurrentSnapshotName" => info.current_snapshot = Some(value.to_string()),
            "vrdeport" => info.vrdp_port = value.parse().ok(),
            key if key.starts_with("SnapshotName") => info.snapshots.push(value.to_string()),
            _ => {}
        }
    }
    info.refreshed_at = Some(Utc::now());
    info
}

/// Parse `list vms` output: `"name" {uuid}` per line.
pub fn parse_vm_list(stdout: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(r#"^"(.+)"\s+\{[0-9a-fA-F-]+\}$"#) else {
        return Vec::new();
    };
    stdout
        .lines()
        .filter_map(|line| pattern.captures(line.trim()))
        .map(|captures| captures[1].to_string())
        .collect()
}
