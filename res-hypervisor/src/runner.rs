// Standard library
use std::path::PathBuf;

// External crates
use duct::cmd;
use tracing::{debug, trace};

use crate::error::{HypervisorError, Result};

/// A single hypervisor tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Human readable form for logs and fault messages.
    pub fn display(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string());
        if self.args.is_empty() {
            program
        } else {
            format!("{program} {}", self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run an invocation to completion, capturing both streams.
///
/// A non-zero exit status is not an error here; callers inspect `success`.
pub fn run(invocation: &Invocation) -> Result<CommandOutput> {
    trace!(command = %invocation.display(), "Running hypervisor tool");
    let output = cmd(&invocation.program, &invocation.args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run an invocation and turn a non-zero exit into [`HypervisorError::CommandFailed`].
pub fn run_checked(invocation: &Invocation) -> Result<CommandOutput> {
    let output = run(invocation)?;
    if output.success {
        debug!(command = %invocation.display(), "Hypervisor tool succeeded");
        Ok(output)
    } else {
        let detail = output.stderr.trim();
        let detail = if detail.is_empty() {
            output.stdout.trim()
        } else {
            detail
        };
        Err(HypervisorError::CommandFailed(format!(
            "`{}` failed: {}",
            invocation.display(),
            detail
        )))
    }
}
