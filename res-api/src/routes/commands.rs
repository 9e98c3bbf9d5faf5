use std::path::Path;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{extract::State, routing::post, Json, Router};
use res_engine::{quote_arg, CommandOutput};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

pub fn routes() -> Router<AppState> {
    Router::new().route("/run_command", post(run_command))
}

#[derive(Debug, Deserialize, Serialize, Default)]
pub struct RunCommandRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub configname: Option<String>,
    pub command: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RunCommandResponse {
    pub output: String,
}

/// What a user may do to their own VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserCommand {
    Start,
    Stop,
    Restore,
    Status,
}

impl UserCommand {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(UserCommand::Start),
            "stop" => Some(UserCommand::Stop),
            "restore" => Some(UserCommand::Restore),
            "status" => Some(UserCommand::Status),
            _ => None,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            UserCommand::Start => "start",
            UserCommand::Stop => "stop",
            UserCommand::Restore => "restore",
            UserCommand::Status => "status",
        }
    }
}

async fn run_command(
    State(state): State<AppState>,
    Json(req): Json<RunCommandRequest>,
) -> ApiResult<Json<RunCommandResponse>> {
    let configname = req
        .configname
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("No Scenario Name Provided".to_string()))?;
    let raw_command = req.command.unwrap_or_default();
    let command = UserCommand::parse(&raw_command)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown command `{raw_command}`")))?;

    wait_for_idle(&state).await?;

    let connections = state.engine.generate_users_conns(&configname).await?;
    let username = req.username.unwrap_or_default();
    let password = req.password.unwrap_or_default();
    let clones: Vec<String> = connections
        .lookup(&username, &password)
        .map(|user| user.instances.iter().map(|i| i.clone.clone()).collect())
        .ok_or_else(|| ApiError::Forbidden("Invalid username or password".to_string()))?;

    info!(user = %username, vms = ?clones, command = command.verb(), "Running user command");

    let mut lines = Vec::with_capacity(clones.len());
    let mut failed = false;
    for clone in &clones {
        if command == UserCommand::Status {
            lines.push(vm_status(&state, clone).await?);
            continue;
        }
        let line = format!(
            "experiment {} {} vm {}",
            command.verb(),
            quote_arg(&configname),
            quote_arg(clone)
        );
        match state.engine.execute(&line).await? {
            CommandOutput::Fleet(report) => {
                failed |= report.failed() > 0;
                lines.push(report.to_text());
            }
            other => lines.push(other.to_text()),
        }
        wait_for_idle(&state).await?;
    }

    let output = lines.join("\n");
    if failed {
        return Err(ApiError::Internal(output));
    }
    Ok(Json(RunCommandResponse { output }))
}

/// Refresh one VM, wait for the refresh to land, then describe it.
async fn vm_status(state: &AppState, clone: &str) -> ApiResult<String> {
    state
        .engine
        .execute(&format!("vm-manage refresh {}", quote_arg(clone)))
        .await?;
    wait_for_idle(state).await?;

    let output = state
        .engine
        .execute(&format!("vm-manage vmstatus {}", quote_arg(clone)))
        .await?;
    let name = status_field(&output, "name");
    let vm_state = status_field(&output, "state");
    match (name, vm_state) {
        (Some(name), Some(vm_state)) => {
            let short = Path::new(&name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(name);
            Ok(format!("VM: {short}\nStatus: {vm_state}"))
        }
        _ => Err(ApiError::Internal("Error Querying VM State".to_string())),
    }
}

fn status_field(output: &CommandOutput, key: &str) -> Option<String> {
    let CommandOutput::Status(map) = output else {
        return None;
    };
    match map.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Poll `vm-manage mgrstatus` until the hypervisor has no write in flight.
async fn wait_for_idle(state: &AppState) -> ApiResult<()> {
    let started = Instant::now();
    loop {
        let status = state.engine.execute("vm-manage mgrstatus").await?;
        let pending = match &status {
            CommandOutput::Status(map) => map.get("write_status").and_then(Value::as_u64),
            _ => None,
        }
        .ok_or_else(|| ApiError::Internal("Hypervisor status has no write_status".to_string()))?;
        if pending == 0 {
            return Ok(());
        }
        if started.elapsed() >= state.idle_timeout {
            return Err(ApiError::Internal(format!(
                "Hypervisor still busy after {}s ({pending} writes pending)",
                state.idle_timeout.as_secs()
            )));
        }
        debug!(pending, "Waiting for the hypervisor to go idle");
        sleep(state.poll_interval).await;
    }
}
