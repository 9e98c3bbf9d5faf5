//! Structured command results.

use std::collections::BTreeMap;

use res_hypervisor::WriteKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, ErrorKind};

/// What a successful `execute` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CommandOutput {
    /// Field name to value, for status-style commands.
    Status(BTreeMap<String, Value>),
    /// Per-instance outcomes of a lifecycle fan-out.
    Fleet(FleetReport),
    Message(String),
}

impl CommandOutput {
    pub fn message(text: impl Into<String>) -> Self {
        CommandOutput::Message(text.into())
    }

    /// Build a status map from any serializable value with named fields.
    pub fn status_of<T: Serialize>(value: &T) -> Self {
        let map = match serde_json::to_value(value) {
            Ok(Value::Object(fields)) => fields.into_iter().collect(),
            Ok(other) => BTreeMap::from([("value".to_string(), other)]),
            Err(e) => BTreeMap::from([("error".to_string(), Value::String(e.to_string()))]),
        };
        CommandOutput::Status(map)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CommandOutput::Status(_) => "status",
            CommandOutput::Fleet(_) => "fleet",
            CommandOutput::Message(_) => "message",
        }
    }

    /// Plain-text rendering, one line per instance for fleet results.
    pub fn to_text(&self) -> String {
        match self {
            CommandOutput::Status(map) => map
                .iter()
                .map(|(key, value)| match value {
                    Value::String(s) => format!("{key}: {s}"),
                    other => format!("{key}: {other}"),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            CommandOutput::Fleet(report) => report.to_text(),
            CommandOutput::Message(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { detail: String },
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub instance: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl InstanceOutcome {
    pub fn succeeded(instance: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            outcome: Outcome::Succeeded {
                detail: detail.into(),
            },
        }
    }

    pub fn failed(instance: impl Into<String>, error: &EngineError) -> Self {
        Self {
            instance: instance.into(),
            outcome: Outcome::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn to_line(&self) -> String {
        match &self.outcome {
            Outcome::Succeeded { detail } => format!("{}: {detail}", self.instance),
            Outcome::Failed { kind, message } => {
                format!("{}: failed ({kind:?}) {message}", self.instance)
            }
        }
    }
}

/// Result of one fan-out. Always holds one entry per selected instance, in
/// declared order, whether or not the instance succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetReport {
    pub command: String,
    pub config: String,
    pub instances: Vec<InstanceOutcome>,
}

impl FleetReport {
    pub fn new(command: impl Into<String>, config: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            config: config.into(),
            instances: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.instances.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.instances.len() - self.succeeded()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, instance: &str) -> Option<&InstanceOutcome> {
        self.instances.iter().find(|o| o.instance == instance)
    }

    pub fn to_text(&self) -> String {
        if self.instances.is_empty() {
            return format!("{} {}: no instances selected", self.command, self.config);
        }
        self.instances
            .iter()
            .map(InstanceOutcome::to_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Progress of a running fan-out, for callers that want more than the final report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    InstanceStarted { instance: String },
    WriteIssued { instance: String, write: WriteKind },
    InstanceFinished { instance: String, succeeded: bool },
}

pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Optional progress sink. Events sent after the receiver is gone are dropped.
#[derive(Debug, Clone, Default)]
pub struct Progress(Option<ProgressSender>);

impl Progress {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn to(sender: ProgressSender) -> Self {
        Self(Some(sender))
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_text_one_line_per_instance() {
        let mut report = FleetReport::new("start", "lab1");
        report.instances.push(InstanceOutcome::succeeded("lab1-win10-1", "running"));
        report.instances.push(InstanceOutcome::failed(
            "lab1-win10-2",
            &EngineError::BackendFault("start lab1-win10-2: locked".into()),
        ));

        let text = report.to_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "lab1-win10-1: running");
        assert!(lines[1].starts_with("lab1-win10-2: failed (BackendFault)"));
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
    }

    #[test]
    fn test_empty_report_text() {
        let report = FleetReport::new("stop", "lab1");
        assert_eq!(report.to_text(), "stop lab1: no instances selected");
    }

    #[test]
    fn test_output_serializes_with_type_tag() {
        let output = CommandOutput::message("Completed");
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["data"], "Completed");
    }

    #[test]
    fn test_status_of_struct() {
        #[derive(Serialize)]
        struct S {
            write_status: usize,
        }
        let output = CommandOutput::status_of(&S { write_status: 2 });
        assert_eq!(output.to_text(), "write_status: 2");
    }
}
