//! Per-manager status snapshots.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationOutcome {
    Succeeded,
    /// Some instances failed, some did not.
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastOperation {
    pub name: String,
    pub outcome: OperationOutcome,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStatus {
    pub manager: String,
    pub health: Health,
    /// In-flight operations of this manager plus any backend writes it depends on.
    pub write_status: usize,
    pub pending: bool,
    pub last_operation: Option<LastOperation>,
}

/// Tracks in-flight operations and the last outcome for one manager.
#[derive(Debug)]
pub struct StatusTracker {
    manager: &'static str,
    in_flight: AtomicUsize,
    last: Mutex<Option<LastOperation>>,
}

impl StatusTracker {
    pub fn new(manager: &'static str) -> Self {
        Self {
            manager,
            in_flight: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn begin(&self, name: impl Into<String>) -> OperationGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            tracker: self,
            name: name.into(),
            recorded: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, name: String, outcome: OperationOutcome, detail: String) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(LastOperation {
            name,
            outcome,
            detail,
            at: Utc::now(),
        });
    }

    /// Current snapshot. `backend_pending` is added to this manager's own count.
    pub fn snapshot(&self, backend_pending: usize) -> ManagerStatus {
        let last = self
            .last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let health = match last.as_ref().map(|op| op.outcome) {
            Some(OperationOutcome::Failed) | Some(OperationOutcome::Partial) => Health::Degraded,
            _ => Health::Healthy,
        };
        let write_status = self.in_flight() + backend_pending;
        ManagerStatus {
            manager: self.manager.to_string(),
            health,
            write_status,
            pending: write_status > 0,
            last_operation: last,
        }
    }
}

/// Counts one operation as in flight until dropped.
#[derive(Debug)]
pub struct OperationGuard<'a> {
    tracker: &'a StatusTracker,
    name: String,
    recorded: bool,
}

impl OperationGuard<'_> {
    pub fn finish(mut self, outcome: OperationOutcome, detail: impl Into<String>) {
        self.recorded = true;
        self.tracker
            .record(std::mem::take(&mut self.name), outcome, detail.into());
    }

    pub fn succeed(self, detail: impl Into<String>) {
        self.finish(OperationOutcome::Succeeded, detail)
    }

    pub fn fail(self, detail: impl Into<String>) {
        self.finish(OperationOutcome::Failed, detail)
    }

    /// Record a fan-out from its success and failure counts.
    pub fn finish_counts(self, succeeded: usize, failed: usize) {
        let outcome = match (succeeded, failed) {
            (_, 0) => OperationOutcome::Succeeded,
            (0, _) => OperationOutcome::Failed,
            _ => OperationOutcome::Partial,
        };
        self.finish(outcome, format!("{succeeded} succeeded, {failed} failed"))
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.tracker.record(
                std::mem::take(&mut self.name),
                OperationOutcome::Failed,
                "abandoned before completion".to_string(),
            );
        }
        self.tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
