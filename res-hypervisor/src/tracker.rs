//! Bookkeeping for writes that run in the background.
//!
//! A [`WriteTracker`] counts in-flight writes per VM, remembers the fault of
//! the last failed write on each VM, and caches the most recently observed
//! [`VmInfo`]. Every accessor takes the lock briefly, so status queries stay
//! cheap even while writes are running.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::VmInfo;

#[derive(Debug, Default)]
struct TrackerState {
    pending: HashMap<String, usize>,
    faults: HashMap<String, String>,
    last_error: Option<String>,
    vms: BTreeMap<String, VmInfo>,
}

#[derive(Debug, Default)]
pub struct WriteTracker {
    state: Mutex<TrackerState>,
}

impl WriteTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account a new write on `vm`. Clears any stale fault left by an earlier write.
    pub fn begin(self: &Arc<Self>, vm: &str) -> WriteGuard {
        let mut state = self.lock();
        state.faults.remove(vm);
        *state.pending.entry(vm.to_string()).or_insert(0) += 1;
        WriteGuard {
            tracker: Arc::clone(self),
            vm: vm.to_string(),
            finished: false,
        }
    }

    fn complete(&self, vm: &str, outcome: Result<(), String>) {
        let mut state = self.lock();
        if let Err(message) = outcome {
            warn!(vm = %vm, error = %message, "Hypervisor write failed");
            state.faults.insert(vm.to_string(), message.clone());
            state.last_error = Some(message);
        }
        if let Some(count) = state.pending.get_mut(vm) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pending.remove(vm);
            }
        }
    }

    /// In-flight writes on `vm`, or on every VM when `vm` is `None`.
    pub fn pending(&self, vm: Option<&str>) -> usize {
        let state = self.lock();
        match vm {
            Some(vm) => state.pending.get(vm).copied().unwrap_or(0),
            None => state.pending.values().sum(),
        }
    }

    pub fn take_fault(&self, vm: &str) -> Option<String> {
        self.lock().faults.remove(vm)
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn record_info(&self, info: VmInfo) {
        debug!(vm = %info.name, state = %info.state, "Cached VM info");
        self.lock().vms.insert(info.name.clone(), info);
    }

    /// Update only the cached state of `vm`, creating an entry if needed.
    pub fn record_state(&self, vm: &str, state: crate::VmState) {
        let mut guard = self.lock();
        guard
            .vms
            .entry(vm.to_string())
            .and_modify(|info| info.state = state)
            .or_insert_with(|| VmInfo::new(vm, state));
    }

    pub fn forget(&self, vm: &str) {
        self.lock().vms.remove(vm);
    }

    pub fn info(&self, vm: &str) -> Option<VmInfo> {
        self.lock().vms.get(vm).cloned()
    }

    pub fn all(&self) -> Vec<VmInfo> {
        self.lock().vms.values().cloned().collect()
    }
}

/// Keeps a write accounted until [`WriteGuard::finish`] is called.
///
/// Dropping the guard without finishing (for example when the worker thread
/// panics) records a fault so callers never wait on a write that is gone.
#[derive(Debug)]
pub struct WriteGuard {
    tracker: Arc<WriteTracker>,
    vm: String,
    finished: bool,
}

impl WriteGuard {
    pub fn vm(&self) -> &str {
        &self.vm
    }

    pub fn finish(mut self, outcome: Result<(), String>) {
        self.finished = true;
        self.tracker.complete(&self.vm, outcome);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker
                .complete(&self.vm, Err("write abandoned before completion".to_string()));
        }
    }
}
