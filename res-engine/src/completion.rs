//! The completion-polling loop.
//!
//! Hypervisor writes return as soon as they are accepted. A write counts as
//! complete once the backend reports no pending writes for its VM; the loop
//! below observes that by querying, sleeping and querying again.

use std::time::{Duration, Instant};

use res_hypervisor::{Hypervisor, WriteOp};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// `None` polls until idle with no upper bound.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            deadline: None,
        }
    }
}

/// Query `pending` until it reports zero, sleeping `policy.interval` between
/// queries. Returns the number of queries made.
///
/// A backend that is busy for the first K queries costs exactly K + 1 queries.
pub async fn wait_for_idle<F>(vm: &str, policy: &PollPolicy, mut pending: F) -> Result<usize>
where
    F: FnMut() -> usize,
{
    let started = Instant::now();
    let mut queries = 0usize;
    loop {
        queries += 1;
        let busy = pending();
        if busy == 0 {
            trace!(vm = %vm, queries, "Backend idle");
            return Ok(queries);
        }
        if let Some(deadline) = policy.deadline {
            if started.elapsed() >= deadline {
                return Err(EngineError::Timeout {
                    vm: vm.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
        trace!(vm = %vm, busy, "Backend busy");
        tokio::time::sleep(policy.interval).await;
    }
}

/// Issue `op` against `vm`, wait for it to complete, and surface any fault
/// the backend recorded while it ran.
pub async fn complete_write(
    hypervisor: &dyn Hypervisor,
    vm: &str,
    op: &WriteOp,
    policy: &PollPolicy,
) -> Result<()> {
    debug!(vm = %vm, op = %op.kind(), "Issuing write");
    hypervisor.issue(vm, op)?;
    let queries = wait_for_idle(vm, policy, || hypervisor.pending_writes(vm)).await?;
    debug!(vm = %vm, op = %op.kind(), queries, "Write complete");

    match hypervisor.take_fault(vm) {
        Some(fault) => Err(EngineError::BackendFault(format!(
            "{} {vm}: {fault}",
            op.kind()
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use res_hypervisor::mock::MockHypervisor;
    use res_hypervisor::{VmState, WriteKind};

    fn fast() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_busy_k_times_costs_k_plus_one_queries() {
        for k in [0usize, 1, 2, 7] {
            let mut remaining = k;
            let mut calls = 0;
            let queries = wait_for_idle("vm", &fast(), || {
                calls += 1;
                if remaining > 0 {
                    remaining -= 1;
                    1
                } else {
                    0
                }
            })
            .await
            .unwrap();
            assert_eq!(queries, k + 1);
            assert_eq!(calls, k + 1);
        }
    }

    #[tokio::test]
    async fn test_deadline_yields_timeout() {
        let policy = PollPolicy {
            interval: Duration::from_millis(2),
            deadline: Some(Duration::from_millis(20)),
        };
        let error = wait_for_idle("stuck", &policy, || 1).await.unwrap_err();
        assert!(matches!(error, EngineError::Timeout { ref vm, .. } if vm == "stuck"));
    }

    #[tokio::test]
    async fn test_complete_write_against_mock() {
        let mock = MockHypervisor::new()
            .with_busy_polls(3)
            .with_vm("a", VmState::Stopped);

        complete_write(&mock, "a", &WriteOp::Start, &fast()).await.unwrap();

        assert_eq!(mock.pending_queries(), 4);
        assert_eq!(mock.state_of("a"), Some(VmState::Running));
    }

    #[tokio::test]
    async fn test_complete_write_surfaces_fault() {
        let mock = MockHypervisor::new().with_vm("a", VmState::Stopped);
        mock.fail_on("a", WriteKind::Start);

        let error = complete_write(&mock, "a", &WriteOp::Start, &fast())
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::BackendFault(ref m) if m.contains("start a")));
    }
}
