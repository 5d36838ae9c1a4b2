//! Compensating actions for a partially completed provision
//!
//! Each completed backend step pushes its undo action. On failure the stack
//! is unwound in reverse with a fresh cancellation token, so a cancelled
//! caller still gets its partial state cleaned up within the deadline.

use crate::backend::{BackendClient, BackendError};
use isilon_common::{BackendVolumeKey, Error};
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long rollback may take once a provision has failed
pub const CLEANUP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoStep {
    DeleteVolume,
    ClearQuota,
    Unexport,
}

impl fmt::Display for UndoStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteVolume => write!(f, "delete volume"),
            Self::ClearQuota => write!(f, "clear quota"),
            Self::Unexport => write!(f, "unexport"),
        }
    }
}

/// Undo actions for one volume, most recent last
#[derive(Debug)]
pub struct UndoStack {
    key: BackendVolumeKey,
    steps: Vec<UndoStep>,
}

impl UndoStack {
    pub fn new(key: BackendVolumeKey) -> Self {
        Self {
            key,
            steps: Vec::new(),
        }
    }

    pub fn push(&mut self, step: UndoStep) {
        self.steps.push(step);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[UndoStep] {
        &self.steps
    }

    /// Run every undo action in reverse order and collect the failures.
    ///
    /// All steps are attempted even after one fails. Objects that are
    /// already gone count as undone.
    pub async fn unwind(self, backend: &dyn BackendClient, deadline: Duration) -> Vec<Error> {
        let cancel = CancellationToken::new();
        let deadline = Instant::now() + deadline;
        let mut failures = Vec::new();

        for step in self.steps.into_iter().rev() {
            let call = async {
                match step {
                    UndoStep::DeleteVolume => backend.delete_volume(&self.key, &cancel).await,
                    UndoStep::ClearQuota => backend.clear_quota(&self.key, &cancel).await,
                    UndoStep::Unexport => backend.unexport_volume(&self.key, &cancel).await,
                }
            };

            match timeout_at(deadline, call).await {
                Ok(Ok(())) => {
                    info!(volume = %self.key, step = %step, "Rolled back");
                }
                Ok(Err(BackendError::NotFound(_))) => {
                    info!(volume = %self.key, step = %step, "Nothing to roll back");
                }
                Ok(Err(e)) => {
                    warn!(volume = %self.key, step = %step, error = %e, "Rollback step failed");
                    failures.push(Error::from(e));
                }
                Err(_) => {
                    warn!(volume = %self.key, step = %step, "Rollback step timed out");
                    cancel.cancel();
                    failures.push(Error::BackendUnavailable(format!(
                        "rollback step '{}' for {} timed out",
                        step, self.key
                    )));
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{BackendOp, MemoryBackend};

    fn key() -> BackendVolumeKey {
        BackendVolumeKey::from("ns-claim-pv")
    }

    async fn provisioned(backend: &MemoryBackend) {
        let cancel = CancellationToken::new();
        backend.create_volume(&key(), &cancel).await.unwrap();
        backend.set_quota(&key(), 10, &cancel).await.unwrap();
        backend.export_volume(&key(), &cancel).await.unwrap();
        backend.clear_journal().await;
    }

    fn full_stack() -> UndoStack {
        let mut undo = UndoStack::new(key());
        undo.push(UndoStep::DeleteVolume);
        undo.push(UndoStep::ClearQuota);
        undo.push(UndoStep::Unexport);
        undo
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse() {
        let backend = MemoryBackend::new();
        provisioned(&backend).await;

        let failures = full_stack().unwind(&backend, CLEANUP_DEADLINE).await;
        assert!(failures.is_empty());
        assert_eq!(
            backend.ops().await,
            vec![BackendOp::Unexport, BackendOp::ClearQuota, BackendOp::DeleteVolume]
        );
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_unwind_tolerates_missing_objects() {
        let backend = MemoryBackend::new();
        let failures = full_stack().unwind(&backend, CLEANUP_DEADLINE).await;
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn test_unwind_continues_after_failure() {
        let backend = MemoryBackend::new();
        provisioned(&backend).await;
        backend
            .fail_next(BackendOp::ClearQuota, BackendError::Unavailable("503".to_string()))
            .await;

        let failures = full_stack().unwind(&backend, CLEANUP_DEADLINE).await;
        // the quota is still there, so the volume delete is refused too
        assert_eq!(failures.len(), 2);
        assert_eq!(
            backend.ops().await,
            vec![BackendOp::Unexport, BackendOp::ClearQuota, BackendOp::DeleteVolume]
        );
    }

    #[tokio::test]
    async fn test_unwind_respects_deadline() {
        let backend = MemoryBackend::new();
        provisioned(&backend).await;
        backend.hang_on(BackendOp::Unexport).await;

        let failures = full_stack()
            .unwind(&backend, Duration::from_millis(50))
            .await;
        assert_eq!(failures.len(), 3);
        assert!(failures
            .iter()
            .all(|e| matches!(e, Error::BackendUnavailable(_) | Error::Cancelled)));
    }
}
