//! Durable checkpoint manager for execution state.
//!
//! Wraps `ExecutionStore` to provide a higher-level API for recording every
//! transition of a run. Each step outcome is appended to the store's step
//! log before the orchestrator moves on, so a crashed process can replay the
//! log and continue from exactly where it stopped.

use maestro_types::execution::{
    ExecutionRecord, ExecutionStatus, PendingApproval, StepResult,
};
use uuid::Uuid;

use crate::repository::execution::ExecutionStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for executions.
///
/// Generic over `S: ExecutionStore` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<S: ExecutionStore> {
    store: S,
}

impl<S: ExecutionStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a new execution record.
    pub async fn checkpoint_created(&self, record: &ExecutionRecord) -> Result<(), CheckpointError> {
        self.store
            .create(record)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %record.execution_id,
            definition = record.definition_ref.as_str(),
            "checkpointed execution created"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Append a step outcome to the log.
    pub async fn checkpoint_step(
        &self,
        execution_id: Uuid,
        result: &StepResult,
    ) -> Result<(), CheckpointError> {
        self.store
            .append_step_result(&execution_id, result)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution_id,
            step_id = result.step_id.as_str(),
            status = %result.status,
            "checkpointed step"
        );
        Ok(())
    }

    /// Record an opened approval gate: the pending entry, the
    /// `AwaitingApproval` log line, and the `Paused` run status.
    pub async fn checkpoint_gate_opened(
        &self,
        execution_id: Uuid,
        approval: &PendingApproval,
    ) -> Result<(), CheckpointError> {
        let store_err = |e: maestro_types::error::RepositoryError| {
            CheckpointError::Repository(e.to_string())
        };

        self.store
            .open_approval(&execution_id, approval)
            .await
            .map_err(store_err)?;
        self.store
            .append_step_result(
                &execution_id,
                &StepResult::awaiting_approval(&approval.step_id, approval.requested_at),
            )
            .await
            .map_err(store_err)?;
        self.store
            .set_status(
                &execution_id,
                ExecutionStatus::Paused,
                Some(&approval.step_id),
                None,
            )
            .await
            .map_err(store_err)?;

        tracing::debug!(
            execution_id = %execution_id,
            step_id = approval.step_id.as_str(),
            approver_role = approval.approver_role.as_str(),
            "checkpointed approval gate"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Update the run status, the current step pointer, and the error message.
    pub async fn checkpoint_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        current_step_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.store
            .set_status(&execution_id, status, current_step_id, error)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution_id,
            status = %status,
            current_step_id,
            "checkpointed execution status"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Load a record, failing when it does not exist.
    pub async fn restore(&self, execution_id: Uuid) -> Result<ExecutionRecord, CheckpointError> {
        self.store
            .load(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }

    /// Ids of executions left `Running` by a previous process.
    pub async fn interrupted(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let records = self
            .store
            .list_by_status(ExecutionStatus::Running)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        Ok(records.into_iter().map(|r| r.execution_id).collect())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Repository(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryExecutionStore;
    use chrono::Utc;
    use maestro_types::execution::StepStatus;
    use serde_json::json;

    fn manager() -> CheckpointManager<InMemoryExecutionStore> {
        CheckpointManager::new(InMemoryExecutionStore::new())
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("disk full".to_string());
        assert_eq!(err.to_string(), "checkpoint store error: disk full");

        let id = Uuid::nil();
        let err = CheckpointError::ExecutionNotFound(id);
        assert!(err.to_string().contains("execution not found"));
    }

    #[tokio::test]
    async fn gate_checkpoint_pauses_and_logs() {
        let cp = manager();
        let record = ExecutionRecord::new(Uuid::now_v7(), "wf@1.0.0", json!({}), 2);
        let id = record.execution_id;
        cp.checkpoint_created(&record).await.unwrap();

        cp.checkpoint_step(id, &StepResult::succeeded("a", json!(1), Utc::now()))
            .await
            .unwrap();
        cp.checkpoint_gate_opened(
            id,
            &PendingApproval {
                step_id: "gate".to_string(),
                approver_role: "lead".to_string(),
                prompt: None,
                requested_at: Utc::now(),
                deadline: None,
            },
        )
        .await
        .unwrap();

        let loaded = cp.restore(id).await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Paused);
        assert_eq!(loaded.current_step_id.as_deref(), Some("gate"));
        assert_eq!(loaded.approvals.len(), 1);
        assert_eq!(loaded.step_results[1].status, StepStatus::AwaitingApproval);
        assert!(loaded.context().pending_approval("gate").is_some());
    }

    #[tokio::test]
    async fn restore_unknown_execution_fails() {
        let err = manager().restore(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn interrupted_lists_running_records() {
        let cp = manager();
        let running = ExecutionRecord::new(Uuid::now_v7(), "wf@1.0.0", json!({}), 1);
        let done = ExecutionRecord::new(Uuid::now_v7(), "wf@1.0.0", json!({}), 1);
        cp.checkpoint_created(&running).await.unwrap();
        cp.checkpoint_created(&done).await.unwrap();
        cp.checkpoint_status(running.execution_id, ExecutionStatus::Running, None, None)
            .await
            .unwrap();
        cp.checkpoint_status(done.execution_id, ExecutionStatus::Completed, None, None)
            .await
            .unwrap();

        assert_eq!(cp.interrupted().await.unwrap(), vec![running.execution_id]);
    }
}
