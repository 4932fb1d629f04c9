//! Progress events for the Maestro event bus.
//!
//! `ExecutionEvent` is broadcast while executions run so that subscribers
//! (CLI progress output, logging, tests) can follow a run live.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{ApprovalDecision, FailureKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A new execution record was created and the walk started.
    ExecutionStarted {
        execution_id: Uuid,
        definition_ref: String,
        total_steps: usize,
    },

    /// An agent call was dispatched for a step.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        agent_id: Option<String>,
    },

    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    StepFailed {
        execution_id: Uuid,
        step_id: String,
        kind: FailureKind,
        error: String,
    },

    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        kind: FailureKind,
    },

    /// The execution stopped at an approval gate.
    ExecutionPaused {
        execution_id: Uuid,
        step_id: String,
        approver_role: String,
    },

    ApprovalResolved {
        execution_id: Uuid,
        step_id: String,
        decision: ApprovalDecision,
        approver_id: String,
    },

    /// A paused or interrupted execution continued its walk.
    ExecutionResumed { execution_id: Uuid },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
    },

    ExecutionFailed { execution_id: Uuid, error: String },

    ExecutionCancelled { execution_id: Uuid },
}

impl ExecutionEvent {
    /// Execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::ExecutionStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::ExecutionPaused { execution_id, .. }
            | Self::ApprovalResolved { execution_id, .. }
            | Self::ExecutionResumed { execution_id }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. }
            | Self::ExecutionCancelled { execution_id } => *execution_id,
        }
    }

    /// Whether this event ends the current drive of an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionCancelled { .. }
                | Self::ExecutionPaused { .. }
        )
    }
}
