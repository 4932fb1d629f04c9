//! Execution state: step results, the per-run context, and the persisted record.
//!
//! The [`ExecutionContext`] is a write-once-per-key log of terminal step
//! results plus a side table of approvals still waiting for a human. The
//! persisted [`ExecutionRecord`] keeps the raw append-only step log; replaying
//! that log rebuilds the exact same context after a process restart.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::ResourceUsage;
use crate::error::ContextError;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

/// Lifecycle of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepResult
// ---------------------------------------------------------------------------

/// Why a step failed or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AgentError,
    Timeout,
    ApprovalTimeout,
    ApprovalRejected,
    Cancelled,
    UpstreamNotSucceeded,
    BranchNotTaken,
    MissingDependency,
    InputResolution,
    PredicateError,
    AgentNotFound,
    ChildFailed,
    Internal,
}

/// Structured failure reason attached to a step result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one step, appended to the execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
}

impl StepResult {
    pub fn succeeded(
        step_id: impl Into<String>,
        payload: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            payload: Some(payload),
            error: None,
            started_at: Some(started_at),
            completed_at: Some(now),
            duration_ms: Some(elapsed_ms(started_at, now)),
            usage: None,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        failure: StepFailure,
        started_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            payload: None,
            error: Some(failure),
            started_at,
            completed_at: Some(now),
            duration_ms: started_at.map(|s| elapsed_ms(s, now)),
            usage: None,
        }
    }

    pub fn skipped(step_id: impl Into<String>, reason: StepFailure) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            payload: None,
            error: Some(reason),
            started_at: None,
            completed_at: Some(Utc::now()),
            duration_ms: None,
            usage: None,
        }
    }

    pub fn awaiting_approval(step_id: impl Into<String>, requested_at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::AwaitingApproval,
            payload: None,
            error: None,
            started_at: Some(requested_at),
            completed_at: None,
            duration_ms: None,
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

/// A gate that is waiting for a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub step_id: String,
    pub approver_role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl PendingApproval {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// A human decision for one approval gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResolution {
    pub decision: ApprovalDecision,
    pub approver_id: String,
    /// Roles the caller holds; must include the gate's approver role.
    #[serde(default)]
    pub approver_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ApprovalResolution {
    pub fn approve(approver_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Approve,
            approver_id: approver_id.into(),
            approver_roles: vec![role.into()],
            comment: None,
        }
    }

    pub fn reject(approver_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            decision: ApprovalDecision::Reject,
            ..Self::approve(approver_id, role)
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Per-run mutable state owned by exactly one orchestrator drive at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub input: serde_json::Value,
    results: HashMap<String, StepResult>,
    pending_approvals: HashMap<String, PendingApproval>,
}

impl ExecutionContext {
    pub fn new(execution_id: Uuid, input: serde_json::Value) -> Self {
        Self {
            execution_id,
            input,
            results: HashMap::new(),
            pending_approvals: HashMap::new(),
        }
    }

    /// Rebuild a context by replaying an append-only step log in order.
    ///
    /// Later duplicate terminal entries for the same step are ignored, so a
    /// replay never overwrites what the original run observed.
    pub fn replay(
        execution_id: Uuid,
        input: serde_json::Value,
        log: &[StepResult],
        approvals: &[PendingApproval],
    ) -> Self {
        let mut ctx = Self::new(execution_id, input);
        for approval in approvals {
            ctx.pending_approvals
                .insert(approval.step_id.clone(), approval.clone());
        }
        for result in log {
            if result.status.is_terminal() {
                ctx.pending_approvals.remove(&result.step_id);
                ctx.results
                    .entry(result.step_id.clone())
                    .or_insert_with(|| result.clone());
            }
        }
        ctx
    }

    /// Record a terminal result. Each step id may be written once.
    pub fn record(&mut self, result: StepResult) -> Result<(), ContextError> {
        if !result.status.is_terminal() {
            return Err(ContextError::NotTerminal(result.step_id));
        }
        if self.results.contains_key(&result.step_id) {
            return Err(ContextError::AlreadyRecorded(result.step_id));
        }
        self.pending_approvals.remove(&result.step_id);
        self.results.insert(result.step_id.clone(), result);
        Ok(())
    }

    pub fn add_pending_approval(&mut self, approval: PendingApproval) {
        self.pending_approvals
            .insert(approval.step_id.clone(), approval);
    }

    pub fn pending_approval(&self, step_id: &str) -> Option<&PendingApproval> {
        self.pending_approvals.get(step_id)
    }

    pub fn pending_approvals(&self) -> impl Iterator<Item = &PendingApproval> {
        self.pending_approvals.values()
    }

    pub fn has_pending_approvals(&self) -> bool {
        !self.pending_approvals.is_empty()
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.get(step_id)
    }

    pub fn results(&self) -> impl Iterator<Item = &StepResult> {
        self.results.values()
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.results.get(step_id).map(|r| r.status)
    }

    /// Payload of a step, only when it succeeded.
    pub fn payload(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.results
            .get(step_id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.payload.as_ref())
    }

    pub fn is_terminal(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id)
    }

    /// JSON view used by predicate expressions.
    ///
    /// Shape: `{input, steps: {<id>: {status, output}}}`.
    pub fn to_expression_scope(&self) -> serde_json::Value {
        let steps: serde_json::Map<String, serde_json::Value> = self
            .results
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "status": r.status.as_str(),
                        "output": r.payload.clone().unwrap_or(serde_json::Value::Null),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "input": self.input,
            "steps": steps,
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Durable snapshot of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub definition_ref: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    /// Append-only step log in the order results were produced.
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    /// Gates that were opened, in order. Resolution appears in `step_results`.
    #[serde(default)]
    pub approvals: Vec<PendingApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        execution_id: Uuid,
        definition_ref: impl Into<String>,
        input: serde_json::Value,
        total_steps: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            definition_ref: definition_ref.into(),
            status: ExecutionStatus::Pending,
            input,
            step_results: Vec::new(),
            approvals: Vec::new(),
            current_step_id: None,
            total_steps,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replay the step log into a fresh context.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::replay(
            self.execution_id,
            self.input.clone(),
            &self.step_results,
            &self.approvals,
        )
    }

    /// Number of distinct steps with a terminal result.
    pub fn completed_steps(&self) -> usize {
        self.step_results
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| r.step_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn progress(&self) -> Progress {
        let completed = self.completed_steps().min(self.total_steps);
        let percent_complete = if self.total_steps == 0 {
            if self.status.is_terminal() { 100.0 } else { 0.0 }
        } else {
            (completed as f64 / self.total_steps as f64) * 100.0
        };

        Progress {
            execution_id: self.execution_id,
            percent_complete,
            current_step_id: self.current_step_id.clone(),
            status: self.status,
            completed_steps: completed,
            total_steps: self.total_steps,
        }
    }
}

/// Point-in-time progress view derived from an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub execution_id: Uuid,
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    pub status: ExecutionStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
