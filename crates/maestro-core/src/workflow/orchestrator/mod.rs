//! Orchestrator: drives workflow executions to a terminal state.
//!
//! An execution walks the definition tree in order. Every step outcome is
//! checkpointed through [`CheckpointManager`] before the walk moves on, so a
//! record loaded in a different process can be resumed by replaying its step
//! log. Approval gates do not block: the walk returns `Paused` and a later
//! `resolve_approval`/`expire_approval` call continues it.
//!
//! # Execution flow
//!
//! 1. `run`/`start` validate and register the definition, create the record.
//! 2. `walk_block` visits each step, skipping those with a terminal result.
//! 3. Agent steps go through `call_agent` (timeout + cancellation race).
//! 4. Parallel groups fan out on a `JoinSet` bounded by a semaphore.
//! 5. `finish` derives the terminal status and publishes the final event.
//!
//! Operations that touch a paused run (`resolve_approval`,
//! `expire_approval`, `cancel`, `resume`) are serialized per execution by an
//! async mutex. The mutex lives in the lock map only while a caller holds
//! or waits on it.

mod step_runner;
mod walker;


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use maestro_types::config::EngineConfig;
use maestro_types::event::ExecutionEvent;
use maestro_types::execution::{
    ApprovalDecision, ApprovalResolution, ExecutionContext, ExecutionRecord, ExecutionStatus,
    FailureKind, PendingApproval, Progress, StepFailure, StepResult, StepStatus,
};
use maestro_types::workflow::WorkflowDefinition;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore, broadcast};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::executor::AgentExecutor;
use crate::agent::registry::AgentRegistry;
use crate::event::bus::EventBus;
use crate::repository::execution::ExecutionStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::definition::{ValidationError, validate_definition};

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Caller misuse or storage failure. Agent failures never surface here; they
/// end up as step results and the terminal status of the execution.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("workflow definition '{0}' is not registered")]
    DefinitionNotRegistered(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] ValidationError),

    #[error("execution {execution_id} is {status}, not paused")]
    NotPaused {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("step '{step_id}' of execution {execution_id} has no pending approval")]
    NoPendingApproval { execution_id: Uuid, step_id: String },

    #[error("approval for step '{step_id}' of execution {execution_id} is already resolved")]
    AlreadyResolved { execution_id: Uuid, step_id: String },

    #[error("'{approver_id}' lacks role '{required_role}' to resolve step '{step_id}'")]
    ApproverNotAuthorized {
        step_id: String,
        required_role: String,
        approver_id: String,
    },

    #[error("execution {execution_id} already ended as {status}")]
    AlreadyTerminal {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("execution {0} is already being driven by this orchestrator")]
    AlreadyRunning(Uuid),

    #[error("execution store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<CheckpointError> for OrchestratorError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::ExecutionNotFound(id) => Self::ExecutionNotFound(id),
            CheckpointError::Repository(msg) => Self::Store(msg),
        }
    }
}

/// Where a call into the orchestrator left the execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// Gate the execution is waiting on when `status` is `Paused`.
    pub paused_at: Option<String>,
    pub error: Option<String>,
    pub context: ExecutionContext,
}

impl ExecutionOutcome {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.context.result(step_id)
    }

    pub fn payload(&self, step_id: &str) -> Option<&Value> {
        self.context.payload(step_id)
    }
}

/// A spawned execution. The id is known before the walk finishes.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    join: JoinHandle<Result<ExecutionOutcome, OrchestratorError>>,
}

impl ExecutionHandle {
    /// Wait for the execution to stop (terminal or paused).
    pub async fn wait(self) -> Result<ExecutionOutcome, OrchestratorError> {
        self.join
            .await
            .map_err(|e| OrchestratorError::Internal(format!("execution task failed: {e}")))?
    }
}

// ---------------------------------------------------------------------------
// Internal run state
// ---------------------------------------------------------------------------

/// How a walk over a block of steps ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Flow {
    Continue,
    Paused(String),
    Halted(String),
    Cancelled,
}

/// State owned by exactly one drive of one execution.
struct RunState {
    execution_id: Uuid,
    def: Arc<WorkflowDefinition>,
    ctx: ExecutionContext,
    token: CancellationToken,
    created_at: DateTime<Utc>,
}

enum GateSettlement {
    Resolved(ApprovalResolution),
    Expired,
}

struct Shared<S: ExecutionStore, E: AgentExecutor> {
    checkpoint: CheckpointManager<S>,
    executor: E,
    registry: Arc<AgentRegistry>,
    event_bus: EventBus,
    config: EngineConfig,
    /// Deployment-wide cap on agent calls in flight, if configured.
    in_flight: Option<Arc<Semaphore>>,
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
    tokens: DashMap<Uuid, CancellationToken>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    timers: DashMap<(Uuid, String), AbortHandle>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Workflow execution engine.
///
/// Generic over `S: ExecutionStore` for persistence and `E: AgentExecutor`
/// for running agent work. Cloning is cheap and every clone drives the same
/// set of executions.
pub struct Orchestrator<S: ExecutionStore, E: AgentExecutor> {
    inner: Arc<Shared<S, E>>,
}

impl<S: ExecutionStore, E: AgentExecutor> Clone for Orchestrator<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ExecutionStore, E: AgentExecutor> Orchestrator<S, E> {
    pub fn new(store: S, executor: E, registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        Self::with_event_bus(store, executor, registry, config, event_bus)
    }

    /// Create an orchestrator that publishes onto an existing bus.
    pub fn with_event_bus(
        store: S,
        executor: E,
        registry: Arc<AgentRegistry>,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        let in_flight = config
            .global_max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Self {
            inner: Arc::new(Shared {
                checkpoint: CheckpointManager::new(store),
                executor,
                registry,
                event_bus,
                config,
                in_flight,
                definitions: DashMap::new(),
                tokens: DashMap::new(),
                locks: DashMap::new(),
                timers: DashMap::new(),
            }),
        }
    }

    pub fn store(&self) -> &S {
        self.inner.checkpoint.store()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.event_bus.subscribe()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and remember a definition under its `name@version` reference.
    ///
    /// Executions only record the reference, so a fresh orchestrator must have
    /// the definition registered before it can resume or resolve them.
    pub fn register_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, OrchestratorError> {
        validate_definition(&def)?;
        let def = Arc::new(def);
        let definition_ref = def.definition_ref();
        tracing::debug!(definition = definition_ref.as_str(), "registered workflow definition");
        self.inner.definitions.insert(definition_ref, Arc::clone(&def));
        Ok(def)
    }

    pub fn definition(&self, definition_ref: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner
            .definitions
            .get(definition_ref)
            .map(|d| Arc::clone(d.value()))
    }

    fn lookup_definition(&self, definition_ref: &str) -> Result<Arc<WorkflowDefinition>, OrchestratorError> {
        self.definition(definition_ref)
            .ok_or_else(|| OrchestratorError::DefinitionNotRegistered(definition_ref.to_string()))
    }

    // -----------------------------------------------------------------------
    // Starting and resuming
    // -----------------------------------------------------------------------

    /// Run an execution until it completes, fails, is cancelled, or pauses.
    pub async fn run(
        &self,
        def: WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let run = self.begin(def, input).await?;
        self.drive(run).await
    }

    /// Create the execution and drive it on a spawned task.
    pub async fn start(
        &self,
        def: WorkflowDefinition,
        input: Value,
    ) -> Result<ExecutionHandle, OrchestratorError> {
        let run = self.begin(def, input).await?;
        let execution_id = run.execution_id;
        let orchestrator = self.clone();
        let join = tokio::spawn(async move { orchestrator.drive(run).await });
        Ok(ExecutionHandle { execution_id, join })
    }

    /// Continue an execution from its persisted record.
    ///
    /// Steps with a terminal result are never re-run. A run still waiting on
    /// a gate stays paused; its approval timers are re-armed.
    pub async fn resume(&self, execution_id: Uuid) -> Result<ExecutionOutcome, OrchestratorError> {
        let guard = self.lock_execution(execution_id).await;

        if self.inner.tokens.contains_key(&execution_id) {
            return Err(OrchestratorError::AlreadyRunning(execution_id));
        }
        let record = self.inner.checkpoint.restore(execution_id).await?;
        if record.status.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                execution_id,
                status: record.status,
            });
        }
        let def = self.lookup_definition(&record.definition_ref)?;
        let ctx = record.context();

        if ctx.has_pending_approvals() {
            let paused_at = record
                .current_step_id
                .clone()
                .filter(|id| ctx.pending_approval(id).is_some())
                .or_else(|| ctx.pending_approvals().next().map(|a| a.step_id.clone()));
            // A crash between opening the gate and pausing leaves `Running` behind.
            if record.status != ExecutionStatus::Paused {
                tracing::warn!(
                    execution_id = %execution_id,
                    previous = %record.status,
                    "repairing status of execution left waiting on a gate"
                );
                self.inner
                    .checkpoint
                    .checkpoint_status(execution_id, ExecutionStatus::Paused, paused_at.as_deref(), None)
                    .await?;
            }
            for approval in ctx.pending_approvals() {
                self.arm_approval_timer(execution_id, approval);
            }
            tracing::info!(execution_id = %execution_id, "execution still awaiting approval");
            return Ok(ExecutionOutcome {
                execution_id,
                status: ExecutionStatus::Paused,
                paused_at,
                error: None,
                context: ctx,
            });
        }

        let run = self.reenter(&record, def, ctx);
        drop(guard);
        self.drive(run).await
    }

    async fn begin(
        &self,
        def: WorkflowDefinition,
        input: Value,
    ) -> Result<RunState, OrchestratorError> {
        let def = self.register_definition(def)?;
        let execution_id = Uuid::now_v7();
        let record = ExecutionRecord::new(
            execution_id,
            def.definition_ref(),
            input.clone(),
            def.total_steps(),
        );
        self.inner.checkpoint.checkpoint_created(&record).await?;

        let token = CancellationToken::new();
        self.inner.tokens.insert(execution_id, token.clone());

        self.inner.event_bus.publish(ExecutionEvent::ExecutionStarted {
            execution_id,
            definition_ref: record.definition_ref.clone(),
            total_steps: record.total_steps,
        });
        tracing::info!(
            execution_id = %execution_id,
            definition = record.definition_ref.as_str(),
            total_steps = record.total_steps,
            "starting execution"
        );

        Ok(RunState {
            execution_id,
            def,
            ctx: ExecutionContext::new(execution_id, input),
            token,
            created_at: record.created_at,
        })
    }

    /// Build run state for a persisted execution and claim its token.
    fn reenter(
        &self,
        record: &ExecutionRecord,
        def: Arc<WorkflowDefinition>,
        ctx: ExecutionContext,
    ) -> RunState {
        let execution_id = record.execution_id;
        let token = CancellationToken::new();
        self.inner.tokens.insert(execution_id, token.clone());

        self.inner
            .event_bus
            .publish(ExecutionEvent::ExecutionResumed { execution_id });
        tracing::info!(
            execution_id = %execution_id,
            completed_steps = record.completed_steps(),
            "resuming execution"
        );

        RunState {
            execution_id,
            def,
            ctx,
            token,
            created_at: record.created_at,
        }
    }

    async fn drive(&self, mut run: RunState) -> Result<ExecutionOutcome, OrchestratorError> {
        let result = self.drive_inner(&mut run).await;
        self.inner.tokens.remove(&run.execution_id);
        if let Err(e) = &result {
            tracing::error!(execution_id = %run.execution_id, error = %e, "execution drive aborted");
        }
        result
    }

    async fn drive_inner(&self, run: &mut RunState) -> Result<ExecutionOutcome, OrchestratorError> {
        self.inner
            .checkpoint
            .checkpoint_status(run.execution_id, ExecutionStatus::Running, None, None)
            .await?;

        let def = Arc::clone(&run.def);
        let flow = self.walk_block(run, &def.steps).await?;
        self.finish(run, flow).await
    }

    /// Derive and persist the status a walk ended in.
    async fn finish(&self, run: &RunState, flow: Flow) -> Result<ExecutionOutcome, OrchestratorError> {
        let execution_id = run.execution_id;
        let (status, error, paused_at) = match flow {
            Flow::Paused(step_id) => (ExecutionStatus::Paused, None, Some(step_id)),
            Flow::Cancelled => (ExecutionStatus::Cancelled, None, None),
            Flow::Halted(reason) => (ExecutionStatus::Failed, Some(reason), None),
            Flow::Continue => match first_required_failure(&run.def, &run.ctx) {
                Some(step_id) => (
                    ExecutionStatus::Failed,
                    Some(format!("required step '{step_id}' failed")),
                    None,
                ),
                None => (ExecutionStatus::Completed, None, None),
            },
        };

        // The gate checkpoint already wrote `Paused` with the current step.
        if status != ExecutionStatus::Paused {
            self.inner
                .checkpoint
                .checkpoint_status(execution_id, status, None, error.as_deref())
                .await?;
        }

        match status {
            ExecutionStatus::Completed => {
                let duration_ms = u64::try_from((Utc::now() - run.created_at).num_milliseconds()).unwrap_or(0);
                tracing::info!(execution_id = %execution_id, duration_ms, "execution completed");
                self.inner.event_bus.publish(ExecutionEvent::ExecutionCompleted {
                    execution_id,
                    duration_ms,
                });
            }
            ExecutionStatus::Failed => {
                let error = error.clone().unwrap_or_default();
                tracing::warn!(execution_id = %execution_id, error = error.as_str(), "execution failed");
                self.inner
                    .event_bus
                    .publish(ExecutionEvent::ExecutionFailed { execution_id, error });
            }
            ExecutionStatus::Cancelled => {
                tracing::info!(execution_id = %execution_id, "execution cancelled");
                self.inner
                    .event_bus
                    .publish(ExecutionEvent::ExecutionCancelled { execution_id });
            }
            _ => {}
        }

        if status.is_terminal() {
            self.cancel_timers(execution_id);
        }

        Ok(ExecutionOutcome {
            execution_id,
            status,
            paused_at,
            error,
            context: run.ctx.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Approval gates
    // -----------------------------------------------------------------------

    /// Apply a human decision to a pending gate and continue the walk.
    pub async fn resolve_approval(
        &self,
        execution_id: Uuid,
        step_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        self.settle_gate(execution_id, step_id, GateSettlement::Resolved(resolution))
            .await
    }

    /// Fail a pending gate with `ApprovalTimeout` and continue the walk.
    ///
    /// Called by the gate's timer; callable directly by an external scheduler.
    pub async fn expire_approval(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        self.settle_gate(execution_id, step_id, GateSettlement::Expired)
            .await
    }

    async fn settle_gate(
        &self,
        execution_id: Uuid,
        step_id: &str,
        settlement: GateSettlement,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let guard = self.lock_execution(execution_id).await;

        let record = self.inner.checkpoint.restore(execution_id).await?;
        let mut ctx = record.context();
        if ctx.is_terminal(step_id) {
            return Err(OrchestratorError::AlreadyResolved {
                execution_id,
                step_id: step_id.to_string(),
            });
        }
        if record.status.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                execution_id,
                status: record.status,
            });
        }
        // `Running` with an open gate and no live drive is a gate checkpoint
        // that never reached its `Paused` write.
        let orphaned_gate = record.status == ExecutionStatus::Running
            && ctx.pending_approval(step_id).is_some()
            && !self.inner.tokens.contains_key(&execution_id);
        if record.status != ExecutionStatus::Paused && !orphaned_gate {
            return Err(OrchestratorError::NotPaused {
                execution_id,
                status: record.status,
            });
        }
        let approval = ctx.pending_approval(step_id).cloned().ok_or_else(|| {
            OrchestratorError::NoPendingApproval {
                execution_id,
                step_id: step_id.to_string(),
            }
        })?;
        let def = self.lookup_definition(&record.definition_ref)?;

        let mut resolved_by = None;
        let result = match settlement {
            GateSettlement::Resolved(resolution) => {
                if !resolution
                    .approver_roles
                    .iter()
                    .any(|r| *r == approval.approver_role)
                {
                    return Err(OrchestratorError::ApproverNotAuthorized {
                        step_id: step_id.to_string(),
                        required_role: approval.approver_role.clone(),
                        approver_id: resolution.approver_id,
                    });
                }
                if approval.is_expired_at(Utc::now()) {
                    tracing::warn!(
                        execution_id = %execution_id,
                        step_id,
                        approver_id = resolution.approver_id.as_str(),
                        "decision arrived after the approval deadline"
                    );
                    timed_out(&approval)
                } else {
                    let result = decided(&approval, &resolution);
                    resolved_by = Some(resolution);
                    result
                }
            }
            GateSettlement::Expired => {
                tracing::warn!(execution_id = %execution_id, step_id, "approval window expired");
                timed_out(&approval)
            }
        };

        self.cancel_timer(execution_id, step_id);
        self.record_result(execution_id, &mut ctx, result).await?;

        if let Some(resolution) = resolved_by {
            tracing::info!(
                execution_id = %execution_id,
                step_id,
                decision = ?resolution.decision,
                approver_id = resolution.approver_id.as_str(),
                "approval resolved"
            );
            self.inner.event_bus.publish(ExecutionEvent::ApprovalResolved {
                execution_id,
                step_id: step_id.to_string(),
                decision: resolution.decision,
                approver_id: resolution.approver_id,
            });
        }

        let run = self.reenter(&record, def, ctx);
        drop(guard);
        self.drive(run).await
    }

    /// Spawn the timer that expires `approval` at its deadline.
    fn arm_approval_timer(&self, execution_id: Uuid, approval: &PendingApproval) {
        let Some(deadline) = approval.deadline else {
            return;
        };
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let key = (execution_id, approval.step_id.clone());
        let task_key = key.clone();
        let orchestrator = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            // Deregister first: settling the gate aborts any timer still listed.
            orchestrator.inner.timers.remove(&task_key);
            let (execution_id, step_id) = task_key;
            match orchestrator.expire_approval(execution_id, &step_id).await {
                Ok(outcome) => tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step_id.as_str(),
                    status = %outcome.status,
                    "approval timer fired"
                ),
                Err(e) => tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step_id.as_str(),
                    error = %e,
                    "approval timer found nothing to expire"
                ),
            }
        });

        tracing::debug!(
            execution_id = %execution_id,
            step_id = approval.step_id.as_str(),
            remaining_secs = remaining.as_secs(),
            "armed approval timer"
        );
        if let Some(previous) = self.inner.timers.insert(key, handle.abort_handle()) {
            previous.abort();
        }
    }

    fn cancel_timer(&self, execution_id: Uuid, step_id: &str) {
        if let Some((_, handle)) = self
            .inner
            .timers
            .remove(&(execution_id, step_id.to_string()))
        {
            handle.abort();
        }
    }

    fn cancel_timers(&self, execution_id: Uuid) {
        self.inner.timers.retain(|(id, _), handle| {
            if *id == execution_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }

    // -----------------------------------------------------------------------
    // Cancellation and progress
    // -----------------------------------------------------------------------

    /// Request cancellation.
    ///
    /// An execution being driven is signalled through its token and ends
    /// `Cancelled` once in-flight agent calls return. A paused or orphaned
    /// execution is marked `Cancelled` directly.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), OrchestratorError> {
        if self.signal_cancel(execution_id) {
            return Ok(());
        }

        let _guard = self.lock_execution(execution_id).await;
        // A resolution may have started driving while we waited for the lock.
        if self.signal_cancel(execution_id) {
            return Ok(());
        }

        let record = self.inner.checkpoint.restore(execution_id).await?;
        if record.status.is_terminal() {
            return Err(OrchestratorError::AlreadyTerminal {
                execution_id,
                status: record.status,
            });
        }

        self.inner
            .checkpoint
            .checkpoint_status(
                execution_id,
                ExecutionStatus::Cancelled,
                record.current_step_id.as_deref(),
                None,
            )
            .await?;
        self.cancel_timers(execution_id);
        self.inner
            .event_bus
            .publish(ExecutionEvent::ExecutionCancelled { execution_id });
        tracing::info!(execution_id = %execution_id, previous = %record.status, "execution cancelled");
        Ok(())
    }

    fn signal_cancel(&self, execution_id: Uuid) -> bool {
        let token = self
            .inner
            .tokens
            .get(&execution_id)
            .map(|t| t.value().clone());
        match token {
            Some(token) => {
                tracing::info!(execution_id = %execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Progress derived from the persisted record; safe to call mid-run.
    pub async fn get_progress(&self, execution_id: Uuid) -> Result<Progress, OrchestratorError> {
        Ok(self.inner.checkpoint.restore(execution_id).await?.progress())
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Serialize against other operations on the same execution.
    async fn lock_execution(&self, execution_id: Uuid) -> ExecutionLock<'_> {
        let mutex = Arc::clone(self.inner.locks.entry(execution_id).or_default().value());
        let guard = mutex.lock_owned().await;
        ExecutionLock {
            locks: &self.inner.locks,
            execution_id,
            guard: Some(guard),
        }
    }

    /// Persist a step outcome, publish its event, then add it to the context.
    async fn record_result(
        &self,
        execution_id: Uuid,
        ctx: &mut ExecutionContext,
        result: StepResult,
    ) -> Result<(), OrchestratorError> {
        if ctx.is_terminal(&result.step_id) {
            return Err(OrchestratorError::Internal(format!(
                "step '{}' already has a terminal result",
                result.step_id
            )));
        }
        self.inner.checkpoint.checkpoint_step(execution_id, &result).await?;
        self.publish_step_event(execution_id, &result);
        ctx.record(result)
            .map_err(|e| OrchestratorError::Internal(e.to_string()))
    }

    fn publish_step_event(&self, execution_id: Uuid, result: &StepResult) {
        let step_id = result.step_id.clone();
        let kind = result.failure_kind().unwrap_or(FailureKind::Internal);
        let event = match result.status {
            StepStatus::Succeeded => {
                let duration_ms = result.duration_ms.unwrap_or(0);
                tracing::info!(execution_id = %execution_id, step_id = step_id.as_str(), duration_ms, "step completed");
                ExecutionEvent::StepCompleted {
                    execution_id,
                    step_id,
                    duration_ms,
                }
            }
            StepStatus::Failed => {
                let error = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = step_id.as_str(),
                    kind = ?kind,
                    error = error.as_str(),
                    "step failed"
                );
                ExecutionEvent::StepFailed {
                    execution_id,
                    step_id,
                    kind,
                    error,
                }
            }
            StepStatus::Skipped => {
                tracing::info!(execution_id = %execution_id, step_id = step_id.as_str(), kind = ?kind, "step skipped");
                ExecutionEvent::StepSkipped {
                    execution_id,
                    step_id,
                    kind,
                }
            }
            StepStatus::Pending | StepStatus::Running | StepStatus::AwaitingApproval => return,
        };
        self.inner.event_bus.publish(event);
    }
}

/// Held per-execution mutex. Dropping it releases the mutex and removes the
/// map entry unless another caller holds or awaits it.
struct ExecutionLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    execution_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ExecutionLock<'_> {
    fn drop(&mut self) {
        // The guard owns a clone of the mutex; release it before counting.
        self.guard.take();
        self.locks
            .remove_if(&self.execution_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// First step with `required = true` that ended `Failed`, in definition order.
fn first_required_failure<'a>(
    def: &'a WorkflowDefinition,
    ctx: &ExecutionContext,
) -> Option<&'a str> {
    def.all_steps()
        .into_iter()
        .find(|s| s.required && ctx.status_of(&s.id) == Some(StepStatus::Failed))
        .map(|s| s.id.as_str())
}

fn decided(approval: &PendingApproval, resolution: &ApprovalResolution) -> StepResult {
    match resolution.decision {
        ApprovalDecision::Approve => StepResult::succeeded(
            &approval.step_id,
            json!({
                "decision": "approve",
                "approver_id": resolution.approver_id,
                "approver_role": approval.approver_role,
                "comment": resolution.comment,
            }),
            approval.requested_at,
        ),
        ApprovalDecision::Reject => {
            let message = match &resolution.comment {
                Some(comment) => format!("rejected by '{}': {comment}", resolution.approver_id),
                None => format!("rejected by '{}'", resolution.approver_id),
            };
            StepResult::failed(
                &approval.step_id,
                StepFailure::new(FailureKind::ApprovalRejected, message),
                Some(approval.requested_at),
            )
        }
    }
}

fn timed_out(approval: &PendingApproval) -> StepResult {
    StepResult::failed(
        &approval.step_id,
        StepFailure::new(
            FailureKind::ApprovalTimeout,
            format!("no decision from role '{}' within the approval window", approval.approver_role),
        ),
        Some(approval.requested_at),
    )
}
