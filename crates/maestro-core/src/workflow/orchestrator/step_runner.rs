//! Agent dispatch: single agent calls and bounded parallel fan-out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use maestro_types::agent::AgentRequest;
use maestro_types::error::AgentError;
use maestro_types::event::ExecutionEvent;
use maestro_types::execution::{ExecutionStatus, FailureKind, StepFailure, StepResult, StepStatus};
use maestro_types::workflow::{FailurePolicy, StepDefinition};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::agent::executor::AgentExecutor;
use crate::repository::execution::ExecutionStore;
use crate::workflow::context::{InputError, resolve_step_input};

use super::{Flow, Orchestrator, OrchestratorError, RunState};

impl<S: ExecutionStore, E: AgentExecutor> Orchestrator<S, E> {
    /// Run one agent call and normalize every outcome into a `StepResult`.
    ///
    /// The call is bounded by the effective timeout (step, then descriptor,
    /// then engine default) and raced against `cancel`.
    pub(super) async fn call_agent(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        agent_id: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> StepResult {
        let descriptor = match self.inner.registry.find(agent_id) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let failure = StepFailure::new(FailureKind::AgentNotFound, e.to_string());
                return StepResult::failed(&step.id, failure, None);
            }
        };
        let timeout = Duration::from_secs(
            step.timeout_secs
                .or(descriptor.default_timeout_secs)
                .unwrap_or(self.inner.config.default_step_timeout_secs),
        );

        let _global_permit = match &self.inner.in_flight {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let failure = StepFailure::new(FailureKind::Cancelled, "cancelled before the agent started");
                    return StepResult::failed(&step.id, failure, None);
                }
                permit = Arc::clone(limit).acquire_owned() => permit.ok(),
            },
            None => None,
        };

        self.inner.event_bus.publish(ExecutionEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            agent_id: Some(agent_id.to_string()),
        });
        tracing::debug!(
            execution_id = %execution_id,
            step_id = step.id.as_str(),
            agent_id,
            timeout_secs = timeout.as_secs(),
            "dispatching agent"
        );

        let span = tracing::info_span!(
            "workflow.step",
            workflow.execution_id = %execution_id,
            workflow.step_id = step.id.as_str(),
            workflow.agent_id = agent_id,
        );
        let request = AgentRequest {
            execution_id,
            step_id: step.id.clone(),
            agent_id: agent_id.to_string(),
            input,
        };

        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        let call = tokio::time::timeout(
            timeout,
            self.inner.executor.execute(request, cancel.clone(), timeout),
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepFailure::new(FailureKind::Cancelled, "cancelled while running")),
            res = call.instrument(span) => match res {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(AgentError::Cancelled)) => {
                    Err(StepFailure::new(FailureKind::Cancelled, AgentError::Cancelled.to_string()))
                }
                Ok(Err(err @ AgentError::TimedOut(_))) => {
                    Err(StepFailure::new(FailureKind::Timeout, err.to_string()))
                }
                Ok(Err(err)) => Err(StepFailure::new(FailureKind::AgentError, err.to_string())),
                Err(_elapsed) => Err(StepFailure::new(
                    FailureKind::Timeout,
                    format!("step timed out after {}s", timeout.as_secs()),
                )),
            },
        };

        let mut result = match outcome {
            Ok(output) => {
                StepResult::succeeded(&step.id, output.payload, started_at).with_usage(output.usage)
            }
            Err(failure) => StepResult::failed(&step.id, failure, Some(started_at)),
        };
        result.duration_ms = Some(u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX));
        result
    }

    /// Fan a parallel group's children out on a bounded `JoinSet`.
    ///
    /// Children read the context snapshot taken before any of them start.
    /// Under `AbortOnFailure` the first required failure cancels the group
    /// token: running siblings end `Failed(Cancelled)`, queued ones `Skipped`.
    pub(super) async fn run_parallel(
        &self,
        run: &mut RunState,
        group: &StepDefinition,
        children: &[StepDefinition],
        max_concurrency: Option<usize>,
        failure_policy: Option<FailurePolicy>,
    ) -> Result<Flow, OrchestratorError> {
        let policy = failure_policy.unwrap_or(run.def.failure_policy);
        let limit = max_concurrency
            .unwrap_or(self.inner.config.max_parallelism)
            .max(1);
        let group_token = run.token.child_token();
        let started_at = Utc::now();

        self.inner
            .checkpoint
            .checkpoint_status(
                run.execution_id,
                ExecutionStatus::Running,
                Some(&group.id),
                None,
            )
            .await?;
        self.inner.event_bus.publish(ExecutionEvent::StepStarted {
            execution_id: run.execution_id,
            step_id: group.id.clone(),
            agent_id: None,
        });

        // Resolve every input up front; children never see each other's output.
        let mut dispatch = Vec::new();
        let mut abort_before_start = false;
        for child in children {
            if run.ctx.is_terminal(&child.id) {
                continue;
            }
            match resolve_step_input(&run.ctx, child) {
                Ok(input) => dispatch.push((child, input)),
                Err(err @ InputError::UpstreamNotSucceeded { .. }) => {
                    let skipped = StepResult::skipped(
                        &child.id,
                        StepFailure::new(FailureKind::UpstreamNotSucceeded, err.to_string()),
                    );
                    self.settle(run, skipped).await?;
                }
                Err(err @ InputError::MissingDependency { .. }) => {
                    tracing::error!(
                        execution_id = %run.execution_id,
                        step_id = child.id.as_str(),
                        error = %err,
                        "missing dependency at runtime"
                    );
                    let failure = StepFailure::new(FailureKind::MissingDependency, err.to_string());
                    self.settle(run, StepResult::failed(&child.id, failure, None))
                        .await?;
                    return Ok(Flow::Halted(err.to_string()));
                }
                Err(err @ InputError::MissingField { .. }) => {
                    let failure = StepFailure::new(FailureKind::InputResolution, err.to_string());
                    self.settle(run, StepResult::failed(&child.id, failure, None))
                        .await?;
                    if child.required && policy == FailurePolicy::AbortOnFailure {
                        abort_before_start = true;
                    }
                }
            }
        }

        if abort_before_start {
            for (child, _) in dispatch.drain(..) {
                let skipped = StepResult::skipped(
                    &child.id,
                    StepFailure::new(FailureKind::Cancelled, "parallel group aborted before the step started"),
                );
                self.settle(run, skipped).await?;
            }
        }

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        for (child, input) in dispatch {
            let orchestrator = self.clone();
            let child = child.clone();
            let token = group_token.clone();
            let semaphore = Arc::clone(&semaphore);
            let execution_id = run.execution_id;

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let result = match (permit, child.agent_id()) {
                    (Some(_permit), Some(agent_id)) => {
                        orchestrator
                            .call_agent(execution_id, &child, agent_id, input, &token)
                            .await
                    }
                    (Some(_), None) => StepResult::failed(
                        &child.id,
                        StepFailure::new(FailureKind::Internal, "parallel child has no agent"),
                        None,
                    ),
                    (None, _) => StepResult::skipped(
                        &child.id,
                        StepFailure::new(FailureKind::Cancelled, "parallel group aborted before the step started"),
                    ),
                };
                (child.required, result)
            });
        }

        tracing::debug!(
            execution_id = %run.execution_id,
            group_id = group.id.as_str(),
            in_flight_limit = limit,
            children = tasks.len(),
            policy = ?policy,
            "parallel group dispatched"
        );

        while let Some(joined) = tasks.join_next().await {
            let (required, result) = joined.map_err(|e| {
                OrchestratorError::Internal(format!("parallel child task failed: {e}"))
            })?;
            let abort = required
                && result.status == StepStatus::Failed
                && policy == FailurePolicy::AbortOnFailure
                && !group_token.is_cancelled();
            if abort {
                tracing::warn!(
                    execution_id = %run.execution_id,
                    group_id = group.id.as_str(),
                    step_id = result.step_id.as_str(),
                    "aborting parallel group after child failure"
                );
                group_token.cancel();
            }
            self.settle(run, result).await?;
        }

        if run.token.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let not_succeeded: Vec<&str> = children
            .iter()
            .filter(|c| c.required && run.ctx.status_of(&c.id) != Some(StepStatus::Succeeded))
            .map(|c| c.id.as_str())
            .collect();
        let statuses: serde_json::Map<String, Value> = children
            .iter()
            .map(|c| {
                let status = run.ctx.status_of(&c.id).map(|s| s.as_str());
                (c.id.clone(), json!(status))
            })
            .collect();

        let group_failed = !not_succeeded.is_empty();
        let result = if group_failed {
            let message = format!(
                "{} of {} children did not succeed: {}",
                not_succeeded.len(),
                children.len(),
                not_succeeded.join(", ")
            );
            StepResult::failed(
                &group.id,
                StepFailure::new(FailureKind::ChildFailed, message),
                Some(started_at),
            )
        } else {
            StepResult::succeeded(&group.id, json!({ "children": statuses }), started_at)
        };
        self.settle(run, result).await?;

        Ok(if group_failed {
            self.after_failure(run, group)
        } else {
            Flow::Continue
        })
    }
}
