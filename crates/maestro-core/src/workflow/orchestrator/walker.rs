//! Block walker: visits steps in definition order and dispatches by kind.

use chrono::{TimeDelta, Utc};
use futures_util::future::BoxFuture;
use maestro_types::event::ExecutionEvent;
use maestro_types::execution::{
    ExecutionStatus, FailureKind, PendingApproval, StepFailure, StepResult, StepStatus,
};
use maestro_types::workflow::{FailurePolicy, Predicate, StepDefinition, StepKind};
use serde_json::json;

use crate::agent::executor::AgentExecutor;
use crate::repository::execution::ExecutionStore;
use crate::workflow::context::{InputError, check_dependencies, resolve_step_input};
use crate::workflow::dag::MappingGraph;
use crate::workflow::expression::PredicateEvaluator;

use super::{Flow, Orchestrator, OrchestratorError, RunState};

impl<S: ExecutionStore, E: AgentExecutor> Orchestrator<S, E> {
    /// Walk a block of sibling steps until one pauses, halts, or cancels the run.
    pub(super) fn walk_block<'a>(
        &'a self,
        run: &'a mut RunState,
        steps: &'a [StepDefinition],
    ) -> BoxFuture<'a, Result<Flow, OrchestratorError>> {
        Box::pin(async move {
            for step in steps {
                if run.token.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                let flow = self.walk_step(run, step).await?;
                if flow != Flow::Continue {
                    return Ok(flow);
                }
            }
            Ok(Flow::Continue)
        })
    }

    async fn walk_step(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
    ) -> Result<Flow, OrchestratorError> {
        if let Some(status) = run.ctx.status_of(&step.id) {
            return self.revisit(run, step, status).await;
        }
        if run.ctx.pending_approval(&step.id).is_some() {
            return Ok(Flow::Paused(step.id.clone()));
        }
        if let Err(err) = check_dependencies(&run.ctx, step) {
            return self.blocked(run, step, err).await;
        }

        match &step.kind {
            StepKind::Sequential { agent_id } => self.run_sequential(run, step, agent_id).await,
            StepKind::Parallel {
                children,
                max_concurrency,
                failure_policy,
            } => {
                self.run_parallel(run, step, children, *max_concurrency, *failure_policy)
                    .await
            }
            StepKind::Conditional {
                predicate,
                then_steps,
                else_steps,
            } => {
                self.run_conditional(run, step, predicate, then_steps, else_steps)
                    .await
            }
            StepKind::ApprovalGate {
                approver_role,
                timeout_secs,
                prompt,
            } => {
                self.open_gate(run, step, approver_role, *timeout_secs, prompt.as_deref())
                    .await
            }
        }
    }

    /// A step that already has a result: only conditionals and failures matter.
    async fn revisit(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        status: StepStatus,
    ) -> Result<Flow, OrchestratorError> {
        match (&step.kind, status) {
            (
                StepKind::Conditional {
                    then_steps,
                    else_steps,
                    ..
                },
                StepStatus::Succeeded,
            ) => {
                // Re-enter the recorded branch; the predicate is never re-evaluated.
                let took_else = run
                    .ctx
                    .payload(&step.id)
                    .and_then(|p| p.get("branch"))
                    .and_then(|b| b.as_str())
                    == Some("else");
                let branch = if took_else { else_steps } else { then_steps };
                self.walk_block(run, branch).await
            }
            (_, StepStatus::Failed) => Ok(self.after_failure(run, step)),
            _ => Ok(Flow::Continue),
        }
    }

    /// A step whose dependencies are not all satisfied.
    async fn blocked(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        err: InputError,
    ) -> Result<Flow, OrchestratorError> {
        match err {
            InputError::MissingDependency { .. } => {
                tracing::error!(
                    execution_id = %run.execution_id,
                    step_id = step.id.as_str(),
                    error = %err,
                    "missing dependency at runtime"
                );
                let failure = StepFailure::new(FailureKind::MissingDependency, err.to_string());
                self.settle(run, StepResult::failed(&step.id, failure, None))
                    .await?;
                Ok(Flow::Halted(err.to_string()))
            }
            InputError::UpstreamNotSucceeded { .. } => {
                self.skip_subtree(run, step, FailureKind::UpstreamNotSucceeded, &err.to_string())
                    .await?;
                Ok(Flow::Continue)
            }
            InputError::MissingField { .. } => {
                let failure = StepFailure::new(FailureKind::InputResolution, err.to_string());
                self.settle(run, StepResult::failed(&step.id, failure, None))
                    .await?;
                Ok(self.after_failure(run, step))
            }
        }
    }

    /// Apply the workflow failure policy after `step` ended `Failed`.
    pub(super) fn after_failure(&self, run: &RunState, step: &StepDefinition) -> Flow {
        if run.token.is_cancelled() {
            return Flow::Cancelled;
        }
        if step.required && run.def.failure_policy == FailurePolicy::AbortOnFailure {
            let reason = run
                .ctx
                .result(&step.id)
                .and_then(|r| r.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown failure".to_string());
            return Flow::Halted(format!("step '{}' failed: {reason}", step.id));
        }

        let graph = MappingGraph::build(&run.def);
        let affected = graph.downstream_of(&step.id);
        if !affected.is_empty() {
            tracing::info!(
                execution_id = %run.execution_id,
                step_id = step.id.as_str(),
                affected = ?affected,
                "dependents of failed step will be skipped"
            );
        }
        Flow::Continue
    }

    pub(super) async fn settle(
        &self,
        run: &mut RunState,
        result: StepResult,
    ) -> Result<(), OrchestratorError> {
        self.record_result(run.execution_id, &mut run.ctx, result)
            .await
    }

    /// Mark `step` and every descendant without a result as `Skipped`.
    pub(super) async fn skip_subtree(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        kind: FailureKind,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let mut nodes = Vec::new();
        collect_subtree(step, &mut nodes);
        for node in nodes {
            if !run.ctx.is_terminal(&node.id) {
                let skipped = StepResult::skipped(&node.id, StepFailure::new(kind, reason));
                self.settle(run, skipped).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step kinds
    // -----------------------------------------------------------------------

    async fn run_sequential(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        agent_id: &str,
    ) -> Result<Flow, OrchestratorError> {
        let input = match resolve_step_input(&run.ctx, step) {
            Ok(input) => input,
            Err(err) => return self.blocked(run, step, err).await,
        };

        self.inner
            .checkpoint
            .checkpoint_status(
                run.execution_id,
                ExecutionStatus::Running,
                Some(&step.id),
                None,
            )
            .await?;

        let token = run.token.clone();
        let result = self
            .call_agent(run.execution_id, step, agent_id, input, &token)
            .await;
        let failed = result.status == StepStatus::Failed;
        self.settle(run, result).await?;

        Ok(if failed {
            self.after_failure(run, step)
        } else {
            Flow::Continue
        })
    }

    async fn run_conditional(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        predicate: &Predicate,
        then_steps: &[StepDefinition],
        else_steps: &[StepDefinition],
    ) -> Result<Flow, OrchestratorError> {
        let started_at = Utc::now();
        let evaluated = PredicateEvaluator::new().evaluate(predicate, &run.ctx);

        let condition_met = match evaluated {
            Ok(met) => met,
            Err(e) => {
                let failure = StepFailure::new(FailureKind::PredicateError, e.to_string());
                self.settle(run, StepResult::failed(&step.id, failure, Some(started_at)))
                    .await?;
                for branch_step in then_steps.iter().chain(else_steps) {
                    self.skip_subtree(
                        run,
                        branch_step,
                        FailureKind::BranchNotTaken,
                        "predicate could not be evaluated",
                    )
                    .await?;
                }
                return Ok(self.after_failure(run, step));
            }
        };

        let (branch, taken, untaken) = if condition_met {
            ("then", then_steps, else_steps)
        } else {
            ("else", else_steps, then_steps)
        };
        tracing::debug!(
            execution_id = %run.execution_id,
            step_id = step.id.as_str(),
            condition_met,
            branch,
            "conditional evaluated"
        );

        let decision = StepResult::succeeded(
            &step.id,
            json!({ "condition_met": condition_met, "branch": branch }),
            started_at,
        );
        self.settle(run, decision).await?;

        let reason = format!("conditional '{}' took the {branch} branch", step.id);
        for skipped in untaken {
            self.skip_subtree(run, skipped, FailureKind::BranchNotTaken, &reason)
                .await?;
        }

        self.walk_block(run, taken).await
    }

    async fn open_gate(
        &self,
        run: &mut RunState,
        step: &StepDefinition,
        approver_role: &str,
        timeout_secs: Option<u64>,
        prompt: Option<&str>,
    ) -> Result<Flow, OrchestratorError> {
        let requested_at = Utc::now();
        let deadline = timeout_secs
            .or(self.inner.config.default_approval_timeout_secs)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .and_then(|window| requested_at.checked_add_signed(window));

        let approval = PendingApproval {
            step_id: step.id.clone(),
            approver_role: approver_role.to_string(),
            prompt: prompt.map(String::from),
            requested_at,
            deadline,
        };

        self.inner
            .checkpoint
            .checkpoint_gate_opened(run.execution_id, &approval)
            .await?;
        run.ctx.add_pending_approval(approval.clone());

        self.inner.event_bus.publish(ExecutionEvent::ExecutionPaused {
            execution_id: run.execution_id,
            step_id: step.id.clone(),
            approver_role: approver_role.to_string(),
        });
        tracing::info!(
            execution_id = %run.execution_id,
            step_id = step.id.as_str(),
            approver_role,
            deadline = ?deadline,
            "execution paused for approval"
        );

        self.arm_approval_timer(run.execution_id, &approval);
        Ok(Flow::Paused(step.id.clone()))
    }
}

fn collect_subtree<'a>(step: &'a StepDefinition, out: &mut Vec<&'a StepDefinition>) {
    out.push(step);
    match &step.kind {
        StepKind::Parallel { children, .. } => {
            for child in children {
                collect_subtree(child, out);
            }
        }
        StepKind::Conditional {
            then_steps,
            else_steps,
            ..
        } => {
            for child in then_steps.iter().chain(else_steps) {
                collect_subtree(child, out);
            }
        }
        StepKind::Sequential { .. } | StepKind::ApprovalGate { .. } => {}
    }
}
