//! Fluent builder for workflow definitions.
//!
//! Scoped constructs (`begin_parallel`/`end_parallel`,
//! `begin_conditional`/`otherwise`/`end_conditional`) are tracked on a frame
//! stack. Misuse is recorded as the first error and every later call becomes
//! a no-op, so a chain never panics; `build()` reports that first error or
//! runs the full [`validate_definition`] pass.

use maestro_types::workflow::{
    FailurePolicy, InputMapping, Predicate, StepDefinition, StepKind, WorkflowDefinition,
};

use super::definition::{ValidationError, validate_definition};

// ---------------------------------------------------------------------------
// Step specs
// ---------------------------------------------------------------------------

/// A single agent call.
#[derive(Debug, Clone)]
pub struct AgentStep {
    step: StepDefinition,
}

impl AgentStep {
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            step: StepDefinition::new(
                id,
                StepKind::Sequential {
                    agent_id: agent_id.into(),
                },
            ),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.step.name = Some(name.into());
        self
    }

    /// Map `source_field` of `source_step` into `target_field` of this step's input.
    pub fn map_input(
        mut self,
        source_step: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        self.step
            .input_mapping
            .push(InputMapping::new(source_step, source_field, target_field));
        self
    }

    /// Map the whole payload of `source_step` into `target_field`.
    pub fn map_whole(
        mut self,
        source_step: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        self.step
            .input_mapping
            .push(InputMapping::whole(source_step, target_field));
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.step.timeout_secs = Some(secs);
        self
    }

    /// A failure of this step does not fail the run.
    pub fn optional(mut self) -> Self {
        self.step.required = false;
        self
    }
}

/// Header of a parallel group opened with [`WorkflowBuilder::begin_parallel`].
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    id: String,
    max_concurrency: Option<usize>,
    failure_policy: Option<FailurePolicy>,
    guards: Vec<InputMapping>,
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_concurrency: None,
            failure_policy: None,
            guards: Vec::new(),
        }
    }

    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Override the workflow's failure policy inside this group.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Only start the group once `step_id` has succeeded.
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        self.guards.push(InputMapping::whole(step_id.clone(), step_id));
        self
    }
}

/// A human decision point.
#[derive(Debug, Clone)]
pub struct ApprovalGate {
    step: StepDefinition,
}

impl ApprovalGate {
    pub fn new(id: impl Into<String>, approver_role: impl Into<String>) -> Self {
        Self {
            step: StepDefinition::new(
                id,
                StepKind::ApprovalGate {
                    approver_role: approver_role.into(),
                    timeout_secs: None,
                    prompt: None,
                },
            ),
        }
    }

    pub fn prompt(mut self, text: impl Into<String>) -> Self {
        if let StepKind::ApprovalGate { prompt, .. } = &mut self.step.kind {
            *prompt = Some(text.into());
        }
        self
    }

    /// Resolve as `ApprovalTimeout` after `secs` without a decision.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        if let StepKind::ApprovalGate { timeout_secs, .. } = &mut self.step.kind {
            *timeout_secs = Some(secs);
        }
        self
    }

    /// Only open the gate once `step_id` has succeeded.
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        self.step
            .input_mapping
            .push(InputMapping::whole(step_id.clone(), step_id));
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

enum Frame {
    Parallel {
        group: ParallelGroup,
        children: Vec<StepDefinition>,
    },
    Conditional {
        id: String,
        predicate: Predicate,
        then_steps: Vec<StepDefinition>,
        else_steps: Vec<StepDefinition>,
        in_else: bool,
    },
}

/// Fluent construction of a [`WorkflowDefinition`].
///
/// ```ignore
/// let def = WorkflowBuilder::new("triage", "1.0.0")
///     .sequential("classify", "classifier")
///     .begin_parallel(ParallelGroup::new("enrich").max_concurrency(2))
///     .step(AgentStep::new("crm", "crm-lookup").map_input("classify", "customer", "id"))
///     .step(AgentStep::new("sentiment", "sentiment"))
///     .end_parallel()
///     .approval_gate(ApprovalGate::new("review", "lead").timeout_secs(3600))
///     .build()?;
/// ```
pub struct WorkflowBuilder {
    name: String,
    version: String,
    description: Option<String>,
    failure_policy: FailurePolicy,
    root: Vec<StepDefinition>,
    stack: Vec<Frame>,
    error: Option<ValidationError>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            failure_policy: FailurePolicy::default(),
            root: Vec::new(),
            stack: Vec::new(),
            error: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Shorthand for `.step(AgentStep::new(id, agent_id))`.
    pub fn sequential(self, id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.step(AgentStep::new(id, agent_id))
    }

    pub fn step(mut self, step: AgentStep) -> Self {
        self.push(step.step);
        self
    }

    pub fn approval_gate(mut self, gate: ApprovalGate) -> Self {
        self.push(gate.step);
        self
    }

    pub fn begin_parallel(mut self, group: ParallelGroup) -> Self {
        if self.error.is_some() {
            return self;
        }
        if self.reject_inside_parallel(&group.id) {
            return self;
        }
        self.stack.push(Frame::Parallel {
            group,
            children: Vec::new(),
        });
        self
    }

    pub fn end_parallel(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.stack.pop() {
            Some(Frame::Parallel { group, children }) => {
                let mut step = StepDefinition::new(
                    group.id,
                    StepKind::Parallel {
                        children,
                        max_concurrency: group.max_concurrency,
                        failure_policy: group.failure_policy,
                    },
                );
                step.input_mapping = group.guards;
                self.push(step);
            }
            other => {
                self.restore(other);
                self.fail(ValidationError::UnbalancedScope(
                    "end_parallel() without an open parallel group".to_string(),
                ));
            }
        }
        self
    }

    /// Open a conditional; steps until `otherwise()` form the then-branch.
    pub fn begin_conditional(mut self, id: impl Into<String>, predicate: Predicate) -> Self {
        if self.error.is_some() {
            return self;
        }
        let id = id.into();
        if self.reject_inside_parallel(&id) {
            return self;
        }
        self.stack.push(Frame::Conditional {
            id,
            predicate,
            then_steps: Vec::new(),
            else_steps: Vec::new(),
            in_else: false,
        });
        self
    }

    /// Switch to the else-branch of the innermost conditional.
    pub fn otherwise(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        let error = match self.stack.last_mut() {
            Some(Frame::Conditional { in_else, id, .. }) => {
                if *in_else {
                    Some(format!("otherwise() called twice in conditional '{id}'"))
                } else {
                    *in_else = true;
                    None
                }
            }
            _ => Some("otherwise() outside a conditional".to_string()),
        };
        if let Some(message) = error {
            self.fail(ValidationError::UnbalancedScope(message));
        }
        self
    }

    pub fn end_conditional(mut self) -> Self {
        if self.error.is_some() {
            return self;
        }
        match self.stack.pop() {
            Some(Frame::Conditional {
                id,
                predicate,
                then_steps,
                else_steps,
                ..
            }) => {
                self.push(StepDefinition::new(
                    id,
                    StepKind::Conditional {
                        predicate,
                        then_steps,
                        else_steps,
                    },
                ));
            }
            other => {
                self.restore(other);
                self.fail(ValidationError::UnbalancedScope(
                    "end_conditional() without an open conditional".to_string(),
                ));
            }
        }
        self
    }

    /// Finish the definition and run full validation.
    pub fn build(self) -> Result<WorkflowDefinition, ValidationError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(frame) = self.stack.last() {
            let open = match frame {
                Frame::Parallel { group, .. } => format!("parallel group '{}' is never closed", group.id),
                Frame::Conditional { id, .. } => format!("conditional '{id}' is never closed"),
            };
            return Err(ValidationError::UnbalancedScope(open));
        }

        let def = WorkflowDefinition {
            name: self.name,
            version: self.version,
            description: self.description,
            failure_policy: self.failure_policy,
            steps: self.root,
        };
        validate_definition(&def)?;
        Ok(def)
    }

    // -- internals ----------------------------------------------------------

    fn push(&mut self, step: StepDefinition) {
        if self.error.is_some() {
            return;
        }
        match self.stack.last_mut() {
            None => self.root.push(step),
            Some(Frame::Parallel { group, children }) => {
                if matches!(step.kind, StepKind::Sequential { .. }) {
                    children.push(step);
                } else {
                    let err = ValidationError::InvalidParallelChild {
                        group: group.id.clone(),
                        child: step.id,
                    };
                    self.fail(err);
                }
            }
            Some(Frame::Conditional {
                then_steps,
                else_steps,
                in_else,
                ..
            }) => {
                if *in_else {
                    else_steps.push(step);
                } else {
                    then_steps.push(step);
                }
            }
        }
    }

    /// Parallel groups hold only agent steps; nested scopes are rejected up front.
    fn reject_inside_parallel(&mut self, child: &str) -> bool {
        if let Some(Frame::Parallel { group, .. }) = self.stack.last() {
            let err = ValidationError::InvalidParallelChild {
                group: group.id.clone(),
                child: child.to_string(),
            };
            self.fail(err);
            return true;
        }
        false
    }

    fn restore(&mut self, frame: Option<Frame>) {
        if let Some(frame) = frame {
            self.stack.push(frame);
        }
    }

    fn fail(&mut self, err: ValidationError) {
        if self.error.is_none() {
            tracing::debug!(workflow = self.name.as_str(), error = %err, "builder misuse");
            self.error = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_chain_builds() {
        let def = WorkflowBuilder::new("chain", "1.0.0")
            .description("two steps")
            .sequential("a", "producer")
            .step(AgentStep::new("b", "consumer").map_input("a", "x", "x"))
            .build()
            .unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].input_mapping[0].source_step, "a");
        assert_eq!(def.failure_policy, FailurePolicy::AbortOnFailure);
    }

    #[test]
    fn test_nested_scopes_build_the_tree() {
        let def = WorkflowBuilder::new("tree", "0.1.0")
            .sequential("start", "agent")
            .begin_parallel(ParallelGroup::new("fan").max_concurrency(2).after("start"))
            .sequential("c1", "agent")
            .sequential("c2", "agent")
            .end_parallel()
            .begin_conditional("branch", Predicate::expression("steps.c1.output.ok"))
            .step(AgentStep::new("yes", "agent").map_whole("c2", "c2"))
            .otherwise()
            .approval_gate(ApprovalGate::new("no", "lead").timeout_secs(60).after("c1"))
            .end_conditional()
            .build()
            .unwrap();

        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.total_steps(), 7);
        match &def.steps[1].kind {
            StepKind::Parallel {
                children,
                max_concurrency,
                ..
            } => {
                assert_eq!(children.len(), 2);
                assert_eq!(*max_concurrency, Some(2));
            }
            other => panic!("expected parallel, got {other:?}"),
        }
        assert_eq!(def.steps[1].upstream_ids().collect::<Vec<_>>(), vec!["start"]);
        match &def.steps[2].kind {
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                assert_eq!(then_steps[0].id, "yes");
                assert_eq!(else_steps[0].kind.label(), "approval_gate");
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }

    #[test]
    fn test_end_without_begin() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .sequential("a", "agent")
            .end_parallel()
            .sequential("b", "agent")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnbalancedScope(_)));
    }

    #[test]
    fn test_unclosed_scope_at_build() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .begin_conditional("c", Predicate::native(|_| true))
            .sequential("a", "agent")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnbalancedScope("conditional 'c' is never closed".to_string())
        );
    }

    #[test]
    fn test_otherwise_misuse() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .sequential("a", "agent")
            .otherwise()
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnbalancedScope(_)));

        let err = WorkflowBuilder::new("bad", "1.0.0")
            .begin_conditional("c", Predicate::native(|_| true))
            .otherwise()
            .otherwise()
            .end_conditional()
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_gate_inside_parallel_rejected() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .begin_parallel(ParallelGroup::new("g"))
            .approval_gate(ApprovalGate::new("gate", "lead"))
            .end_parallel()
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidParallelChild {
                group: "g".to_string(),
                child: "gate".to_string()
            }
        );
    }

    #[test]
    fn test_first_error_wins() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .begin_parallel(ParallelGroup::new("g"))
            .begin_parallel(ParallelGroup::new("inner"))
            .end_conditional()
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParallelChild { .. }));
    }

    #[test]
    fn test_validation_runs_on_build() {
        let err = WorkflowBuilder::new("bad", "1.0.0")
            .step(AgentStep::new("a", "agent").map_input("later", "x", "x"))
            .sequential("later", "agent")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::DanglingReference { .. }));

        let err = WorkflowBuilder::new("bad", "not-semver")
            .sequential("a", "agent")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidVersion { .. }));
    }
}
