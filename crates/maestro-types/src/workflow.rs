//! Workflow definition types for the orchestration engine.
//!
//! A [`WorkflowDefinition`] is an ordered list of top-level steps. Each step is
//! either a single agent call (`Sequential`), a fan-out of agent calls
//! (`Parallel`), a predicate-selected branch (`Conditional`), or a human
//! decision point (`ApprovalGate`). Data flows between steps only through
//! [`InputMapping`] entries, which are also the edges of the dependency graph.
//!
//! Definitions can be authored through the builder in `maestro-core` or
//! loaded from YAML; both paths run the same validation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::execution::ExecutionContext;

/// Reserved `source_step` that addresses the execution's global input payload.
pub const GLOBAL_INPUT: &str = "$input";

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Immutable, validated workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    /// Semantic version of this definition.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Stable reference recorded in execution records (`name@version`).
    pub fn definition_ref(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Every step node in the tree, depth-first in definition order.
    pub fn all_steps(&self) -> Vec<&StepDefinition> {
        let mut out = Vec::new();
        collect_steps(&self.steps, &mut out);
        out
    }

    /// Number of step nodes in the tree, composites included.
    pub fn total_steps(&self) -> usize {
        self.all_steps().len()
    }

    pub fn find_step(&self, id: &str) -> Option<&StepDefinition> {
        self.all_steps().into_iter().find(|s| s.id == id)
    }
}

fn collect_steps<'a>(steps: &'a [StepDefinition], out: &mut Vec<&'a StepDefinition>) {
    for step in steps {
        out.push(step);
        match &step.kind {
            StepKind::Parallel { children, .. } => collect_steps(children, out),
            StepKind::Conditional {
                then_steps,
                else_steps,
                ..
            } => {
                collect_steps(then_steps, out);
                collect_steps(else_steps, out);
            }
            StepKind::Sequential { .. } | StepKind::ApprovalGate { .. } => {}
        }
    }
}

/// What happens to the rest of the run when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the run as `Failed` at the first failure.
    #[default]
    AbortOnFailure,
    /// Mark dependents `Skipped` and keep going with independent steps.
    ContinueWithSkip,
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single node in the workflow tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier across the whole definition.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: StepKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_mapping: Vec<InputMapping>,

    /// Per-step timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Whether a failure of this step fails the run as a whole.
    #[serde(default = "default_required", skip_serializing_if = "is_true")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            input_mapping: Vec::new(),
            timeout_secs: None,
            required: true,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Agent invoked by this step; `None` for composite kinds and gates.
    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Sequential { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    /// Step ids this step reads from, excluding the global input.
    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        self.input_mapping
            .iter()
            .filter(|m| !m.is_global())
            .map(|m| m.source_step.as_str())
    }
}

/// Discriminated step kind. Serialized as an internally tagged `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// A single agent call.
    Sequential { agent_id: String },

    /// Concurrent fan-out of agent calls joined before the next step.
    Parallel {
        children: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_policy: Option<FailurePolicy>,
    },

    /// Exactly one branch runs, selected by the predicate.
    Conditional {
        predicate: Predicate,
        #[serde(default)]
        then_steps: Vec<StepDefinition>,
        /// Empty means an implicit no-op else branch.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_steps: Vec<StepDefinition>,
    },

    /// Suspends the run until a human with `approver_role` decides.
    ApprovalGate {
        approver_role: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequential { .. } => "sequential",
            Self::Parallel { .. } => "parallel",
            Self::Conditional { .. } => "conditional",
            Self::ApprovalGate { .. } => "approval_gate",
        }
    }
}

// ---------------------------------------------------------------------------
// InputMapping
// ---------------------------------------------------------------------------

/// `(source_step, source_field) -> target_field`.
///
/// `source_field` is a dotted path into the source payload; when absent the
/// whole payload is mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMapping {
    pub source_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_field: Option<String>,
    pub target_field: String,
}

impl InputMapping {
    pub fn new(
        source_step: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self {
            source_step: source_step.into(),
            source_field: Some(source_field.into()),
            target_field: target_field.into(),
        }
    }

    /// Map the whole payload of `source_step` into `target_field`.
    pub fn whole(source_step: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_step: source_step.into(),
            source_field: None,
            target_field: target_field.into(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.source_step == GLOBAL_INPUT
    }
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Branch predicate for a conditional step.
///
/// Expressions serialize as plain strings. Native predicates exist only in
/// memory and refuse to serialize.
#[derive(Clone)]
pub enum Predicate {
    /// JEXL expression over `{input, steps: {<id>: {status, output}}}`.
    Expression(String),
    /// In-process function over the live execution context.
    Native(NativePredicate),
}

impl Predicate {
    pub fn expression(expr: impl Into<String>) -> Self {
        Self::Expression(expr.into())
    }

    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self::Native(NativePredicate(Arc::new(f)))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression(expr) => f.debug_tuple("Expression").field(expr).finish(),
            Self::Native(_) => f.write_str("Native(<fn>)"),
        }
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Expression(a), Self::Expression(b)) => a == b,
            (Self::Native(a), Self::Native(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl Serialize for Predicate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Expression(expr) => serializer.serialize_str(expr),
            Self::Native(_) => Err(serde::ser::Error::custom(
                "native predicates cannot be serialized",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Predicate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::Expression)
    }
}

/// Shared function pointer behind [`Predicate::Native`].
#[derive(Clone)]
pub struct NativePredicate(Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>);

impl NativePredicate {
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        (self.0)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: triage
version: 1.2.0
failure_policy: continue_with_skip
steps:
  - id: classify
    type: sequential
    agent_id: classifier
    input_mapping:
      - source_step: $input
        source_field: ticket.body
        target_field: text
  - id: enrich
    type: parallel
    max_concurrency: 2
    children:
      - id: history
        type: sequential
        agent_id: crm
        required: false
      - id: sentiment
        type: sequential
        agent_id: sentiment
  - id: urgent
    type: conditional
    predicate: "steps.classify.output.priority == 'high'"
    then_steps:
      - id: review
        type: approval_gate
        approver_role: lead
        timeout_secs: 60
"#;

    #[test]
    fn test_definition_yaml_shape() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(YAML).unwrap();
        assert_eq!(def.definition_ref(), "triage@1.2.0");
        assert_eq!(def.failure_policy, FailurePolicy::ContinueWithSkip);
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.total_steps(), 6);

        let classify = &def.steps[0];
        assert_eq!(classify.agent_id(), Some("classifier"));
        assert!(classify.input_mapping[0].is_global());
        assert_eq!(classify.upstream_ids().count(), 0);

        match &def.steps[1].kind {
            StepKind::Parallel {
                children,
                max_concurrency,
                failure_policy,
            } => {
                assert_eq!(children.len(), 2);
                assert_eq!(*max_concurrency, Some(2));
                assert!(failure_policy.is_none());
                assert!(!children[0].required);
                assert!(children[1].required);
            }
            other => panic!("expected parallel, got {other:?}"),
        }

        match &def.steps[2].kind {
            StepKind::Conditional {
                predicate,
                else_steps,
                ..
            } => {
                assert_eq!(
                    *predicate,
                    Predicate::expression("steps.classify.output.priority == 'high'")
                );
                assert!(else_steps.is_empty());
            }
            other => panic!("expected conditional, got {other:?}"),
        }

        let gate = def.find_step("review").unwrap();
        assert_eq!(gate.kind.label(), "approval_gate");
        assert!(gate.agent_id().is_none());
    }

    #[test]
    fn test_definition_json_roundtrip_keeps_kind_tag() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(YAML).unwrap();
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["steps"][0]["type"], "sequential");
        assert_eq!(json["steps"][2]["type"], "conditional");
        // required=true is the default and is omitted
        assert!(json["steps"][0].get("required").is_none());

        let back: WorkflowDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_native_predicate_refuses_to_serialize() {
        let step = StepDefinition::new(
            "branch",
            StepKind::Conditional {
                predicate: Predicate::native(|_| true),
                then_steps: vec![],
                else_steps: vec![],
            },
        );
        let err = serde_json::to_string(&step).unwrap_err();
        assert!(err.to_string().contains("native predicates"));
    }

    #[test]
    fn test_native_predicate_equality_is_identity() {
        let p = Predicate::native(|_| false);
        let q = p.clone();
        assert_eq!(p, q);
        assert_ne!(p, Predicate::native(|_| false));
        assert_eq!(format!("{p:?}"), "Native(<fn>)");
    }

    #[test]
    fn test_failure_policy_default_is_abort() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::AbortOnFailure);
    }
}
