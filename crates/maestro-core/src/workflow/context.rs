//! Input resolution against the execution context.
//!
//! Turns a step's `input_mapping` into the concrete JSON payload handed to
//! the agent executor. A step may only start once every step it reads from
//! is terminal *and* succeeded; the two failure shapes are kept apart
//! because they mean different things to the orchestrator:
//!
//! - `MissingDependency`: the referenced step has no result at all. Builder
//!   validation makes this unreachable, so observing it is an invariant
//!   violation that fails the run.
//! - `UpstreamNotSucceeded`: the referenced step failed or was skipped. Under
//!   `ContinueWithSkip` the reader is skipped in turn.

use maestro_types::execution::{ExecutionContext, StepStatus};
use maestro_types::workflow::{InputMapping, StepDefinition};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("step '{step}' references '{reference}', which has no result yet")]
    MissingDependency { step: String, reference: String },

    #[error("step '{step}' depends on '{reference}', which ended {status}")]
    UpstreamNotSucceeded {
        step: String,
        reference: String,
        status: StepStatus,
    },

    #[error("step '{step}' maps '{field}' from '{reference}', but the field is absent")]
    MissingField {
        step: String,
        reference: String,
        field: String,
    },
}

/// Check that every referenced step succeeded, without building the input.
pub fn check_dependencies(
    ctx: &ExecutionContext,
    step: &StepDefinition,
) -> Result<(), InputError> {
    // Missing results take priority: they indicate a broken invariant.
    for reference in step.upstream_ids() {
        if ctx.result(reference).is_none() {
            return Err(InputError::MissingDependency {
                step: step.id.clone(),
                reference: reference.to_string(),
            });
        }
    }
    for reference in step.upstream_ids() {
        if let Some(status) = ctx.status_of(reference) {
            if status != StepStatus::Succeeded {
                return Err(InputError::UpstreamNotSucceeded {
                    step: step.id.clone(),
                    reference: reference.to_string(),
                    status,
                });
            }
        }
    }
    Ok(())
}

/// Build the agent input for `step`.
///
/// With no mappings the global input is passed through unchanged; otherwise
/// the result is an object keyed by each mapping's `target_field`.
pub fn resolve_step_input(
    ctx: &ExecutionContext,
    step: &StepDefinition,
) -> Result<Value, InputError> {
    check_dependencies(ctx, step)?;

    if step.input_mapping.is_empty() {
        return Ok(ctx.input.clone());
    }

    let mut input = serde_json::Map::new();
    for mapping in &step.input_mapping {
        let source = if mapping.is_global() {
            &ctx.input
        } else {
            // check_dependencies guarantees a succeeded result here.
            ctx.payload(&mapping.source_step).unwrap_or(&Value::Null)
        };
        let value = extract(source, mapping).ok_or_else(|| InputError::MissingField {
            step: step.id.clone(),
            reference: mapping.source_step.clone(),
            field: mapping.source_field.clone().unwrap_or_default(),
        })?;
        input.insert(mapping.target_field.clone(), value);
    }
    Ok(Value::Object(input))
}

fn extract(source: &Value, mapping: &InputMapping) -> Option<Value> {
    match mapping.source_field.as_deref() {
        None | Some("") => Some(source.clone()),
        Some(path) => lookup_path(source, path).cloned(),
    }
}

/// Follow a dotted path (`a.b.0.c`) into a JSON value.
///
/// Numeric segments index arrays; everything else indexes objects.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::execution::{FailureKind, StepFailure, StepResult};
    use maestro_types::workflow::StepKind;
    use serde_json::json;
    use uuid::Uuid;

    fn step(id: &str, mappings: Vec<InputMapping>) -> StepDefinition {
        let mut s = StepDefinition::new(
            id,
            StepKind::Sequential {
                agent_id: "agent".to_string(),
            },
        );
        s.input_mapping = mappings;
        s
    }

    fn ctx_with(results: Vec<StepResult>) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), json!({"topic": "rust", "n": [10, 20]}));
        for r in results {
            ctx.record(r).unwrap();
        }
        ctx
    }

    #[test]
    fn test_field_mapping_from_predecessor() {
        let ctx = ctx_with(vec![StepResult::succeeded("a", json!({"x": 1}), Utc::now())]);
        let b = step("b", vec![InputMapping::new("a", "x", "x")]);
        assert_eq!(resolve_step_input(&ctx, &b).unwrap(), json!({"x": 1}));
    }

    #[test]
    fn test_no_mapping_passes_global_input() {
        let ctx = ctx_with(vec![]);
        let a = step("a", vec![]);
        assert_eq!(resolve_step_input(&ctx, &a).unwrap()["topic"], "rust");
    }

    #[test]
    fn test_global_and_nested_paths() {
        let ctx = ctx_with(vec![StepResult::succeeded(
            "a",
            json!({"doc": {"sections": [{"title": "intro"}]}}),
            Utc::now(),
        )]);
        let b = step(
            "b",
            vec![
                InputMapping::new("$input", "n.1", "second"),
                InputMapping::new("a", "doc.sections.0.title", "title"),
                InputMapping::whole("a", "everything"),
            ],
        );
        let input = resolve_step_input(&ctx, &b).unwrap();
        assert_eq!(input["second"], 20);
        assert_eq!(input["title"], "intro");
        assert!(input["everything"]["doc"].is_object());
    }

    #[test]
    fn test_missing_dependency_detected() {
        let ctx = ctx_with(vec![]);
        let b = step("b", vec![InputMapping::new("a", "x", "x")]);
        assert_eq!(
            resolve_step_input(&ctx, &b).unwrap_err(),
            InputError::MissingDependency {
                step: "b".to_string(),
                reference: "a".to_string()
            }
        );
    }

    #[test]
    fn test_failed_upstream_blocks_start() {
        let ctx = ctx_with(vec![StepResult::failed(
            "a",
            StepFailure::new(FailureKind::AgentError, "boom"),
            None,
        )]);
        let b = step("b", vec![InputMapping::new("a", "x", "x")]);
        assert!(matches!(
            check_dependencies(&ctx, &b).unwrap_err(),
            InputError::UpstreamNotSucceeded {
                status: StepStatus::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_dependency_outranks_failed_upstream() {
        let ctx = ctx_with(vec![StepResult::skipped(
            "a",
            StepFailure::new(FailureKind::BranchNotTaken, "skipped"),
        )]);
        let c = step(
            "c",
            vec![InputMapping::whole("a", "a"), InputMapping::whole("b", "b")],
        );
        assert!(matches!(
            check_dependencies(&ctx, &c).unwrap_err(),
            InputError::MissingDependency { .. }
        ));
    }

    #[test]
    fn test_absent_field_is_an_error() {
        let ctx = ctx_with(vec![StepResult::succeeded("a", json!({"x": 1}), Utc::now())]);
        let b = step("b", vec![InputMapping::new("a", "y", "y")]);
        assert!(matches!(
            resolve_step_input(&ctx, &b).unwrap_err(),
            InputError::MissingField { .. }
        ));
    }

    #[test]
    fn test_lookup_path() {
        let v = json!({"a": [{"b": true}]});
        assert_eq!(lookup_path(&v, "a.0.b"), Some(&json!(true)));
        assert_eq!(lookup_path(&v, "a.1.b"), None);
        assert_eq!(lookup_path(&v, "a.x"), None);
    }
}
