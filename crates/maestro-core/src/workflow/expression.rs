//! Predicate evaluation for conditional steps.
//!
//! Expression predicates are JEXL, evaluated by `jexl_eval::Evaluator` with a
//! small set of standard transforms against the context's expression scope
//! (`{input, steps: {<id>: {status, output}}}`). Native predicates are plain
//! Rust closures over the live `ExecutionContext`.
//!
//! Payloads are always passed as context objects, never interpolated into
//! expression strings.

use maestro_types::execution::ExecutionContext;
use maestro_types::workflow::Predicate;
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct PredicateEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl PredicateEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate a predicate against the current context.
    pub fn evaluate(
        &self,
        predicate: &Predicate,
        ctx: &ExecutionContext,
    ) -> Result<bool, ExpressionError> {
        match predicate {
            Predicate::Native(f) => Ok(f.evaluate(ctx)),
            Predicate::Expression(expr) => self.evaluate_bool(expr, &ctx.to_expression_scope()),
        }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(truthy(&result))
    }
}

impl Default for PredicateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::execution::StepResult;
    use uuid::Uuid;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(Uuid::now_v7(), json!({"priority": "HIGH", "tags": ["a", "b"]}));
        ctx.record(StepResult::succeeded(
            "score",
            json!({"value": 0.8, "label": "spam"}),
            Utc::now(),
        ))
        .unwrap();
        ctx
    }

    #[test]
    fn test_expression_over_step_output() {
        let eval = PredicateEvaluator::new();
        let p = Predicate::expression("steps.score.output.value > 0.5");
        assert!(eval.evaluate(&p, &ctx()).unwrap());

        let p = Predicate::expression("steps.score.output.label == 'ham'");
        assert!(!eval.evaluate(&p, &ctx()).unwrap());
    }

    #[test]
    fn test_expression_over_status_and_input() {
        let eval = PredicateEvaluator::new();
        let p = Predicate::expression("steps.score.status == 'succeeded' && input.priority|lower == 'high'");
        assert!(eval.evaluate(&p, &ctx()).unwrap());
    }

    #[test]
    fn test_transforms() {
        let eval = PredicateEvaluator::new();
        let scope = ctx().to_expression_scope();
        assert!(eval.evaluate_bool("input.tags|length == 2", &scope).unwrap());
        assert!(eval.evaluate_bool("input.tags|contains('b')", &scope).unwrap());
        assert!(eval.evaluate_bool("steps.missing|not", &scope).unwrap());
    }

    #[test]
    fn test_native_predicate_sees_context() {
        let eval = PredicateEvaluator::new();
        let p = Predicate::native(|ctx| ctx.payload("score").is_some());
        assert!(eval.evaluate(&p, &ctx()).unwrap());
    }

    #[test]
    fn test_invalid_expression_errors() {
        let eval = PredicateEvaluator::new();
        let p = Predicate::expression("steps.score.output.value >");
        assert!(matches!(
            eval.evaluate(&p, &ctx()).unwrap_err(),
            ExpressionError::EvalFailed(_)
        ));
        assert!(matches!(
            eval.evaluate_bool("true", &json!([1])).unwrap_err(),
            ExpressionError::InvalidContext(_)
        ));
    }
}
