//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML files and the canonical `WorkflowDefinition`,
//! validates structural constraints, and discovers workflow files on disk.
//! The builder and the YAML loader share [`validate_definition`], so a
//! definition is runnable only if it passed the same checks either way.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use maestro_types::workflow::{Predicate, StepDefinition, StepKind, WorkflowDefinition};
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Static graph and shape errors. Always fatal to `build()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow name '{0}' contains invalid characters (only alphanumeric, '-' and '_' allowed)")]
    InvalidName(String),

    #[error("invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("workflow must have at least one step")]
    EmptyWorkflow,

    #[error("step id must not be empty")]
    EmptyStepId,

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' references '{reference}', which is not declared earlier in scope")]
    DanglingReference { step: String, reference: String },

    #[error("step '{step}' in parallel group '{group}' references sibling '{reference}'")]
    IntraGroupReference {
        group: String,
        step: String,
        reference: String,
    },

    #[error("step '{step}' has an input mapping with an empty target field")]
    EmptyTargetField { step: String },

    #[error("step '{0}' must name an agent")]
    EmptyAgentId(String),

    #[error("parallel group '{group}' child '{child}' must be a sequential step")]
    InvalidParallelChild { group: String, child: String },

    #[error("parallel group '{0}' has no children")]
    EmptyParallelGroup(String),

    #[error("parallel group '{0}' concurrency must be >= 1")]
    InvalidConcurrency(String),

    #[error("conditional step '{0}' has an empty predicate expression")]
    EmptyPredicate(String),

    #[error("approval gate '{0}' must name an approver role")]
    EmptyApproverRole(String),

    #[error("step '{0}' timeout must be > 0")]
    InvalidTimeout(String),

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("unbalanced builder scope: {0}")]
    UnbalancedScope(String),
}

/// Errors that can occur during workflow loading.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
///
/// Fails for definitions that carry native predicates.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition, returning the first error in definition order.
///
/// Checks:
/// - Name is non-empty and uses only alphanumeric characters, `-`, `_`
/// - Version is valid semver
/// - At least one step exists
/// - Step ids are non-empty and unique across the whole tree
/// - Every input mapping names a step declared earlier in the same or an
///   enclosing scope (parallel children become visible after their group;
///   conditional branch steps are visible only inside their branch)
/// - Parallel children are sequential steps that do not reference each other
/// - Timeouts and concurrency limits are non-zero
/// - The mapping graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidName(def.name.clone()));
    }

    semver::Version::parse(&def.version).map_err(|e| ValidationError::InvalidVersion {
        version: def.version.clone(),
        reason: e.to_string(),
    })?;

    if def.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut seen = HashSet::new();
    let mut visible = HashSet::new();
    validate_block(&def.steps, &mut visible, &mut seen)?;

    dag::validate_acyclic(def)?;

    Ok(())
}

fn validate_block<'a>(
    steps: &'a [StepDefinition],
    visible: &mut HashSet<&'a str>,
    seen: &mut HashSet<&'a str>,
) -> Result<(), ValidationError> {
    for step in steps {
        validate_header(step, seen)?;
        check_references(step, visible, None)?;

        match &step.kind {
            StepKind::Sequential { agent_id } => {
                if agent_id.trim().is_empty() {
                    return Err(ValidationError::EmptyAgentId(step.id.clone()));
                }
            }
            StepKind::Parallel {
                children,
                max_concurrency,
                ..
            } => {
                if children.is_empty() {
                    return Err(ValidationError::EmptyParallelGroup(step.id.clone()));
                }
                if *max_concurrency == Some(0) {
                    return Err(ValidationError::InvalidConcurrency(step.id.clone()));
                }

                let group_ids: HashSet<&str> = children.iter().map(|c| c.id.as_str()).collect();
                for child in children {
                    validate_header(child, seen)?;
                    match &child.kind {
                        StepKind::Sequential { agent_id } => {
                            if agent_id.trim().is_empty() {
                                return Err(ValidationError::EmptyAgentId(child.id.clone()));
                            }
                        }
                        _ => {
                            return Err(ValidationError::InvalidParallelChild {
                                group: step.id.clone(),
                                child: child.id.clone(),
                            });
                        }
                    }
                    check_references(child, visible, Some((&step.id, &group_ids)))?;
                }
                // Children join the enclosing scope once the group has finished.
                visible.extend(children.iter().map(|c| c.id.as_str()));
            }
            StepKind::Conditional {
                predicate,
                then_steps,
                else_steps,
            } => {
                if let Predicate::Expression(expr) = predicate {
                    if expr.trim().is_empty() {
                        return Err(ValidationError::EmptyPredicate(step.id.clone()));
                    }
                }
                // Branch scopes are private to the branch.
                let mut then_scope = visible.clone();
                validate_block(then_steps, &mut then_scope, seen)?;
                let mut else_scope = visible.clone();
                validate_block(else_steps, &mut else_scope, seen)?;
            }
            StepKind::ApprovalGate {
                approver_role,
                timeout_secs,
                ..
            } => {
                if approver_role.trim().is_empty() {
                    return Err(ValidationError::EmptyApproverRole(step.id.clone()));
                }
                if *timeout_secs == Some(0) {
                    return Err(ValidationError::InvalidTimeout(step.id.clone()));
                }
            }
        }

        visible.insert(step.id.as_str());
    }
    Ok(())
}

fn validate_header<'a>(
    step: &'a StepDefinition,
    seen: &mut HashSet<&'a str>,
) -> Result<(), ValidationError> {
    if step.id.trim().is_empty() {
        return Err(ValidationError::EmptyStepId);
    }
    if !seen.insert(step.id.as_str()) {
        return Err(ValidationError::DuplicateStepId(step.id.clone()));
    }
    if step.timeout_secs == Some(0) {
        return Err(ValidationError::InvalidTimeout(step.id.clone()));
    }
    Ok(())
}

fn check_references(
    step: &StepDefinition,
    visible: &HashSet<&str>,
    group: Option<(&String, &HashSet<&str>)>,
) -> Result<(), ValidationError> {
    for mapping in &step.input_mapping {
        if mapping.target_field.trim().is_empty() {
            return Err(ValidationError::EmptyTargetField {
                step: step.id.clone(),
            });
        }
        if mapping.is_global() {
            continue;
        }
        if let Some((group_id, siblings)) = group {
            if siblings.contains(mapping.source_step.as_str()) {
                return Err(ValidationError::IntraGroupReference {
                    group: group_id.clone(),
                    step: step.id.clone(),
                    reference: mapping.source_step.clone(),
                });
            }
        }
        if !visible.contains(mapping.source_step.as_str()) {
            return Err(ValidationError::DanglingReference {
                step: step.id.clone(),
                reference: mapping.source_step.clone(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// or validate are logged and skipped.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => {
                    tracing::warn!(?path, error = %e, "skipping invalid workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
