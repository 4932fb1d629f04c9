//! Workflow execution subcommands.
//!
//! `validate` and `run` take a definition file. Everything else addresses a
//! persisted execution by id in the data directory's SQLite store.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use maestro_core::agent::AgentRegistry;
use maestro_core::repository::{ExecutionStore, InMemoryExecutionStore};
use maestro_core::workflow::definition::{WorkflowError, load_workflow_file};
use maestro_core::workflow::{ExecutionOutcome, OrchestratorError};
use maestro_types::execution::{ApprovalResolution, ExecutionStatus};
use maestro_types::workflow::WorkflowDefinition;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::DecisionArgs;
use super::render;
use crate::state::{AppState, CliOrchestrator, build_registry};

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::Validation(err) => anyhow!("Workflow validation failed: {err}"),
        other => anyhow!("Failed to load workflow {}: {other}", file.display()),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load_definition(file)?;

    if json {
        let out = json!({
            "definition": def.definition_ref(),
            "steps": def.total_steps(),
            "failure_policy": def.failure_policy,
            "valid": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(def.definition_ref()).cyan()
        );
        println!("  Steps: {}", def.total_steps());
        println!("  Failure policy: {:?}", def.failure_policy);
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run / resume / decide
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    agents: Option<&Path>,
    ephemeral: bool,
    json: bool,
) -> Result<()> {
    let def = load_definition(file)?;
    let input = match input {
        Some(raw) => serde_json::from_str::<Value>(raw).context("Invalid JSON input")?,
        None => json!({}),
    };
    let registry = build_registry(agents, Some(&def)).await?;

    if ephemeral {
        let orchestrator = state.orchestrator(InMemoryExecutionStore::new(), registry);
        run_on(&orchestrator, def, input, json).await
    } else {
        let orchestrator = state.orchestrator(state.sqlite_store().await?, registry);
        run_on(&orchestrator, def, input, json).await
    }
}

async fn run_on<S: ExecutionStore>(
    orchestrator: &CliOrchestrator<S>,
    def: WorkflowDefinition,
    input: Value,
    json: bool,
) -> Result<()> {
    let outcome = with_live_events(orchestrator, json, orchestrator.run(def, input)).await?;
    report(&outcome, json)
}

pub async fn resume(
    state: &AppState,
    execution_id: Uuid,
    workflow: &Path,
    agents: Option<&Path>,
    json: bool,
) -> Result<()> {
    let def = load_definition(workflow)?;
    let registry = build_registry(agents, Some(&def)).await?;
    let orchestrator = state.orchestrator(state.sqlite_store().await?, registry);
    orchestrator.register_definition(def)?;

    let outcome =
        with_live_events(&orchestrator, json, orchestrator.resume(execution_id)).await?;
    report(&outcome, json)
}

pub async fn decide(state: &AppState, args: DecisionArgs, approve: bool, json: bool) -> Result<()> {
    let def = load_definition(&args.workflow)?;
    let store = state.sqlite_store().await?;

    let role = match args.role {
        Some(role) => role,
        None => gate_role(&store, args.execution_id, &args.step_id).await?,
    };
    let mut resolution = if approve {
        ApprovalResolution::approve(&args.approver, role)
    } else {
        ApprovalResolution::reject(&args.approver, role)
    };
    if let Some(comment) = args.comment {
        resolution = resolution.with_comment(comment);
    }

    let registry = build_registry(args.agents.as_deref(), Some(&def)).await?;
    let orchestrator = state.orchestrator(store, registry);
    orchestrator.register_definition(def)?;

    let outcome = with_live_events(
        &orchestrator,
        json,
        orchestrator.resolve_approval(args.execution_id, &args.step_id, resolution),
    )
    .await?;
    report(&outcome, json)
}

/// Role the pending gate asks for.
async fn gate_role(store: &impl ExecutionStore, execution_id: Uuid, step_id: &str) -> Result<String> {
    let record = store
        .load(&execution_id)
        .await?
        .ok_or_else(|| anyhow!("Execution {execution_id} not found"))?;
    record
        .context()
        .pending_approval(step_id)
        .map(|gate| gate.approver_role.clone())
        .ok_or_else(|| anyhow!("Step '{step_id}' of execution {execution_id} has no pending approval"))
}

/// Drive `work` while printing progress events as they arrive.
async fn with_live_events<S, F>(
    orchestrator: &CliOrchestrator<S>,
    json: bool,
    work: F,
) -> Result<ExecutionOutcome, OrchestratorError>
where
    S: ExecutionStore,
    F: Future<Output = Result<ExecutionOutcome, OrchestratorError>>,
{
    if json {
        return work.await;
    }

    let mut events = orchestrator.subscribe();
    let done = CancellationToken::new();
    let printer = {
        let done = done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = events.recv() => match received {
                        Ok(event) => render::print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "progress output fell behind");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = done.cancelled() => break,
                }
            }
        })
    };

    let outcome = work.await;
    done.cancel();
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "progress printer stopped abnormally");
    }
    outcome
}

fn report(outcome: &ExecutionOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&render::outcome_json(outcome))?);
    } else {
        render::print_outcome(outcome);
    }
    match outcome.status {
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
            bail!("execution {} ended {}", outcome.execution_id, outcome.status)
        }
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

pub async fn list(
    state: &AppState,
    status: Option<ExecutionStatus>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let store = state.sqlite_store().await?;
    let records = match status {
        Some(status) => {
            let mut records = store.list_by_status(status).await?;
            records.truncate(limit as usize);
            records
        }
        None => store.list_recent(limit).await?,
    };

    if json {
        let out: Vec<_> = records
            .iter()
            .map(|r| {
                json!({
                    "execution_id": r.execution_id.to_string(),
                    "definition": r.definition_ref,
                    "status": r.status.as_str(),
                    "progress": r.progress().percent_complete,
                    "created_at": r.created_at.to_rfc3339(),
                    "error": r.error,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No executions found.");
        println!("  Start one with: {}", style("maestro run <file.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Started"),
        ]);
    for r in &records {
        let progress = r.progress();
        table.add_row(vec![
            Cell::new(render::short_id(&r.execution_id)),
            Cell::new(&r.definition_ref),
            render::execution_status_cell(r.status),
            Cell::new(format!("{}/{}", progress.completed_steps, progress.total_steps)),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn status(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let orchestrator = state.orchestrator(state.sqlite_store().await?, Arc::new(AgentRegistry::new()));
    let progress = orchestrator.get_progress(execution_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    let record = orchestrator
        .store()
        .load(&execution_id)
        .await?
        .ok_or(OrchestratorError::ExecutionNotFound(execution_id))?;
    render::print_record_summary(&record);
    Ok(())
}

pub async fn steps(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let store = state.sqlite_store().await?;
    let record = store
        .load(&execution_id)
        .await?
        .ok_or_else(|| anyhow!("Execution {execution_id} not found"))?;

    if json {
        let out: Vec<Value> = record.step_results.iter().map(render::step_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if record.step_results.is_empty() {
        println!();
        println!("  No steps recorded for execution {execution_id}.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  Step log for {} ({})",
        style(execution_id).cyan(),
        record.definition_ref
    );
    println!();
    println!("{}", render::steps_table(&record.step_results));
    println!();
    Ok(())
}

pub async fn cancel(state: &AppState, execution_id: Uuid, json: bool) -> Result<()> {
    let orchestrator = state.orchestrator(state.sqlite_store().await?, Arc::new(AgentRegistry::new()));
    orchestrator.cancel(execution_id).await?;

    if json {
        let out = json!({ "execution_id": execution_id.to_string(), "status": "cancelled" });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Cancelled execution {}",
            style("*").green().bold(),
            style(execution_id).cyan()
        );
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use maestro_types::config::EngineConfig;
    use maestro_types::execution::StepStatus;

    use super::*;

    fn demo(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../demos")
            .join(name)
    }

    fn state_in(dir: &Path) -> AppState {
        AppState {
            data_dir: dir.to_path_buf(),
            config: EngineConfig::default(),
        }
    }

    fn demo_input() -> Value {
        json!({ "repository": "maestro", "milestone": "1.2", "announce": true })
    }

    #[test]
    fn demo_workflow_validates() {
        validate(&demo("release-notes.yaml"), true).unwrap();
    }

    #[test]
    fn missing_file_is_reported() {
        let err = validate(Path::new("/nonexistent/flow.yaml"), true).unwrap_err();
        assert!(err.to_string().contains("Failed to load workflow"));
    }

    #[tokio::test]
    async fn demo_catalog_covers_demo_workflow() {
        let def = load_definition(&demo("release-notes.yaml")).unwrap();
        let registry = build_registry(Some(&demo("agents.yaml")), Some(&def))
            .await
            .unwrap();
        for step in def.all_steps() {
            if let Some(agent_id) = step.agent_id() {
                assert!(registry.find(agent_id).is_ok(), "missing agent {agent_id}");
            }
        }
    }

    #[tokio::test]
    async fn ephemeral_demo_run_pauses_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let def = load_definition(&demo("release-notes.yaml")).unwrap();
        let registry = build_registry(Some(&demo("agents.yaml")), Some(&def))
            .await
            .unwrap();
        let orchestrator = state.orchestrator(InMemoryExecutionStore::new(), registry);

        let paused = orchestrator.run(def, demo_input()).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.paused_at.as_deref(), Some("review"));
        assert_eq!(
            paused.payload("draft").and_then(|p| p.get("agent_id")),
            Some(&json!("legal-writer"))
        );

        let done = orchestrator
            .resolve_approval(
                paused.execution_id,
                "review",
                ApprovalResolution::approve("ana", "release-manager"),
            )
            .await
            .unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.result("announce").map(|r| r.status), Some(StepStatus::Succeeded));
        assert_eq!(done.result("archive").map(|r| r.status), Some(StepStatus::Skipped));
        assert!(!dir.path().join("maestro.db").exists());
    }

    #[tokio::test]
    async fn approval_from_a_later_invocation_finishes_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let workflow = demo("release-notes.yaml");

        let def = load_definition(&workflow).unwrap();
        let registry = build_registry(None, Some(&def)).await.unwrap();
        let first = state.orchestrator(state.sqlite_store().await.unwrap(), registry);
        let paused = first.run(def, demo_input()).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        drop(first);

        let args = DecisionArgs {
            execution_id: paused.execution_id,
            step_id: "review".into(),
            workflow,
            approver: "ana".into(),
            role: None,
            comment: Some("looks right".into()),
            agents: None,
        };
        decide(&state, args, true, true).await.unwrap();

        let record = state
            .sqlite_store()
            .await
            .unwrap()
            .load(&paused.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn rejection_exits_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let workflow = demo("release-notes.yaml");

        let def = load_definition(&workflow).unwrap();
        let registry = build_registry(None, Some(&def)).await.unwrap();
        let first = state.orchestrator(state.sqlite_store().await.unwrap(), registry);
        let paused = first.run(def, demo_input()).await.unwrap();

        let args = DecisionArgs {
            execution_id: paused.execution_id,
            step_id: "review".into(),
            workflow,
            approver: "ana".into(),
            role: Some("release-manager".into()),
            comment: None,
            agents: None,
        };
        let err = decide(&state, args, false, true).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }
}
