//! Shared terminal rendering for executions, steps, and live events.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use maestro_core::workflow::ExecutionOutcome;
use maestro_types::event::ExecutionEvent;
use maestro_types::execution::{ExecutionRecord, ExecutionStatus, StepResult, StepStatus};
use serde_json::{Value, json};

const PREVIEW_CHARS: usize = 60;

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::DarkGrey,
        ExecutionStatus::Paused => Color::Yellow,
        ExecutionStatus::Running | ExecutionStatus::Pending => Color::Cyan,
    };
    Cell::new(status.as_str()).fg(color)
}

fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Succeeded => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
        StepStatus::AwaitingApproval => Color::Yellow,
        StepStatus::Pending | StepStatus::Running => Color::Cyan,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= PREVIEW_CHARS {
        return text;
    }
    let cut: String = text.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}...")
}

fn step_detail(result: &StepResult) -> String {
    match (&result.error, &result.payload) {
        (Some(failure), _) => failure.to_string(),
        (None, Some(payload)) => preview(payload),
        (None, None) => "-".to_string(),
    }
}

pub fn steps_table<'a>(results: impl IntoIterator<Item = &'a StepResult>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    for result in results {
        let duration = result
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&result.step_id),
            step_status_cell(result.status),
            Cell::new(duration),
            Cell::new(step_detail(result)),
        ]);
    }
    table
}

pub fn step_json(result: &StepResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

pub fn outcome_json(outcome: &ExecutionOutcome) -> Value {
    let steps: Vec<Value> = outcome.context.results().map(step_json).collect();
    json!({
        "execution_id": outcome.execution_id.to_string(),
        "status": outcome.status.as_str(),
        "paused_at": outcome.paused_at,
        "error": outcome.error,
        "steps": steps,
    })
}

/// Summary block printed after a run, resume, or approval returns.
pub fn print_outcome(outcome: &ExecutionOutcome) {
    println!();
    println!(
        "  {} Execution {} is {}",
        style("*").green().bold(),
        style(outcome.execution_id).cyan(),
        style(outcome.status.as_str()).bold()
    );
    if let Some(gate) = &outcome.paused_at {
        println!(
            "  Waiting on approval gate '{}'. Decide with: {}",
            style(gate).yellow(),
            style(format!(
                "maestro approve {} {gate} --workflow <file> --approver <id>",
                outcome.execution_id
            ))
            .dim()
        );
    }
    if let Some(error) = &outcome.error {
        println!("  Error: {}", style(error).red());
    }
    println!();
    println!("{}", steps_table(outcome.context.results()));
    println!();
}

pub fn print_record_summary(record: &ExecutionRecord) {
    let progress = record.progress();
    println!();
    println!(
        "  {} Execution {}",
        style("Workflow:").bold(),
        style(record.execution_id).cyan()
    );
    println!("  Definition: {}", record.definition_ref);
    println!("  Status:     {}", record.status);
    println!(
        "  Progress:   {}/{} steps ({:.0}%)",
        progress.completed_steps, progress.total_steps, progress.percent_complete
    );
    if let Some(step) = &progress.current_step_id {
        println!("  Current:    {step}");
    }
    for gate in record.context().pending_approvals() {
        let deadline = gate
            .deadline
            .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  Pending:    {} (role '{}', deadline {deadline})",
            style(&gate.step_id).yellow(),
            gate.approver_role
        );
        if let Some(prompt) = &gate.prompt {
            println!("              {}", style(prompt).dim());
        }
    }
    if let Some(error) = &record.error {
        println!("  Error:      {}", style(error).red());
    }
    println!("  Started:    {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:    {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
}

/// One line per progress event, as they arrive.
pub fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::ExecutionStarted {
            definition_ref,
            total_steps,
            ..
        } => println!(
            "  {} {} ({total_steps} steps)",
            style(">").cyan().bold(),
            style(definition_ref).cyan()
        ),
        ExecutionEvent::StepStarted {
            step_id, agent_id, ..
        } => match agent_id {
            Some(agent) => println!("    {} {step_id} ({agent})", style("-").dim()),
            None => println!("    {} {step_id}", style("-").dim()),
        },
        ExecutionEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => println!("    {} {step_id} {}", style("ok").green(), style(format!("{duration_ms} ms")).dim()),
        ExecutionEvent::StepFailed {
            step_id, error, ..
        } => println!("    {} {step_id}: {error}", style("failed").red()),
        ExecutionEvent::StepSkipped { step_id, kind, .. } => {
            println!("    {} {step_id} ({kind:?})", style("skipped").dim())
        }
        ExecutionEvent::ExecutionPaused {
            step_id,
            approver_role,
            ..
        } => println!(
            "  {} paused at '{step_id}' for role '{approver_role}'",
            style("||").yellow().bold()
        ),
        ExecutionEvent::ApprovalResolved {
            step_id,
            decision,
            approver_id,
            ..
        } => println!("    {} {step_id}: {decision:?} by {approver_id}", style("gate").yellow()),
        ExecutionEvent::ExecutionResumed { .. } => {
            println!("  {} resumed", style(">").cyan().bold())
        }
        ExecutionEvent::ExecutionCompleted { duration_ms, .. } => println!(
            "  {} completed in {duration_ms} ms",
            style("*").green().bold()
        ),
        ExecutionEvent::ExecutionFailed { error, .. } => {
            println!("  {} failed: {error}", style("x").red().bold())
        }
        ExecutionEvent::ExecutionCancelled { .. } => {
            println!("  {} cancelled", style("x").dim().bold())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use maestro_types::execution::{FailureKind, StepFailure};

    #[test]
    fn long_payloads_are_truncated() {
        let long = json!({ "text": "x".repeat(200) });
        let shown = preview(&long);
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview(&json!(1)), "1");
    }

    #[test]
    fn failure_detail_wins_over_payload() {
        let failed = StepResult::failed(
            "draft",
            StepFailure::new(FailureKind::Timeout, "step timed out after 5s"),
            Some(Utc::now()),
        );
        assert!(step_detail(&failed).contains("step timed out after 5s"));

        let ok = StepResult::succeeded("draft", json!({ "n": 1 }), Utc::now());
        assert_eq!(step_detail(&ok), "{\"n\":1}");
    }

    #[test]
    fn steps_table_has_one_row_per_result() {
        let results = vec![
            StepResult::succeeded("a", json!(1), Utc::now()),
            StepResult::skipped("b", StepFailure::new(FailureKind::BranchNotTaken, "else")),
        ];
        let table = steps_table(&results);
        assert_eq!(table.row_iter().count(), 2);
    }
}
