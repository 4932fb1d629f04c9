//! CLI command definitions and dispatch for the `maestro` binary.
//!
//! Uses clap derive macros for argument parsing. Execution commands take the
//! execution id as their first positional argument.

pub mod agents;
pub mod render;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use maestro_types::execution::ExecutionStatus;
use uuid::Uuid;

use crate::state::AppState;

/// Run and supervise multi-agent workflows.
#[derive(Parser)]
#[command(name = "maestro", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logs (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export step spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow definition without running it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Start an execution and drive it until it finishes or pauses.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Global input as a JSON document.
        #[arg(long)]
        input: Option<String>,

        /// Agent catalog YAML (defaults to the agents the workflow references).
        #[arg(long)]
        agents: Option<PathBuf>,

        /// Keep the execution in memory instead of the data directory.
        #[arg(long)]
        ephemeral: bool,
    },

    /// List recent executions.
    #[command(alias = "ls")]
    List {
        /// Only executions in this status.
        #[arg(long)]
        status: Option<ExecutionStatus>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show progress of an execution.
    Status {
        execution_id: Uuid,
    },

    /// Show the step log of an execution.
    Steps {
        execution_id: Uuid,
    },

    /// Approve a pending approval gate and continue the execution.
    Approve {
        #[command(flatten)]
        decision: DecisionArgs,
    },

    /// Reject a pending approval gate.
    Reject {
        #[command(flatten)]
        decision: DecisionArgs,
    },

    /// Cancel a running or paused execution.
    Cancel {
        execution_id: Uuid,
    },

    /// Continue an interrupted or paused execution from its last checkpoint.
    Resume {
        execution_id: Uuid,

        /// Workflow YAML the execution was started from.
        #[arg(long)]
        workflow: PathBuf,

        /// Agent catalog YAML.
        #[arg(long)]
        agents: Option<PathBuf>,
    },

    /// List agents in a catalog.
    Agents {
        /// Path to the agent catalog YAML file.
        file: PathBuf,

        /// Only agents with this capability tag.
        #[arg(long)]
        capability: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Arguments shared by `approve` and `reject`.
#[derive(clap::Args)]
pub struct DecisionArgs {
    pub execution_id: Uuid,

    /// Id of the approval gate step.
    pub step_id: String,

    /// Workflow YAML the execution was started from.
    #[arg(long)]
    pub workflow: PathBuf,

    /// Who is deciding.
    #[arg(long)]
    pub approver: String,

    /// Role held by the approver (defaults to the role the gate asks for).
    #[arg(long)]
    pub role: Option<String>,

    #[arg(long)]
    pub comment: Option<String>,

    /// Agent catalog YAML for the steps after the gate.
    #[arg(long)]
    pub agents: Option<PathBuf>,
}

pub async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Validate { file } => workflow::validate(&file, json),
        Commands::Run {
            file,
            input,
            agents,
            ephemeral,
        } => {
            workflow::run(
                state,
                &file,
                input.as_deref(),
                agents.as_deref(),
                ephemeral,
                json,
            )
            .await
        }
        Commands::List { status, limit } => workflow::list(state, status, limit, json).await,
        Commands::Status { execution_id } => workflow::status(state, execution_id, json).await,
        Commands::Steps { execution_id } => workflow::steps(state, execution_id, json).await,
        Commands::Approve { decision } => workflow::decide(state, decision, true, json).await,
        Commands::Reject { decision } => workflow::decide(state, decision, false, json).await,
        Commands::Cancel { execution_id } => workflow::cancel(state, execution_id, json).await,
        Commands::Resume {
            execution_id,
            workflow,
            agents,
        } => workflow::resume(state, execution_id, &workflow, agents.as_deref(), json).await,
        Commands::Agents { file, capability } => {
            agents::list(&file, capability.as_deref(), json).await
        }
        Commands::Completions { .. } => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_globals() {
        let cli = Cli::try_parse_from([
            "maestro", "-vv", "--json", "run", "flow.yaml", "--input", "{\"a\":1}", "--ephemeral",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                file,
                input,
                ephemeral,
                agents,
            } => {
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(input.as_deref(), Some("{\"a\":1}"));
                assert!(ephemeral);
                assert!(agents.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_approve() {
        let id = Uuid::now_v7();
        let id_str = id.to_string();
        let cli = Cli::try_parse_from([
            "maestro",
            "approve",
            id_str.as_str(),
            "review",
            "--workflow",
            "flow.yaml",
            "--approver",
            "ana",
            "--comment",
            "ship it",
        ])
        .unwrap();
        match cli.command {
            Commands::Approve { decision } => {
                assert_eq!(decision.execution_id, id);
                assert_eq!(decision.step_id, "review");
                assert_eq!(decision.approver, "ana");
                assert!(decision.role.is_none());
                assert_eq!(decision.comment.as_deref(), Some("ship it"));
            }
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn rejects_malformed_execution_id() {
        assert!(Cli::try_parse_from(["maestro", "status", "not-a-uuid"]).is_err());
    }

    #[test]
    fn parses_status_filter() {
        let cli = Cli::try_parse_from(["maestro", "list", "--status", "paused"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                status: Some(ExecutionStatus::Paused),
                limit: 20
            }
        ));
    }

    #[test]
    fn command_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
