//! Workflow engine core: definitions, the builder, and the orchestrator.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `builder` -- fluent construction with scoped parallel/conditional blocks
//! - `dag` -- input-mapping graph, cycle detection, downstream closure
//! - `context` -- input resolution against recorded step results
//! - `expression` -- JEXL evaluator for conditional predicates
//! - `checkpoint` -- durable checkpoint manager for crash recovery
//! - `orchestrator` -- the execution engine itself

pub mod builder;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod expression;
pub mod orchestrator;

pub use builder::{AgentStep, ApprovalGate, ParallelGroup, WorkflowBuilder};
pub use orchestrator::{ExecutionHandle, ExecutionOutcome, Orchestrator, OrchestratorError};
