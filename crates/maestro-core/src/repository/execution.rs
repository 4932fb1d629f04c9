//! Execution record store trait definition.
//!
//! Defines the storage interface for execution records: the durable
//! snapshot the orchestrator writes after every step transition and reads
//! back for progress queries and recovery after a process restart. The
//! infrastructure layer (maestro-infra) implements this trait with SQLite.

use maestro_types::error::RepositoryError;
use maestro_types::execution::{
    ExecutionRecord, ExecutionStatus, PendingApproval, StepResult,
};
use uuid::Uuid;

/// Repository trait for execution records.
///
/// The step log is append-only: implementations must never rewrite or
/// reorder entries handed to [`append_step_result`](Self::append_step_result).
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync + 'static {
    /// Persist a freshly created record. Fails with `Conflict` if the id exists.
    fn create(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Append one entry to the record's step log.
    fn append_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record that an approval gate opened.
    fn open_approval(
        &self,
        execution_id: &Uuid,
        approval: &PendingApproval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update the run-level status, current step, and error message.
    fn set_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        current_step_id: Option<&str>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the full record, step log included.
    fn load(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send;

    /// List records in a given status, oldest first.
    fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send;
}

impl<S: ExecutionStore> ExecutionStore for std::sync::Arc<S> {
    fn create(
        &self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).create(record)
    }

    fn append_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).append_step_result(execution_id, result)
    }

    fn open_approval(
        &self,
        execution_id: &Uuid,
        approval: &PendingApproval,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).open_approval(execution_id, approval)
    }

    fn set_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        current_step_id: Option<&str>,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send {
        (**self).set_status(execution_id, status, current_step_id, error)
    }

    fn load(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionRecord>, RepositoryError>> + Send
    {
        (**self).load(execution_id)
    }

    fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, RepositoryError>> + Send
    {
        (**self).list_by_status(status)
    }
}
