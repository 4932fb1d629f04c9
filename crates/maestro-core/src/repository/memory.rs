//! In-memory execution store.
//!
//! Backed by a `DashMap`. Used by tests and by the CLI's ephemeral mode;
//! records vanish with the process.

use chrono::Utc;
use dashmap::DashMap;
use maestro_types::error::RepositoryError;
use maestro_types::execution::{
    ExecutionRecord, ExecutionStatus, PendingApproval, StepResult,
};
use uuid::Uuid;

use super::execution::ExecutionStore;

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: DashMap<Uuid, ExecutionRecord>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        if self.records.contains_key(&record.execution_id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                record.execution_id
            )));
        }
        self.records.insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn append_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let mut record = self
            .records
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        record.step_results.push(result.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn open_approval(
        &self,
        execution_id: &Uuid,
        approval: &PendingApproval,
    ) -> Result<(), RepositoryError> {
        let mut record = self
            .records
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        record.approvals.push(approval.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        current_step_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut record = self
            .records
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        record.status = status;
        record.current_step_id = current_step_id.map(String::from);
        record.error = error.map(String::from);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn load(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        Ok(self.records.get(execution_id).map(|r| r.value().clone()))
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
