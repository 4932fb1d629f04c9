//! SQLite execution store implementation.
//!
//! Implements `ExecutionStore` from `maestro-core` using sqlx with split
//! read/write pools. Each step outcome is a JSON blob in the append-only
//! `execution_step_results` table; the run-level columns live in
//! `executions`, and opened gates in `execution_approvals`.

use chrono::{DateTime, Utc};
use maestro_core::repository::execution::ExecutionStore;
use maestro_types::error::RepositoryError;
use maestro_types::execution::{ExecutionRecord, ExecutionStatus, PendingApproval, StepResult};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Most recently created executions, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions ORDER BY created_at DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let head = ExecutionRow::from_row(row).map_err(query_err)?;
            records.push(self.assemble(head).await?);
        }
        Ok(records)
    }

    /// Attach the step log and approvals to a run row.
    async fn assemble(&self, head: ExecutionRow) -> Result<ExecutionRecord, RepositoryError> {
        let id = head.id.clone();

        let step_rows = sqlx::query(
            "SELECT result FROM execution_step_results WHERE execution_id = ? ORDER BY seq ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut step_results = Vec::with_capacity(step_rows.len());
        for row in &step_rows {
            let blob: String = row.try_get("result").map_err(query_err)?;
            let result: StepResult = serde_json::from_str(&blob)
                .map_err(|e| RepositoryError::Query(format!("invalid step result JSON: {e}")))?;
            step_results.push(result);
        }

        let approval_rows = sqlx::query(
            "SELECT * FROM execution_approvals WHERE execution_id = ? ORDER BY requested_at ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut approvals = Vec::with_capacity(approval_rows.len());
        for row in &approval_rows {
            let r = ApprovalRow::from_row(row).map_err(query_err)?;
            approvals.push(r.into_approval()?);
        }

        head.into_record(step_results, approvals)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    definition_ref: String,
    status: String,
    input: String,
    current_step_id: Option<String>,
    total_steps: i64,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_ref: row.try_get("definition_ref")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            current_step_id: row.try_get("current_step_id")?,
            total_steps: row.try_get("total_steps")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(
        self,
        step_results: Vec<StepResult>,
        approvals: Vec<PendingApproval>,
    ) -> Result<ExecutionRecord, RepositoryError> {
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let input = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;
        let total_steps = usize::try_from(self.total_steps)
            .map_err(|_| RepositoryError::Query(format!("invalid total_steps: {}", self.total_steps)))?;

        Ok(ExecutionRecord {
            execution_id: parse_uuid(&self.id)?,
            definition_ref: self.definition_ref,
            status,
            input,
            step_results,
            approvals,
            current_step_id: self.current_step_id,
            total_steps,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ApprovalRow {
    step_id: String,
    approver_role: String,
    prompt: Option<String>,
    requested_at: String,
    deadline: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            approver_role: row.try_get("approver_role")?,
            prompt: row.try_get("prompt")?,
            requested_at: row.try_get("requested_at")?,
            deadline: row.try_get("deadline")?,
        })
    }

    fn into_approval(self) -> Result<PendingApproval, RepositoryError> {
        Ok(PendingApproval {
            step_id: self.step_id,
            approver_role: self.approver_role,
            prompt: self.prompt,
            requested_at: parse_datetime(&self.requested_at)?,
            deadline: self.deadline.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

// ---------------------------------------------------------------------------
// ExecutionStore impl
// ---------------------------------------------------------------------------

impl ExecutionStore for SqliteExecutionStore {
    async fn create(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let input = serde_json::to_string(&record.input)
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let total_steps = i64::try_from(record.total_steps)
            .map_err(|_| RepositoryError::Query("total_steps out of range".to_string()))?;

        sqlx::query(
            r#"INSERT INTO executions
               (id, definition_ref, status, input, current_step_id, total_steps,
                error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.definition_ref)
        .bind(record.status.as_str())
        .bind(&input)
        .bind(&record.current_step_id)
        .bind(total_steps)
        .bind(&record.error)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if duplicate {
                RepositoryError::Conflict(format!("execution {} already exists", record.execution_id))
            } else {
                query_err(e)
            }
        })?;

        for result in &record.step_results {
            self.append_step_result(&record.execution_id, result).await?;
        }
        for approval in &record.approvals {
            self.open_approval(&record.execution_id, approval).await?;
        }
        Ok(())
    }

    async fn append_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let blob =
            serde_json::to_string(result).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let id = execution_id.to_string();
        let now = format_datetime(&Utc::now());

        let inserted = sqlx::query(
            r#"INSERT INTO execution_step_results
               (execution_id, step_id, status, result, recorded_at)
               SELECT ?, ?, ?, ?, ?
               WHERE EXISTS (SELECT 1 FROM executions WHERE id = ?)"#,
        )
        .bind(&id)
        .bind(&result.step_id)
        .bind(result.status.as_str())
        .bind(&blob)
        .bind(&now)
        .bind(&id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if inserted.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query("UPDATE executions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn open_approval(
        &self,
        execution_id: &Uuid,
        approval: &PendingApproval,
    ) -> Result<(), RepositoryError> {
        let id = execution_id.to_string();
        let inserted = sqlx::query(
            r#"INSERT OR REPLACE INTO execution_approvals
               (execution_id, step_id, approver_role, prompt, requested_at, deadline)
               SELECT ?, ?, ?, ?, ?, ?
               WHERE EXISTS (SELECT 1 FROM executions WHERE id = ?)"#,
        )
        .bind(&id)
        .bind(&approval.step_id)
        .bind(&approval.approver_role)
        .bind(&approval.prompt)
        .bind(format_datetime(&approval.requested_at))
        .bind(approval.deadline.as_ref().map(format_datetime))
        .bind(&id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if inserted.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        current_step_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET status = ?, current_step_id = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(current_step_id)
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn load(&self, execution_id: &Uuid) -> Result<Option<ExecutionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => {
                let head = ExecutionRow::from_row(&row).map_err(query_err)?;
                Ok(Some(self.assemble(head).await?))
            }
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM executions WHERE status = ? ORDER BY created_at ASC")
            .bind(status.as_str())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let head = ExecutionRow::from_row(row).map_err(query_err)?;
            records.push(self.assemble(head).await?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::execution::{FailureKind, StepFailure, StepStatus};
    use serde_json::json;

    async fn test_store() -> SqliteExecutionStore {
        let dir = tempfile::tempdir().unwrap();
        let url = super::super::pool::database_url(dir.path());
        std::mem::forget(dir);
        SqliteExecutionStore::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_record() -> ExecutionRecord {
        ExecutionRecord::new(Uuid::now_v7(), "triage@1.0.0", json!({"ticket": 42}), 3)
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        let loaded = store.load(&record.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, record.execution_id);
        assert_eq!(loaded.definition_ref, "triage@1.0.0");
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.input, json!({"ticket": 42}));
        assert_eq!(loaded.total_steps, 3);
        assert!(loaded.step_results.is_empty());
        assert_eq!(loaded.created_at, record.created_at);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let store = test_store().await;
        let record = sample_record();
        store.create(&record).await.unwrap();

        let err = store.create(&record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let store = test_store().await;
        assert!(store.load(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_step_log_preserves_order() {
        let store = test_store().await;
        let record = sample_record();
        let id = record.execution_id;
        store.create(&record).await.unwrap();

        let a = StepResult::succeeded("a", json!({"x": 1}), Utc::now());
        let b = StepResult::failed(
            "b",
            StepFailure::new(FailureKind::Timeout, "step timed out after 2s"),
            Some(Utc::now()),
        );
        let c = StepResult::skipped(
            "c",
            StepFailure::new(FailureKind::UpstreamNotSucceeded, "b failed"),
        );
        for result in [&a, &b, &c] {
            store.append_step_result(&id, result).await.unwrap();
        }

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.step_results, vec![a, b, c]);
        assert_eq!(loaded.completed_steps(), 3);
    }

    #[tokio::test]
    async fn test_append_to_missing_execution_fails() {
        let store = test_store().await;
        let result = StepResult::succeeded("a", json!(null), Utc::now());
        let err = store
            .append_step_result(&Uuid::now_v7(), &result)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_set_status() {
        let store = test_store().await;
        let record = sample_record();
        let id = record.execution_id;
        store.create(&record).await.unwrap();

        store
            .set_status(&id, ExecutionStatus::Failed, Some("b"), Some("step 'b' failed"))
            .await
            .unwrap();

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.current_step_id.as_deref(), Some("b"));
        assert_eq!(loaded.error.as_deref(), Some("step 'b' failed"));

        let err = store
            .set_status(&Uuid::now_v7(), ExecutionStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_open_approval_round_trips_into_context() {
        let store = test_store().await;
        let record = sample_record();
        let id = record.execution_id;
        store.create(&record).await.unwrap();

        let requested_at = Utc::now();
        let approval = PendingApproval {
            step_id: "review".to_string(),
            approver_role: "lead".to_string(),
            prompt: Some("Ship it?".to_string()),
            requested_at,
            deadline: Some(requested_at + chrono::TimeDelta::seconds(60)),
        };
        store.open_approval(&id, &approval).await.unwrap();
        store
            .append_step_result(&id, &StepResult::awaiting_approval("review", requested_at))
            .await
            .unwrap();

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.approvals, vec![approval.clone()]);
        let ctx = loaded.context();
        assert_eq!(ctx.pending_approval("review"), Some(&approval));
        assert!(ctx.result("review").is_none());

        // A terminal entry for the gate closes it.
        let done = StepResult::succeeded("review", json!({"decision": "approve"}), requested_at);
        store.append_step_result(&id, &done).await.unwrap();
        let ctx = store.load(&id).await.unwrap().unwrap().context();
        assert!(ctx.pending_approval("review").is_none());
        assert_eq!(ctx.status_of("review"), Some(StepStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let store = test_store().await;
        let running = sample_record();
        let paused = sample_record();
        store.create(&running).await.unwrap();
        store.create(&paused).await.unwrap();
        store
            .set_status(&running.execution_id, ExecutionStatus::Running, Some("a"), None)
            .await
            .unwrap();
        store
            .set_status(&paused.execution_id, ExecutionStatus::Paused, Some("gate"), None)
            .await
            .unwrap();

        let listed = store.list_by_status(ExecutionStatus::Running).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].execution_id, running.execution_id);

        let recent = store.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
