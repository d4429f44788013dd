// Persistence for workflows, executions, and execution logs.
//
// Executions are claimed through a lease: a worker stamps lease_expires_at
// and leased_by on a batch of due rows inside a single UPDATE with a
// FOR UPDATE SKIP LOCKED subquery, so two workers never drive the same
// execution. A crashed worker's rows become claimable again once the lease
// lapses. Writes back from a tick are guarded on status = 'running' so a
// concurrent cancellation wins over a stale worker.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use super::interpreter::NewLogEntry;
use super::model::{
    CompiledWorkflow, EnrollmentType, ExecutionStatus, Step, Trigger, Workflow,
    WorkflowExecution, WorkflowExecutionLog, WorkflowRow, WorkflowStatus,
};

/// Incoming workflow definition, shared by create and update.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDraft {
    pub name: String,
    pub description: Option<String>,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub enrollment_type: EnrollmentType,
    #[serde(default)]
    pub re_enrollment: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub entity_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct WorkflowStore {
    pool: PgPool,
    // Compiled definitions are immutable per (workflow, updated_at); the
    // cache is invalidated on any write to the definition or status.
    compiled: RwLock<HashMap<Uuid, Arc<CompiledWorkflow>>>,
}

impl WorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ===== Workflow definitions =====

    pub async fn create_workflow(
        &self,
        org_id: Uuid,
        draft: WorkflowDraft,
    ) -> EngineResult<Workflow> {
        // Drafts are validated structurally up front even though activation
        // re-checks, so authors get errors at save time.
        let candidate = Workflow {
            id: Uuid::new_v4(),
            org_id,
            name: draft.name.clone(),
            description: draft.description.clone(),
            trigger: draft.trigger.clone(),
            steps: draft.steps.clone(),
            enrollment_type: draft.enrollment_type,
            re_enrollment: draft.re_enrollment,
            status: WorkflowStatus::Draft,
            total_enrolled: 0,
            total_completed: 0,
            created_at: Utc::now(),
            updated_at: None,
        };
        candidate.clone().compile()?;

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows
                (id, org_id, name, description, trigger, steps,
                 enrollment_type, re_enrollment, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'draft', $9)
            RETURNING *
            "#,
        )
        .bind(candidate.id)
        .bind(org_id)
        .bind(&candidate.name)
        .bind(&candidate.description)
        .bind(serde_json::to_value(&candidate.trigger)?)
        .bind(serde_json::to_value(&candidate.steps)?)
        .bind(candidate.enrollment_type)
        .bind(candidate.re_enrollment)
        .bind(candidate.created_at)
        .fetch_one(&self.pool)
        .await?;

        info!("Created workflow {} '{}'", row.id, row.name);
        Workflow::try_from(row)
    }

    pub async fn get_workflow(&self, id: Uuid) -> EngineResult<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))?;
        Workflow::try_from(row)
    }

    pub async fn list_workflows(&self, org_id: Uuid) -> EngineResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE org_id = $1 AND status != 'archived'
             ORDER BY created_at DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }

    /// Definition edits are only allowed while the workflow is not live.
    pub async fn update_workflow(&self, id: Uuid, draft: WorkflowDraft) -> EngineResult<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE workflows
            SET name = $2, description = $3, trigger = $4, steps = $5,
                enrollment_type = $6, re_enrollment = $7, updated_at = NOW()
            WHERE id = $1 AND status IN ('draft', 'paused')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(serde_json::to_value(&draft.trigger)?)
        .bind(serde_json::to_value(&draft.steps)?)
        .bind(draft.enrollment_type)
        .bind(draft.re_enrollment)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                self.invalidate(id).await;
                Workflow::try_from(row)
            }
            None => {
                // Distinguish a missing workflow from a live one.
                self.get_workflow(id).await?;
                Err(EngineError::InvalidTransition(
                    "pause the workflow before editing it".to_string(),
                ))
            }
        }
    }

    /// Activation compiles the definition; a workflow that does not compile
    /// never goes live.
    pub async fn activate_workflow(&self, id: Uuid) -> EngineResult<Workflow> {
        let workflow = self.get_workflow(id).await?;
        workflow.compile()?;

        self.transition(id, WorkflowStatus::Active, &["draft", "paused"])
            .await
    }

    pub async fn pause_workflow(&self, id: Uuid) -> EngineResult<Workflow> {
        self.transition(id, WorkflowStatus::Paused, &["active"]).await
    }

    pub async fn archive_workflow(&self, id: Uuid) -> EngineResult<Workflow> {
        self.transition(id, WorkflowStatus::Archived, &["draft", "active", "paused"])
            .await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: WorkflowStatus,
        from: &[&str],
    ) -> EngineResult<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            "UPDATE workflows SET status = $2, updated_at = NOW()
             WHERE id = $1 AND status::text = ANY($3)
             RETURNING *",
        )
        .bind(id)
        .bind(to)
        .bind(from.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                self.invalidate(id).await;
                info!("Workflow {} is now {:?}", id, to);
                Workflow::try_from(row)
            }
            None => {
                let current = self.get_workflow(id).await?;
                Err(EngineError::InvalidTransition(format!(
                    "cannot move workflow from {:?} to {:?}",
                    current.status, to
                )))
            }
        }
    }

    /// Active workflows for one tenant, used by trigger matching.
    pub async fn active_workflows(&self, org_id: Uuid) -> EngineResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows WHERE org_id = $1 AND status = 'active'",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }

    /// Active workflows with a schedule trigger, across all tenants. The
    /// schedule ticker owns cron matching; this only narrows the scan.
    pub async fn active_scheduled_workflows(&self) -> EngineResult<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(
            "SELECT * FROM workflows
             WHERE status = 'active' AND trigger->>'type' = 'schedule'",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Workflow::try_from).collect()
    }

    pub async fn bump_completed(&self, workflow_id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET total_completed = total_completed + 1 WHERE id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Compiled-definition cache =====

    pub async fn compiled(&self, workflow_id: Uuid) -> EngineResult<Arc<CompiledWorkflow>> {
        if let Some(found) = self.compiled.read().await.get(&workflow_id) {
            return Ok(found.clone());
        }

        let compiled = Arc::new(self.get_workflow(workflow_id).await?.compile()?);
        self.compiled
            .write()
            .await
            .insert(workflow_id, compiled.clone());
        Ok(compiled)
    }

    pub async fn invalidate(&self, workflow_id: Uuid) {
        self.compiled.write().await.remove(&workflow_id);
    }

    // ===== Executions =====

    /// Claim up to `batch` due executions for this worker. The lease keeps
    /// other workers off the rows; SKIP LOCKED keeps concurrent claimers
    /// from serializing on each other.
    pub async fn claim_due(
        &self,
        worker_id: &str,
        batch: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

        let claimed = sqlx::query_as::<_, WorkflowExecution>(
            r#"
            UPDATE workflow_executions
            SET lease_expires_at = $1, leased_by = $2
            WHERE id IN (
                SELECT id FROM workflow_executions
                WHERE status = 'running'
                  AND next_step_at IS NOT NULL
                  AND next_step_at <= $3
                  AND (lease_expires_at IS NULL OR lease_expires_at <= $3)
                ORDER BY next_step_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(lease_until)
        .bind(worker_id)
        .bind(now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;

        if !claimed.is_empty() {
            debug!("Worker {} claimed {} executions", worker_id, claimed.len());
        }
        Ok(claimed)
    }

    /// Write back a ticked execution. The status guard means a cancellation
    /// that landed mid-tick wins; the stale result is discarded and the
    /// caller is told so.
    pub async fn persist_step_result(
        &self,
        execution: &WorkflowExecution,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, current_step_id = $3, context = $4,
                next_step_at = $5, completed_at = $6, error_message = $7,
                lease_expires_at = NULL, leased_by = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution.id)
        .bind(execution.status)
        .bind(&execution.current_step_id)
        .bind(&execution.context)
        .bind(execution.next_step_at)
        .bind(execution.completed_at)
        .bind(&execution.error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(
        &self,
        execution_id: Uuid,
        context: &serde_json::Value,
        message: &str,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'failed', context = $2, error_message = $3,
                completed_at = NOW(), next_step_at = NULL,
                lease_expires_at = NULL, leased_by = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(context)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel_execution(&self, execution_id: Uuid) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'cancelled', completed_at = NOW(), next_step_at = NULL
            WHERE id = $1 AND status IN ('running', 'paused')
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_execution(&self, id: Uuid) -> EngineResult<Option<WorkflowExecution>> {
        let execution = sqlx::query_as::<_, WorkflowExecution>(
            "SELECT * FROM workflow_executions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        workflow_id: Uuid,
        filter: &ExecutionFilter,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let executions = sqlx::query_as::<_, WorkflowExecution>(
            r#"
            SELECT * FROM workflow_executions
            WHERE workflow_id = $1
              AND ($2::execution_status IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR entity_id = $3)
            ORDER BY started_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
            .bind(workflow_id)
            .bind(filter.status)
            .bind(filter.entity_id)
            .bind(filter.limit.unwrap_or(50).clamp(1, 200))
            .bind(filter.offset.unwrap_or(0).max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(executions)
    }

    // ===== Execution logs =====

    pub async fn append_logs(
        &self,
        execution_id: Uuid,
        logs: &[NewLogEntry],
    ) -> EngineResult<()> {
        for entry in logs {
            sqlx::query(
                r#"
                INSERT INTO workflow_execution_logs
                    (id, execution_id, step_id, step_type, status,
                     input, output, error_message, executed_at, duration_ms)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(execution_id)
            .bind(&entry.step_id)
            .bind(entry.step_type)
            .bind(entry.status)
            .bind(&entry.input)
            .bind(&entry.output)
            .bind(&entry.error_message)
            .bind(entry.executed_at)
            .bind(entry.duration_ms)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn fetch_logs(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<Vec<WorkflowExecutionLog>> {
        let logs = sqlx::query_as::<_, WorkflowExecutionLog>(
            "SELECT * FROM workflow_execution_logs
             WHERE execution_id = $1
             ORDER BY seq",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}
