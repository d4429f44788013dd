// Enrollment Manager - the single entry point for starting executions.
//
// All three paths funnel through here: trigger matches, the manual enroll
// endpoint, and enroll_in_workflow steps. Enrollment runs in one
// transaction that locks the workflow row, so a cancel-and-replace under
// re_enrollment can never race a second enrollment of the same entity.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::collaborators::{CollaboratorError, SubWorkflowEnroller};
use super::error::{EngineError, EngineResult};
use super::model::{ExecutionStatus, WorkflowExecution, WorkflowStatus};

pub struct EnrollmentManager {
    pool: PgPool,
}

impl EnrollmentManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enroll an entity, returning the new execution id, or None when
    /// enrollment is a no-op (workflow not active, or already enrolled with
    /// re_enrollment off).
    pub async fn enroll(
        &self,
        workflow_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        seed_context: serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let workflow = sqlx::query_as::<_, (WorkflowStatus, bool)>(
            "SELECT status, re_enrollment FROM workflows WHERE id = $1 FOR UPDATE",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let (status, re_enrollment) = workflow;
        if status != WorkflowStatus::Active {
            debug!(
                "Skipping enrollment of {} into {}: workflow is {:?}",
                entity_id, workflow_id, status
            );
            return Ok(None);
        }

        let existing = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM workflow_executions
             WHERE workflow_id = $1 AND entity_id = $2
               AND status IN ('running', 'paused')
             FOR UPDATE",
        )
        .bind(workflow_id)
        .bind(entity_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(prior) = existing {
            if !re_enrollment {
                debug!(
                    "Entity {} already enrolled in {} (execution {})",
                    entity_id, workflow_id, prior
                );
                return Ok(None);
            }
            sqlx::query(
                "UPDATE workflow_executions
                 SET status = 'cancelled', completed_at = NOW(), next_step_at = NULL
                 WHERE id = $1",
            )
            .bind(prior)
            .execute(&mut *tx)
            .await?;
            info!(
                "Re-enrollment cancelled execution {} for entity {}",
                prior, entity_id
            );
        }

        let execution =
            WorkflowExecution::new(workflow_id, entity_type, entity_id, seed_context, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, entity_type, entity_id, status,
                 current_step_id, context, next_step_at, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(&execution.entity_type)
        .bind(execution.entity_id)
        .bind(ExecutionStatus::Running)
        .bind(&execution.current_step_id)
        .bind(&execution.context)
        .bind(execution.next_step_at)
        .bind(execution.started_at)
        .execute(&mut *tx)
        .await?;

        // Counter bumped in the database, not read-modify-write, so
        // concurrent enrollments all count.
        sqlx::query("UPDATE workflows SET total_enrolled = total_enrolled + 1 WHERE id = $1")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(
            "Enrolled {} {} into workflow {} as execution {}",
            entity_type, entity_id, workflow_id, execution.id
        );
        Ok(Some(execution.id))
    }
}

#[async_trait]
impl SubWorkflowEnroller for EnrollmentManager {
    async fn enroll(
        &self,
        workflow_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        seed_context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Uuid>, CollaboratorError> {
        EnrollmentManager::enroll(self, workflow_id, entity_type, entity_id, seed_context)
            .await
            .map_err(|e| match e {
                EngineError::Database(db) => CollaboratorError::Database(db),
                other => CollaboratorError::Provider(other.to_string()),
            })
    }
}
