use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::workflows::model::{WorkflowExecution, WorkflowExecutionLog};
use crate::workflows::store::ExecutionFilter;
use crate::AppState;

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workflows/:id/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/logs", get(get_execution_logs))
        .route("/executions/:id/cancel", post(cancel_execution))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<Uuid>,
    Query(filter): Query<ExecutionFilter>,
) -> AppResult<Json<Vec<WorkflowExecution>>> {
    // 404 for an unknown workflow rather than an empty list.
    state.store.get_workflow(workflow_id).await?;
    Ok(Json(
        state.store.list_executions(workflow_id, &filter).await?,
    ))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<WorkflowExecution>> {
    state
        .store
        .get_execution(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Execution {} not found", id)))
}

async fn get_execution_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<WorkflowExecutionLog>>> {
    state
        .store
        .get_execution(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("Execution {} not found", id)))?;
    Ok(Json(state.store.fetch_logs(id).await?))
}

/// Cancel a running execution. The guarded update means a tick already in
/// flight on a worker cannot write its result back afterwards.
async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    let cancelled = state.store.cancel_execution(id).await?;
    if cancelled {
        Ok(Json(serde_json::json!({ "cancelled": true })))
    } else {
        match state.store.get_execution(id).await? {
            Some(execution) => Err(AppError::conflict(format!(
                "Execution is {:?} and cannot be cancelled",
                execution.status
            ))),
            None => Err(AppError::not_found(format!("Execution {} not found", id))),
        }
    }
}
