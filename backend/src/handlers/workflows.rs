use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::workflows::model::Workflow;
use crate::workflows::store::WorkflowDraft;
use crate::workflows::TriggerEvent;
use crate::AppState;

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/:id", get(get_workflow).put(update_workflow))
        .route("/workflows/:id/activate", post(activate_workflow))
        .route("/workflows/:id/pause", post(pause_workflow))
        .route("/workflows/:id/archive", post(archive_workflow))
        .route("/workflows/:id/enroll", post(enroll))
        .route("/events", post(ingest_event))
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowRequest {
    org_id: Uuid,
    #[serde(flatten)]
    draft: WorkflowDraft,
}

#[derive(Debug, Deserialize)]
struct OrgQuery {
    org_id: Uuid,
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> AppResult<(StatusCode, Json<Workflow>)> {
    if payload.draft.name.trim().is_empty() {
        return Err(AppError::validation_single("name", "name must not be empty"));
    }
    let workflow = state
        .store
        .create_workflow(payload.org_id, payload.draft)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrgQuery>,
) -> AppResult<Json<Vec<Workflow>>> {
    Ok(Json(state.store.list_workflows(query.org_id).await?))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Workflow>> {
    Ok(Json(state.store.get_workflow(id).await?))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(draft): Json<WorkflowDraft>,
) -> AppResult<Json<Workflow>> {
    Ok(Json(state.store.update_workflow(id, draft).await?))
}

async fn activate_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Workflow>> {
    Ok(Json(state.store.activate_workflow(id).await?))
}

async fn pause_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Workflow>> {
    Ok(Json(state.store.pause_workflow(id).await?))
}

async fn archive_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Workflow>> {
    Ok(Json(state.store.archive_workflow(id).await?))
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    entity_type: String,
    entity_id: Uuid,
    #[serde(default)]
    context: serde_json::Map<String, serde_json::Value>,
}

/// Manual enrollment. 202 with the execution id when an execution starts,
/// 200 null when enrollment is a no-op.
async fn enroll(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<EnrollRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let enrolled = state
        .enrollments
        .enroll(id, &payload.entity_type, payload.entity_id, payload.context)
        .await?;

    match enrolled {
        Some(execution_id) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "execution_id": execution_id })),
        )),
        None => Ok((StatusCode::OK, Json(serde_json::Value::Null))),
    }
}

#[derive(Debug, Deserialize)]
struct EventRequest {
    org_id: Uuid,
    event_type: String,
    entity_type: String,
    entity_id: Uuid,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Event ingestion for the trigger evaluator. Returns the execution ids
/// the event enrolled.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EventRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let event = TriggerEvent::new(
        payload.org_id,
        &payload.event_type,
        &payload.entity_type,
        payload.entity_id,
        payload.payload,
    );
    let enrolled = state.triggers.process_event(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "enrolled": enrolled })),
    ))
}
