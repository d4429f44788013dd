// Collaborator contracts - narrow interfaces the engine calls out through.
//
// The engine owns none of these side effects. Implementations must be
// idempotent for a given idempotency key (execution_id:step_id) because a
// crash can land between the external call and the state write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Form,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub subject: Option<String>,
    pub body: String,
    /// Provider-side template variables (e.g. form links).
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryStatus {
    Sent,
    Queued,
    Rejected,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingSender: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        to: &str,
        message: OutboundMessage,
        idempotency_key: &str,
    ) -> Result<DeliveryStatus, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordMutator: Send + Sync {
    async fn update_field(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), CollaboratorError>;

    async fn add_tag(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        tag: &str,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<WebhookResponse, CollaboratorError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskCreator: Send + Sync {
    async fn create(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        title: &str,
        assignee: Option<Uuid>,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, CollaboratorError>;
}

/// Loops an `enroll_in_workflow` step back into the Enrollment Manager
/// without the interpreter depending on it directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubWorkflowEnroller: Send + Sync {
    async fn enroll(
        &self,
        workflow_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        seed_context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<Uuid>, CollaboratorError>;
}

/// Bundle handed to the interpreter.
#[derive(Clone)]
pub struct Collaborators {
    pub messaging: Arc<dyn MessagingSender>,
    pub records: Arc<dyn RecordMutator>,
    pub webhooks: Arc<dyn WebhookCaller>,
    pub tasks: Arc<dyn TaskCreator>,
    pub enroller: Arc<dyn SubWorkflowEnroller>,
}

// ===== Production implementations =====

/// Webhook caller over reqwest with a per-call timeout. Non-2xx responses
/// are returned to the interpreter, which logs the step as failed without
/// any HTTP-level retry here.
pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookCaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn post(
        &self,
        url: &str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<WebhookResponse, CollaboratorError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollaboratorError::Timeout(timeout)
                } else {
                    CollaboratorError::Provider(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CollaboratorError::Provider(e.to_string()))?;

        Ok(WebhookResponse { status, body })
    }
}

/// Record mutator backed by the platform's entity tables. Field names come
/// from workflow authors, so they are validated as identifiers before being
/// interpolated into the update statement.
pub struct PgRecordMutator {
    pool: PgPool,
}

impl PgRecordMutator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn identifier(name: &str) -> Result<&str, CollaboratorError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(name)
        } else {
            Err(CollaboratorError::Provider(format!(
                "invalid identifier '{}'",
                name
            )))
        }
    }

    fn table_for(entity_type: &str) -> Result<String, CollaboratorError> {
        Ok(format!("{}s", Self::identifier(entity_type)?))
    }
}

#[async_trait]
impl RecordMutator for PgRecordMutator {
    async fn update_field(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), CollaboratorError> {
        let table = Self::table_for(entity_type)?;
        let column = Self::identifier(field)?;

        let query = format!(
            "UPDATE {} SET {} = $2, updated_at = NOW() WHERE id = $1",
            table, column
        );
        sqlx::query(&query)
            .bind(entity_id)
            .bind(super::template::value_to_string(value))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn add_tag(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        tag: &str,
    ) -> Result<(), CollaboratorError> {
        Self::identifier(entity_type)?;

        sqlx::query(
            "INSERT INTO entity_tags (id, entity_type, entity_id, tag, created_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (entity_type, entity_id, tag) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(entity_type)
        .bind(entity_id)
        .bind(tag)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Task creator writing into the platform's tasks table.
pub struct PgTaskCreator {
    pool: PgPool,
}

impl PgTaskCreator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskCreator for PgTaskCreator {
    async fn create(
        &self,
        entity_type: &str,
        entity_id: Uuid,
        title: &str,
        assignee: Option<Uuid>,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, CollaboratorError> {
        let task_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO tasks (id, entity_type, entity_id, title, assignee_id, due_at, created_by_system, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, true, NOW())",
        )
        .bind(task_id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(title)
        .bind(assignee)
        .bind(due_at)
        .execute(&self.pool)
        .await?;

        info!("Created task {} for {} {}", task_id, entity_type, entity_id);
        Ok(task_id)
    }
}
