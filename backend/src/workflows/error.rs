// Workflow engine error taxonomy

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A trigger condition could not be evaluated. Caught per workflow during
    /// trigger matching so one bad definition never blocks the others.
    #[error("condition evaluation failed: {0}")]
    ConditionEvaluation(String),

    /// A collaborator call failed. The scheduler retries these with backoff
    /// up to the configured cap, then marks the execution failed.
    #[error("step '{step_id}' failed: {message}")]
    ActionExecution { step_id: String, message: String },

    /// Structural problem in a workflow definition. Rejected at activation
    /// time; executions never encounter an unvalidated graph.
    #[error("workflow graph error: {0}")]
    GraphIntegrity(String),

    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    /// Disallowed lifecycle change, such as editing an active workflow or
    /// activating an archived one.
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("execution references unknown step '{0}'")]
    UnknownStep(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("definition error: {0}")]
    Definition(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
