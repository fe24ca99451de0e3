use uuid::Uuid;

use crate::domain::ExecutionState;
use thiserror::Error;

/// Failures from the execution store (§4.2, §7).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow execution {0} not found")]
    WorkflowExecutionNotFound(Uuid),

    #[error("task execution {0} not found")]
    TaskExecutionNotFound(Uuid),

    #[error("action execution {0} not found")]
    ActionExecutionNotFound(Uuid),

    #[error("workflow definition '{name}' not found in namespace '{namespace}'")]
    WorkflowDefinitionNotFound { name: String, namespace: String },

    #[error(
        "workflow definition '{name}' already exists in namespace '{namespace}' for project '{project_id}'"
    )]
    DuplicateWorkflowDefinition {
        name: String,
        namespace: String,
        project_id: String,
    },

    #[error("invalid transition from {from} to {to} on {entity} {id}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("storage conflict, retry: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the caller should retry the whole handler with backoff
    /// (§4.2's failure model) rather than treat this as a terminal error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}
