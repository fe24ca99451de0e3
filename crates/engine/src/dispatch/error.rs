use thiserror::Error;
use uuid::Uuid;

use crate::eval::ExpressionError;
use crate::spec::SpecError;
use crate::store::StoreError;

/// Failures from driving a workflow execution forward (§4.4, §4.5, §4.6).
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("error evaluating expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error("task '{0}' not found in workflow definition")]
    UnknownTask(String),

    #[error("rerun rejected: task '{task}' is not terminal")]
    RerunTargetNotTerminal { task: String },

    #[error("rerun rejected: downstream task '{task}' has already progressed past IDLE")]
    RerunDownstreamInProgress { task: String },

    #[error("workflow execution {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("invalid transition from {from} to {to} on {entity} {id}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: crate::domain::ExecutionState,
        to: crate::domain::ExecutionState,
    },
}
