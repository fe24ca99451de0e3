use thiserror::Error;

/// Failure to load or validate a [`crate::spec::WorkflowSpec`].
///
/// Surfaced synchronously at submission time; a spec that fails validation
/// never reaches the store and no execution is created from it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("'{0}' must be one of {1:?}, got '{2}'")]
    InvalidEnum(String, Vec<String>, String),

    #[error("direct workflow 'start-task' is not defined")]
    MissingStartTask,

    #[error("'start-task' references undefined task '{0}'")]
    UnknownStartTask(String),

    #[error("successor policy references undefined task '{0}'")]
    UnknownSuccessor(String),

    #[error("task '{0}' must declare exactly one of an action reference or a workflow reference")]
    AmbiguousTaskReference(String),

    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("task '{0}' sets 'with-items', which is not yet supported")]
    UnsupportedWithItems(String),

    #[error("{0}")]
    Other(String),
}
