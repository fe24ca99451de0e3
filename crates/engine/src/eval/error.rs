use thiserror::Error;

/// Failure to parse or evaluate a data-flow expression.
///
/// The engine converts this into a task `ERROR` (§4.4) with the offending
/// expression and reason recorded on the `TaskExecution`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("malformed expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("type error in '{expr}': {reason}")]
    Type { expr: String, reason: String },

    #[error("built-in function '{0}' called with wrong number of arguments")]
    Arity(String),

    #[error("unknown built-in function '{0}'")]
    UnknownFunction(String),
}
