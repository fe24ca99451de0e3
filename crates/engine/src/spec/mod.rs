//! The spec model: pure, immutable, validated representations of
//! workflows and tasks.
//!
//! This is the in-memory shape a validated document is loaded into; the
//! document parser itself (YAML/JSON in, `WorkflowSpec` out) is the thin
//! collaborator sketched in [`crate::spec::parse`].

mod error;
mod parse;
mod task;
mod workflow;

pub use error::SpecError;
pub use parse::parse_workflow_spec;
pub use task::{JoinSpec, RetrySpec, Successor, SuccessorPolicies, TaskReference, TaskSpec};
pub use workflow::{ParameterSpec, WorkflowSpec, WorkflowType};
