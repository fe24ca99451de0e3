//! # Workflow Orchestration Engine
//!
//! Drives declarative, DAG-shaped workflow definitions to completion against
//! a pluggable execution store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Dispatcher                          │
//! │   (task/workflow state machines, successor & join logic)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │       ExecutionStore       │   │        DelayPoller         │
//! │ (memory or Postgres-backed)│   │  (drains the delay queue)  │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! A [`spec::WorkflowSpec`] is a pure, validated description of a workflow's
//! task graph. Starting it produces a [`domain::WorkflowExecution`], which
//! the [`dispatch::Dispatcher`] advances one [`domain::DispatchEvent`] at a
//! time against an [`store::ExecutionStore`]. Task inputs, successor
//! conditions, and published outputs are all [`eval`] expressions evaluated
//! against the execution's accumulated context.

pub mod config;
pub mod delay;
pub mod dispatch;
pub mod domain;
pub mod eval;
pub mod spec;
pub mod store;

/// Common imports for constructing and driving a workflow engine instance.
pub mod prelude {
    pub use crate::config::{EngineConfig, StoreBackend};
    pub use crate::delay::{DelayPoller, DelayPollerConfig};
    pub use crate::dispatch::{Dispatcher, DispatchError};
    pub use crate::domain::{
        ActionExecution, DispatchEvent, DispatchEventKind, ExecutionState, TaskExecution,
        WorkflowExecution,
    };
    pub use crate::eval::{evaluate, EvalContext, ExpressionError};
    pub use crate::spec::{parse_workflow_spec, SpecError, WorkflowSpec};
    pub use crate::store::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError};
}
