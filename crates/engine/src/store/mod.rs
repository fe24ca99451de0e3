//! The execution store (§4.2, §6): the transactional contract every other
//! component mutates execution state through.

mod error;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ActionExecution, DelayKind, TaskExecution, WorkflowExecution};
use crate::spec::WorkflowSpec;

pub use error::StoreError;
pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;

/// An open transaction handle.
///
/// The in-memory store's transactions are a bookkeeping no-op (each
/// mutation already takes its own lock); the Postgres store's `Postgres`
/// variant wraps a real `sqlx` transaction, so row locks taken by
/// `get_*_for_update` are held until `commit`/`rollback`.
pub enum Tx {
    Memory,
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

/// A `(deadline, kind, execution_id)` entry in the persistent delay queue
/// (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayedCall {
    pub id: Uuid,
    pub task_execution_id: Uuid,
    pub workflow_execution_id: Uuid,
    pub kind: DelayKind,
    pub deadline: DateTime<Utc>,
}

/// The transactional contract all other components mutate execution state
/// through (§4.2). All operations are idempotent where the key already
/// matches the requested state.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    async fn begin(&self) -> Result<Tx, StoreError>;
    async fn commit(&self, tx: Tx) -> Result<(), StoreError>;
    async fn rollback(&self, tx: Tx) -> Result<(), StoreError>;

    // -- Workflow definitions (registry) --------------------------------

    async fn put_workflow_definition(
        &self,
        tx: &mut Tx,
        project_id: &str,
        spec: WorkflowSpec,
    ) -> Result<(), StoreError>;

    async fn get_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<WorkflowSpec, StoreError>;

    async fn delete_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<(), StoreError>;

    // -- Workflow executions ---------------------------------------------

    async fn create_workflow_execution(
        &self,
        tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError>;

    async fn get_workflow_execution_for_update(
        &self,
        tx: &mut Tx,
        id: Uuid,
    ) -> Result<WorkflowExecution, StoreError>;

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    async fn update_workflow_execution(
        &self,
        tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError>;

    /// Cascades to every owned TaskExecution/ActionExecution and child
    /// WorkflowExecution.
    async fn delete_workflow_execution(&self, tx: &mut Tx, id: Uuid) -> Result<(), StoreError>;

    async fn list_children(&self, workflow_id: Uuid) -> Result<Vec<WorkflowExecution>, StoreError>;

    // -- Task executions ---------------------------------------------------

    async fn create_task_execution(
        &self,
        tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError>;

    async fn get_task_execution_for_update(
        &self,
        tx: &mut Tx,
        id: Uuid,
    ) -> Result<TaskExecution, StoreError>;

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError>;

    async fn update_task_execution(
        &self,
        tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError>;

    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// Tasks with a `join` policy that have not yet reached a terminal
    /// state, used by the workflow-level terminality check (§4.5).
    async fn list_pending_joins(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    // -- Action executions ---------------------------------------------------

    async fn create_action_execution(
        &self,
        tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError>;

    async fn update_action_execution(
        &self,
        tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError>;

    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError>;

    // -- Delay queue (§4.7) ------------------------------------------------

    async fn schedule_delay(&self, tx: &mut Tx, call: DelayedCall) -> Result<(), StoreError>;

    async fn cancel_delay(&self, tx: &mut Tx, task_execution_id: Uuid) -> Result<(), StoreError>;

    /// DELAYED executions whose deadline has passed, oldest first, bounded
    /// to `limit` entries.
    async fn find_ready_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelayedCall>, StoreError>;

    // -- Dispatcher idempotency (§4.6, P5) ----------------------------------

    /// Records that `event_id` has been fully applied to `workflow_execution_id`.
    /// Returns `true` if this is the first time it is recorded.
    async fn record_event_applied(
        &self,
        tx: &mut Tx,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError>;

    async fn was_event_applied(
        &self,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError>;
}
