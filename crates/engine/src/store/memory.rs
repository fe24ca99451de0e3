//! In-memory [`ExecutionStore`] for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{DelayedCall, ExecutionStore, StoreError, Tx};
use crate::domain::{ActionExecution, TaskExecution, WorkflowExecution};
use crate::spec::WorkflowSpec;

struct DefinitionKey {
    name: String,
    namespace: String,
    project_id: String,
}

impl DefinitionKey {
    fn matches(&self, name: &str, namespace: &str, project_id: &str) -> bool {
        self.name == name && self.namespace == namespace && self.project_id == project_id
    }
}

#[derive(Default)]
struct Inner {
    workflow_executions: HashMap<Uuid, WorkflowExecution>,
    task_executions: HashMap<Uuid, TaskExecution>,
    action_executions: HashMap<Uuid, ActionExecution>,
    definitions: Vec<(DefinitionKey, WorkflowSpec)>,
    delays: HashMap<Uuid, DelayedCall>,
    applied_events: std::collections::HashSet<(Uuid, Uuid)>,
}

/// Stores all state behind a single [`parking_lot::RwLock`]. Transactions
/// are a no-op marker: every mutation already takes the lock for its own
/// duration, so there is nothing to hold across `begin`/`commit`.
pub struct InMemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn begin(&self) -> Result<Tx, StoreError> {
        Ok(Tx::Memory)
    }

    async fn commit(&self, _tx: Tx) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(&self, _tx: Tx) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put_workflow_definition(
        &self,
        _tx: &mut Tx,
        project_id: &str,
        spec: WorkflowSpec,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let (name, namespace, _version) = spec.identity();
        let (name, namespace) = (name.to_string(), namespace.to_string());
        if inner
            .definitions
            .iter()
            .any(|(k, _)| k.matches(&name, &namespace, project_id))
        {
            return Err(StoreError::DuplicateWorkflowDefinition {
                name,
                namespace,
                project_id: project_id.to_string(),
            });
        }
        inner.definitions.push((
            DefinitionKey {
                name,
                namespace,
                project_id: project_id.to_string(),
            },
            spec,
        ));
        Ok(())
    }

    async fn get_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<WorkflowSpec, StoreError> {
        let inner = self.inner.read();
        inner
            .definitions
            .iter()
            .find(|(k, _)| k.matches(name, namespace, project_id))
            .map(|(_, spec)| spec.clone())
            .ok_or_else(|| StoreError::WorkflowDefinitionNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })
    }

    async fn delete_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let before = inner.definitions.len();
        inner
            .definitions
            .retain(|(k, _)| !k.matches(name, namespace, project_id));
        if inner.definitions.len() == before {
            return Err(StoreError::WorkflowDefinitionNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    async fn create_workflow_execution(
        &self,
        _tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .workflow_executions
            .insert(execution.id, execution);
        Ok(())
    }

    async fn get_workflow_execution_for_update(
        &self,
        _tx: &mut Tx,
        id: Uuid,
    ) -> Result<WorkflowExecution, StoreError> {
        self.get_workflow_execution(id).await
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.inner
            .read()
            .workflow_executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowExecutionNotFound(id))
    }

    async fn update_workflow_execution(
        &self,
        _tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflow_executions.contains_key(&execution.id) {
            return Err(StoreError::WorkflowExecutionNotFound(execution.id));
        }
        inner.workflow_executions.insert(execution.id, execution);
        Ok(())
    }

    async fn delete_workflow_execution(&self, _tx: &mut Tx, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .workflow_executions
            .remove(&id)
            .ok_or(StoreError::WorkflowExecutionNotFound(id))?;

        let task_ids: Vec<Uuid> = inner
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == id)
            .map(|t| t.id)
            .collect();
        for task_id in &task_ids {
            inner.task_executions.remove(task_id);
            inner
                .action_executions
                .retain(|_, a| a.task_execution_id != *task_id);
        }

        let child_ids: Vec<Uuid> = inner
            .workflow_executions
            .values()
            .filter(|w| task_ids.contains(&w.parent_task_id.unwrap_or(Uuid::nil())))
            .map(|w| w.id)
            .collect();
        for child_id in child_ids {
            inner.workflow_executions.remove(&child_id);
        }

        Ok(())
    }

    async fn list_children(&self, workflow_id: Uuid) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.read();
        let task_ids: Vec<Uuid> = inner
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == workflow_id)
            .map(|t| t.id)
            .collect();
        Ok(inner
            .workflow_executions
            .values()
            .filter(|w| {
                w.parent_task_id
                    .is_some_and(|parent| task_ids.contains(&parent))
            })
            .cloned()
            .collect())
    }

    async fn create_task_execution(
        &self,
        _tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError> {
        self.inner.write().task_executions.insert(task.id, task);
        Ok(())
    }

    async fn get_task_execution_for_update(
        &self,
        _tx: &mut Tx,
        id: Uuid,
    ) -> Result<TaskExecution, StoreError> {
        self.get_task_execution(id).await
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError> {
        self.inner
            .read()
            .task_executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskExecutionNotFound(id))
    }

    async fn update_task_execution(
        &self,
        _tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.task_executions.contains_key(&task.id) {
            return Err(StoreError::TaskExecutionNotFound(task.id));
        }
        inner.task_executions.insert(task.id, task);
        Ok(())
    }

    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self
            .inner
            .read()
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect())
    }

    async fn list_pending_joins(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        Ok(self
            .inner
            .read()
            .task_executions
            .values()
            .filter(|t| {
                t.workflow_execution_id == workflow_execution_id && !t.state.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn create_action_execution(
        &self,
        _tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .action_executions
            .insert(action.id, action);
        Ok(())
    }

    async fn update_action_execution(
        &self,
        _tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.action_executions.contains_key(&action.id) {
            return Err(StoreError::ActionExecutionNotFound(action.id));
        }
        inner.action_executions.insert(action.id, action);
        Ok(())
    }

    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        Ok(self
            .inner
            .read()
            .action_executions
            .values()
            .filter(|a| a.task_execution_id == task_execution_id)
            .cloned()
            .collect())
    }

    async fn schedule_delay(&self, _tx: &mut Tx, call: DelayedCall) -> Result<(), StoreError> {
        self.inner.write().delays.insert(call.id, call);
        Ok(())
    }

    async fn cancel_delay(&self, _tx: &mut Tx, task_execution_id: Uuid) -> Result<(), StoreError> {
        self.inner
            .write()
            .delays
            .retain(|_, d| d.task_execution_id != task_execution_id);
        Ok(())
    }

    /// Claims ready entries by removing them from the queue before
    /// returning them, so a second poller (or a second call before the
    /// caller re-schedules a retry) never sees the same entry twice.
    async fn find_ready_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelayedCall>, StoreError> {
        let mut inner = self.inner.write();
        let mut ready: Vec<DelayedCall> = inner
            .delays
            .values()
            .filter(|d| d.deadline <= now)
            .cloned()
            .collect();
        ready.sort_by_key(|d| d.deadline);
        ready.truncate(limit);
        for call in &ready {
            inner.delays.remove(&call.id);
        }
        Ok(ready)
    }

    async fn record_event_applied(
        &self,
        _tx: &mut Tx,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .write()
            .applied_events
            .insert((workflow_execution_id, event_id)))
    }

    async fn was_event_applied(
        &self,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .read()
            .applied_events
            .contains(&(workflow_execution_id, event_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemoryExecutionStore {
        InMemoryExecutionStore::new()
    }

    #[tokio::test]
    async fn create_and_fetch_workflow_execution() {
        let store = store();
        let id = Uuid::now_v7();
        let execution = WorkflowExecution::new(id, "greet", "default", "1.0", json!({}), "proj");

        let mut tx = store.begin().await.unwrap();
        store
            .create_workflow_execution(&mut tx, execution)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let fetched = store.get_workflow_execution(id).await.unwrap();
        assert_eq!(fetched.spec_name, "greet");
    }

    #[tokio::test]
    async fn missing_workflow_execution_errors() {
        let store = store();
        let err = store.get_workflow_execution(Uuid::now_v7()).await;
        assert!(matches!(err, Err(StoreError::WorkflowExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn definitions_are_scoped_by_namespace_and_project() {
        let store = store();
        let spec = crate::spec::parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
namespace: team-a
start-task: say_hi
tasks:
  say_hi:
    action: std.echo
"#,
        )
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .put_workflow_definition(&mut tx, "proj-1", spec.clone())
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert!(store
            .get_workflow_definition("greet", "team-a", "proj-1")
            .await
            .is_ok());
        assert!(store
            .get_workflow_definition("greet", "team-b", "proj-1")
            .await
            .is_err());
        assert!(store
            .get_workflow_definition("greet", "team-a", "proj-2")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn duplicate_definition_is_rejected() {
        let store = store();
        let spec = crate::spec::parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
start-task: say_hi
tasks:
  say_hi:
    action: std.echo
"#,
        )
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .put_workflow_definition(&mut tx, "proj-1", spec.clone())
            .await
            .unwrap();
        let result = store.put_workflow_definition(&mut tx, "proj-1", spec).await;
        assert!(matches!(
            result,
            Err(StoreError::DuplicateWorkflowDefinition { .. })
        ));
    }

    #[tokio::test]
    async fn find_ready_delayed_respects_deadline_and_limit() {
        let store = store();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        for i in 0..3 {
            store
                .schedule_delay(
                    &mut tx,
                    DelayedCall {
                        id: Uuid::now_v7(),
                        task_execution_id: Uuid::now_v7(),
                        workflow_execution_id: Uuid::now_v7(),
                        kind: crate::domain::DelayKind::WaitBefore,
                        deadline: now - chrono::Duration::seconds(i),
                    },
                )
                .await
                .unwrap();
        }
        store
            .schedule_delay(
                &mut tx,
                DelayedCall {
                    id: Uuid::now_v7(),
                    task_execution_id: Uuid::now_v7(),
                    workflow_execution_id: Uuid::now_v7(),
                    kind: crate::domain::DelayKind::WaitBefore,
                    deadline: now + chrono::Duration::seconds(60),
                },
            )
            .await
            .unwrap();

        let ready = store.find_ready_delayed(now, 2).await.unwrap();
        assert_eq!(ready.len(), 2);
    }

    #[tokio::test]
    async fn event_application_is_recorded_once() {
        let store = store();
        let workflow_id = Uuid::now_v7();
        let event_id = Uuid::now_v7();
        let mut tx = store.begin().await.unwrap();

        assert!(store
            .record_event_applied(&mut tx, workflow_id, event_id)
            .await
            .unwrap());
        assert!(!store
            .record_event_applied(&mut tx, workflow_id, event_id)
            .await
            .unwrap());
        assert!(store.was_event_applied(workflow_id, event_id).await.unwrap());
    }
}
