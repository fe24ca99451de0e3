//! PostgreSQL implementation of [`ExecutionStore`].
//!
//! Row-level locking via `SELECT ... FOR UPDATE` backs `get_*_for_update`;
//! `find_ready_delayed` uses `FOR UPDATE SKIP LOCKED` so multiple poller
//! instances can drain the same queue without blocking on each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{DelayedCall, ExecutionStore, StoreError, Tx};
use crate::domain::{ActionExecution, ExecutionState, TaskExecution, WorkflowExecution};
use crate::spec::WorkflowSpec;

#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds a connection pool against `database_url` and runs the
    /// embedded migrations, for callers (the CLI, integration tests) that
    /// don't already hold a pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn as_pg(tx: &mut Tx) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
    match tx {
        Tx::Postgres(inner) => Ok(inner),
        Tx::Memory => Err(StoreError::Database(
            "a Tx::Memory handle was passed to PostgresExecutionStore".to_string(),
        )),
    }
}

fn row_to_workflow_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    let state_str: String = row.get("state");
    Ok(WorkflowExecution {
        id: row.get("id"),
        spec_name: row.get("spec_name"),
        spec_namespace: row.get("spec_namespace"),
        spec_version: row.get("spec_version"),
        state: parse_state(&state_str)?,
        input: row.get("input"),
        context: serde_json::from_value(row.get("context"))
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        output: row.get("output"),
        error: row.get("error"),
        parent_task_id: row.get("parent_task_id"),
        project_id: row.get("project_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task_execution(row: &sqlx::postgres::PgRow) -> Result<TaskExecution, StoreError> {
    let state_str: String = row.get("state");
    Ok(TaskExecution {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        task_name: row.get("task_name"),
        state: parse_state(&state_str)?,
        input: row.get("input"),
        published: serde_json::from_value(row.get("published"))
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        attempt: row.get::<i32, _>("attempt") as u32,
        deadline: row.get("deadline"),
        join_success_count: row.get::<i32, _>("join_success_count") as u32,
        join_terminal_count: row.get::<i32, _>("join_terminal_count") as u32,
        error: row.get("error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_action_execution(row: &sqlx::postgres::PgRow) -> Result<ActionExecution, StoreError> {
    let state_str: String = row.get("state");
    Ok(ActionExecution {
        id: row.get("id"),
        task_execution_id: row.get("task_execution_id"),
        action_name: row.get("action_name"),
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        attempt: row.get::<i32, _>("attempt") as u32,
        state: parse_state(&state_str)?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_state(s: &str) -> Result<ExecutionState, StoreError> {
    match s {
        "IDLE" => Ok(ExecutionState::Idle),
        "RUNNING" => Ok(ExecutionState::Running),
        "STOPPED" => Ok(ExecutionState::Stopped),
        "DELAYED" => Ok(ExecutionState::Delayed),
        "SUCCESS" => Ok(ExecutionState::Success),
        "ERROR" => Ok(ExecutionState::Error),
        other => Err(StoreError::Database(format!("unknown execution state: {other}"))),
    }
}

fn row_to_delayed_call(row: &sqlx::postgres::PgRow) -> DelayedCall {
    DelayedCall {
        id: row.get("id"),
        task_execution_id: row.get("task_execution_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        kind: serde_json::from_str(&format!("\"{}\"", row.get::<String, _>("kind")))
            .unwrap_or(crate::domain::DelayKind::Timeout),
        deadline: row.get("deadline"),
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn begin(&self) -> Result<Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Tx::Postgres(tx))
    }

    async fn commit(&self, tx: Tx) -> Result<(), StoreError> {
        match tx {
            Tx::Postgres(inner) => inner
                .commit()
                .await
                .map_err(|e| StoreError::Database(e.to_string())),
            Tx::Memory => Ok(()),
        }
    }

    async fn rollback(&self, tx: Tx) -> Result<(), StoreError> {
        match tx {
            Tx::Postgres(inner) => inner
                .rollback()
                .await
                .map_err(|e| StoreError::Database(e.to_string())),
            Tx::Memory => Ok(()),
        }
    }

    #[instrument(skip(self, tx, spec))]
    async fn put_workflow_definition(
        &self,
        tx: &mut Tx,
        project_id: &str,
        spec: WorkflowSpec,
    ) -> Result<(), StoreError> {
        let (name, namespace, version) = spec.identity();
        let (name, namespace, version) = (name.to_string(), namespace.to_string(), version.to_string());
        let document =
            serde_json::to_value(&spec).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let inner = as_pg(tx)?;

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (name, namespace, project_id, version, document)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&name)
        .bind(&namespace)
        .bind(project_id)
        .bind(&version)
        .bind(&document)
        .execute(&mut **inner)
        .await;

        match result {
            Ok(_) => {
                debug!(%name, %namespace, project_id, "stored workflow definition");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateWorkflowDefinition {
                    name,
                    namespace,
                    project_id: project_id.to_string(),
                })
            }
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn get_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<WorkflowSpec, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT document FROM workflow_definitions
            WHERE name = $1 AND namespace = $2 AND project_id = $3
            "#,
        )
        .bind(name)
        .bind(namespace)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::WorkflowDefinitionNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })?;

        let document: serde_json::Value = row.get("document");
        serde_json::from_value(document).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn delete_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
        project_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM workflow_definitions
            WHERE name = $1 AND namespace = $2 AND project_id = $3
            "#,
        )
        .bind(name)
        .bind(namespace)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowDefinitionNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, tx, execution))]
    async fn create_workflow_execution(
        &self,
        tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let context = serde_json::to_value(&execution.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, spec_name, spec_namespace, spec_version, state, input, context,
                output, error, parent_task_id, project_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.spec_name)
        .bind(&execution.spec_namespace)
        .bind(&execution.spec_version)
        .bind(execution.state.to_string())
        .bind(&execution.input)
        .bind(&context)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.parent_task_id)
        .bind(&execution.project_id)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow_execution_for_update(
        &self,
        tx: &mut Tx,
        id: Uuid,
    ) -> Result<WorkflowExecution, StoreError> {
        let inner = as_pg(tx)?;
        let row = sqlx::query(
            r#"SELECT * FROM workflow_executions WHERE id = $1 FOR UPDATE"#,
        )
        .bind(id)
        .fetch_optional(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowExecutionNotFound(id))?;

        row_to_workflow_execution(&row)
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM workflow_executions WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowExecutionNotFound(id))?;

        row_to_workflow_execution(&row)
    }

    async fn update_workflow_execution(
        &self,
        tx: &mut Tx,
        execution: WorkflowExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let context = serde_json::to_value(&execution.context)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET state = $2, context = $3, output = $4, error = $5, updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(execution.state.to_string())
        .bind(&context)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(Utc::now())
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowExecutionNotFound(execution.id));
        }
        Ok(())
    }

    async fn delete_workflow_execution(&self, tx: &mut Tx, id: Uuid) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let result = sqlx::query(r#"DELETE FROM workflow_executions WHERE id = $1"#)
            .bind(id)
            .execute(&mut **inner)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowExecutionNotFound(id));
        }
        Ok(())
    }

    async fn list_children(&self, workflow_id: Uuid) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT we.* FROM workflow_executions we
            JOIN task_executions te ON te.id = we.parent_task_id
            WHERE te.workflow_execution_id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_workflow_execution).collect()
    }

    async fn create_task_execution(
        &self,
        tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let published = serde_json::to_value(&task.published)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO task_executions (
                id, workflow_execution_id, task_name, state, input, published,
                attempt, deadline, join_success_count, join_terminal_count, error,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(task.id)
        .bind(task.workflow_execution_id)
        .bind(&task.task_name)
        .bind(task.state.to_string())
        .bind(&task.input)
        .bind(&published)
        .bind(task.attempt as i32)
        .bind(task.deadline)
        .bind(task.join_success_count as i32)
        .bind(task.join_terminal_count as i32)
        .bind(&task.error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_task_execution_for_update(
        &self,
        tx: &mut Tx,
        id: Uuid,
    ) -> Result<TaskExecution, StoreError> {
        let inner = as_pg(tx)?;
        let row = sqlx::query(r#"SELECT * FROM task_executions WHERE id = $1 FOR UPDATE"#)
            .bind(id)
            .fetch_optional(&mut **inner)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskExecutionNotFound(id))?;

        row_to_task_execution(&row)
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, StoreError> {
        let row = sqlx::query(r#"SELECT * FROM task_executions WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskExecutionNotFound(id))?;

        row_to_task_execution(&row)
    }

    async fn update_task_execution(
        &self,
        tx: &mut Tx,
        task: TaskExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let published = serde_json::to_value(&task.published)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE task_executions
            SET state = $2, published = $3, attempt = $4, deadline = $5,
                join_success_count = $6, join_terminal_count = $7, error = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.state.to_string())
        .bind(&published)
        .bind(task.attempt as i32)
        .bind(task.deadline)
        .bind(task.join_success_count as i32)
        .bind(task.join_terminal_count as i32)
        .bind(&task.error)
        .bind(Utc::now())
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskExecutionNotFound(task.id));
        }
        Ok(())
    }

    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(r#"SELECT * FROM task_executions WHERE workflow_execution_id = $1"#)
            .bind(workflow_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_task_execution).collect()
    }

    async fn list_pending_joins(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM task_executions
            WHERE workflow_execution_id = $1 AND state NOT IN ('SUCCESS', 'ERROR')
            "#,
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_task_execution).collect()
    }

    async fn create_action_execution(
        &self,
        tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        sqlx::query(
            r#"
            INSERT INTO action_executions (
                id, task_execution_id, action_name, input, output, error,
                attempt, state, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(action.id)
        .bind(action.task_execution_id)
        .bind(&action.action_name)
        .bind(&action.input)
        .bind(&action.output)
        .bind(&action.error)
        .bind(action.attempt as i32)
        .bind(action.state.to_string())
        .bind(action.created_at)
        .bind(action.updated_at)
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update_action_execution(
        &self,
        tx: &mut Tx,
        action: ActionExecution,
    ) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let result = sqlx::query(
            r#"
            UPDATE action_executions
            SET output = $2, error = $3, state = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(action.id)
        .bind(&action.output)
        .bind(&action.error)
        .bind(action.state.to_string())
        .bind(Utc::now())
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ActionExecutionNotFound(action.id));
        }
        Ok(())
    }

    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT * FROM action_executions WHERE task_execution_id = $1 ORDER BY attempt"#,
        )
        .bind(task_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_action_execution).collect()
    }

    async fn schedule_delay(&self, tx: &mut Tx, call: DelayedCall) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        let kind_str = serde_json::to_value(&call.kind)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO delay_queue (id, task_execution_id, workflow_execution_id, kind, deadline)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(call.id)
        .bind(call.task_execution_id)
        .bind(call.workflow_execution_id)
        .bind(kind_str.as_str().unwrap_or_default())
        .bind(call.deadline)
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn cancel_delay(&self, tx: &mut Tx, task_execution_id: Uuid) -> Result<(), StoreError> {
        let inner = as_pg(tx)?;
        sqlx::query(r#"DELETE FROM delay_queue WHERE task_execution_id = $1"#)
            .bind(task_execution_id)
            .execute(&mut **inner)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    /// Claims ready entries in one round trip: the inner `SELECT ... FOR
    /// UPDATE SKIP LOCKED` picks rows no other poller has already claimed,
    /// the outer `DELETE ... RETURNING` removes them from the queue before
    /// handing them back, so a crash between this call and the caller
    /// dispatching the resulting `TimerFired` event drops the event rather
    /// than firing it twice.
    #[instrument(skip(self))]
    async fn find_ready_delayed(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DelayedCall>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM delay_queue
            WHERE id IN (
                SELECT id FROM delay_queue
                WHERE deadline <= $1
                ORDER BY deadline
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(row_to_delayed_call).collect())
    }

    async fn record_event_applied(
        &self,
        tx: &mut Tx,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError> {
        let inner = as_pg(tx)?;
        let result = sqlx::query(
            r#"
            INSERT INTO applied_dispatch_events (workflow_execution_id, event_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(workflow_execution_id)
        .bind(event_id)
        .execute(&mut **inner)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn was_event_applied(
        &self,
        workflow_execution_id: Uuid,
        event_id: Uuid,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 as found FROM applied_dispatch_events
            WHERE workflow_execution_id = $1 AND event_id = $2
            "#,
        )
        .bind(workflow_execution_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    // Exercised by tests/postgres_integration_test.rs against a real database.
}
