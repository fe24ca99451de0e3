use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::ExecutionState;

/// A running (or finished) instance of a [`crate::spec::WorkflowSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub spec_name: String,
    pub spec_namespace: String,
    pub spec_version: String,
    pub state: ExecutionState,
    pub input: Value,
    /// Names published by task completions, scoped to this execution.
    pub context: Map<String, Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Set when this execution is a sub-workflow spawned by a parent
    /// TaskExecution.
    pub parent_task_id: Option<Uuid>,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        id: Uuid,
        spec_name: impl Into<String>,
        spec_namespace: impl Into<String>,
        spec_version: impl Into<String>,
        input: Value,
        project_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec_name: spec_name.into(),
            spec_namespace: spec_namespace.into(),
            spec_version: spec_version.into(),
            state: ExecutionState::Idle,
            input,
            context: Map::new(),
            output: None,
            error: None,
            parent_task_id: None,
            project_id: project_id.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn publish(&mut self, name: impl Into<String>, value: Value) {
        self.context.insert(name.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn unpublish(&mut self, names: &[String]) {
        for name in names {
            self.context.remove(name);
        }
        self.updated_at = Utc::now();
    }
}

/// A single task node's execution record within a [`WorkflowExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub task_name: String,
    pub state: ExecutionState,
    pub input: Value,
    pub published: Map<String, Value>,
    pub attempt: u32,
    pub deadline: Option<DateTime<Utc>>,
    /// For join tasks: how many inbound edges have reported SUCCESS.
    pub join_success_count: u32,
    /// For join tasks: how many inbound edges have reported terminal.
    pub join_terminal_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    pub fn new(id: Uuid, workflow_execution_id: Uuid, task_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_execution_id,
            task_name: task_name.into(),
            state: ExecutionState::Idle,
            input: Value::Null,
            published: Map::new(),
            attempt: 0,
            deadline: None,
            join_success_count: 0,
            join_terminal_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single invocation of an action (or a sub-workflow's completion
/// callback) on behalf of a [`TaskExecution`]. At-least-once: failed
/// attempts leave their own row rather than being overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    pub task_execution_id: Uuid,
    pub action_name: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub attempt: u32,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ActionExecution {
    pub fn new(
        id: Uuid,
        task_execution_id: Uuid,
        action_name: impl Into<String>,
        input: Value,
        attempt: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_execution_id,
            action_name: action_name.into(),
            input,
            output: None,
            error: None,
            attempt,
            state: ExecutionState::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}
