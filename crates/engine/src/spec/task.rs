use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a task invokes: exactly one of an action or a nested workflow.
///
/// A tagged sum type decided at parse time rather than sniffed from field
/// presence at runtime — the source document either has an `action` key or
/// a `workflow` key, never both, and that shape is enforced at
/// deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", untagged)]
pub enum TaskReference {
    Action {
        action: String,
    },
    Workflow {
        workflow: String,
        #[serde(default)]
        namespace: String,
    },
}

/// Retry behavior for a task's action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySpec {
    pub count: u32,
    #[serde(default)]
    pub delay: f64,
    /// Expression over `{task.result, task.error}`; when present, a
    /// failure only retries if this evaluates truthy.
    #[serde(default, rename = "continue-on")]
    pub continue_on: Option<String>,
    /// Expression over `{task.result, task.error}`; when present and
    /// truthy, retrying stops early even with attempts remaining.
    #[serde(default, rename = "break-on")]
    pub break_on: Option<String>,
}

/// Join policy for a task with multiple inbound edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinSpec {
    All,
    Count(u32),
}

/// A conditional successor: `{task-name: condition-expression}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Successor {
    pub task: String,
    /// Absent condition always matches.
    #[serde(default)]
    pub when: Option<String>,
}

/// The three successor policy lists shared by task- and workflow-level
/// `on-task-*` blocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuccessorPolicies {
    #[serde(default, rename = "on-complete")]
    pub on_complete: Vec<Successor>,
    #[serde(default, rename = "on-success")]
    pub on_success: Vec<Successor>,
    #[serde(default, rename = "on-error")]
    pub on_error: Vec<Successor>,
}

impl SuccessorPolicies {
    pub fn referenced_tasks(&self) -> impl Iterator<Item = &str> {
        self.on_complete
            .iter()
            .chain(self.on_success.iter())
            .chain(self.on_error.iter())
            .map(|s| s.task.as_str())
    }
}

/// A single node in a [`crate::spec::WorkflowSpec`]'s task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(flatten)]
    pub reference: TaskReference,

    /// Expression mapping evaluated to compute the action/sub-workflow
    /// input; keys are input names, values are expressions.
    #[serde(default)]
    pub input: BTreeMap<String, String>,

    /// When present, the action is invoked once per item and the task
    /// succeeds iff every item succeeds (or satisfies `retry.continue-on`).
    #[serde(default, rename = "with-items")]
    pub with_items: Option<String>,

    #[serde(default)]
    pub retry: Option<RetrySpec>,

    #[serde(default, rename = "wait-before")]
    pub wait_before: f64,

    #[serde(default, rename = "wait-after")]
    pub wait_after: f64,

    #[serde(default)]
    pub timeout: Option<f64>,

    #[serde(default)]
    pub join: Option<JoinSpec>,

    /// Expressions producing named outputs written into the workflow
    /// context once the task reaches `SUCCESS`.
    #[serde(default)]
    pub publish: BTreeMap<String, String>,

    #[serde(default, flatten)]
    pub successors: SuccessorPolicies,
}

impl TaskSpec {
    pub fn action_name(&self) -> Option<&str> {
        match &self.reference {
            TaskReference::Action { action } => Some(action),
            TaskReference::Workflow { .. } => None,
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        matches!(self.reference, TaskReference::Workflow { .. })
    }
}
