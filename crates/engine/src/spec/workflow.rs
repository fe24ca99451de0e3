use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::SpecError;
use super::task::{SuccessorPolicies, TaskSpec};

/// A `direct` workflow has explicit forward edges from `start-task`; a
/// `reverse` workflow's edges are interpreted as dependencies and the
/// engine schedules only what the requested output transitively needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Direct,
    Reverse,
}

/// A typed parameter declaration in a workflow's `parameters` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    /// Expression evaluated when the caller omits this parameter.
    #[serde(default)]
    pub default: Option<String>,
}

/// Immutable, validated representation of a workflow definition.
///
/// Identity is `(name, namespace, version)`; namespace is an opaque
/// scoping tag, never interpreted by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,

    #[serde(default, rename = "start-task")]
    pub start_task: Option<String>,

    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    /// Expression producing the workflow's terminal output.
    #[serde(default)]
    pub output: Option<String>,

    pub tasks: BTreeMap<String, TaskSpec>,

    #[serde(default, flatten)]
    pub successors: SuccessorPolicies,
}

impl WorkflowSpec {
    /// Checks the cross-reference invariants from §3/§4.1.
    ///
    /// Schema-level shape (required keys, enum membership) is already
    /// enforced by `serde` at deserialization; this catches what a type
    /// system cannot: that every referenced task actually exists.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.workflow_type == WorkflowType::Direct {
            let start = self
                .start_task
                .as_ref()
                .ok_or(SpecError::MissingStartTask)?;
            if !self.tasks.contains_key(start) {
                return Err(SpecError::UnknownStartTask(start.clone()));
            }
        }

        for (name, task) in &self.tasks {
            self.check_reference_target(task)?;
            if task.with_items.is_some() {
                return Err(SpecError::UnsupportedWithItems(name.clone()));
            }
            for successor in task.successors.referenced_tasks() {
                self.check_successor_target(successor)?;
            }
        }
        for name in self.successors.referenced_tasks() {
            self.check_successor_target(name)?;
        }

        Ok(())
    }

    fn check_reference_target(&self, task: &TaskSpec) -> Result<(), SpecError> {
        if let crate::spec::task::TaskReference::Workflow { workflow, .. } = &task.reference {
            if workflow.is_empty() {
                return Err(SpecError::Other(
                    "sub-workflow reference must name a workflow".into(),
                ));
            }
        }
        Ok(())
    }

    fn check_successor_target(&self, name: &str) -> Result<(), SpecError> {
        if self.tasks.contains_key(name) {
            Ok(())
        } else {
            Err(SpecError::UnknownSuccessor(name.to_string()))
        }
    }

    pub fn get_task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.get(name)
    }

    /// `(name, namespace, version)`, the spec's full identity triple.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.name, &self.namespace, &self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::task::TaskReference;

    fn echo_task() -> TaskSpec {
        TaskSpec {
            reference: TaskReference::Action {
                action: "std.echo".into(),
            },
            input: Default::default(),
            with_items: None,
            retry: None,
            wait_before: 0.0,
            wait_after: 0.0,
            timeout: None,
            join: None,
            publish: Default::default(),
            successors: Default::default(),
        }
    }

    fn direct_spec(start: &str, tasks: &[&str]) -> WorkflowSpec {
        WorkflowSpec {
            version: "1.0".into(),
            name: "w".into(),
            namespace: String::new(),
            description: None,
            tags: vec![],
            workflow_type: WorkflowType::Direct,
            start_task: Some(start.into()),
            parameters: vec![],
            output: None,
            tasks: tasks.iter().map(|t| (t.to_string(), echo_task())).collect(),
            successors: Default::default(),
        }
    }

    #[test]
    fn direct_workflow_requires_start_task() {
        let mut spec = direct_spec("t1", &["t1"]);
        spec.start_task = None;
        assert_eq!(spec.validate(), Err(SpecError::MissingStartTask));
    }

    #[test]
    fn direct_workflow_start_task_must_exist() {
        let spec = direct_spec("missing", &["t1"]);
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownStartTask("missing".into()))
        );
    }

    #[test]
    fn successor_must_reference_existing_task() {
        let mut spec = direct_spec("t1", &["t1"]);
        spec.tasks.get_mut("t1").unwrap().successors.on_success = vec![super::super::task::Successor {
            task: "nope".into(),
            when: None,
        }];
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownSuccessor("nope".into()))
        );
    }

    #[test]
    fn valid_direct_workflow_passes() {
        let spec = direct_spec("t1", &["t1", "t2"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn with_items_is_rejected_until_fan_out_is_implemented() {
        let mut spec = direct_spec("t1", &["t1"]);
        spec.tasks.get_mut("t1").unwrap().with_items = Some("$.items".into());
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnsupportedWithItems("t1".into()))
        );
    }

    #[test]
    fn reverse_workflow_does_not_require_start_task() {
        let mut spec = direct_spec("t1", &["t1"]);
        spec.workflow_type = WorkflowType::Reverse;
        spec.start_task = None;
        assert!(spec.validate().is_ok());
    }
}
