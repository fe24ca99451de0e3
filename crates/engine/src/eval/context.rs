use serde_json::{Map, Value};

/// The data a single expression evaluation sees.
///
/// Path expressions resolve against a root object assembled from these
/// three sources, with workflow `context` (published names) exposed at
/// the top level so `$.greeting` reaches a name published by an earlier
/// task directly, matching the worked example in the specification.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Workflow input values, reachable as `$.input...`.
    pub input: Value,
    /// Names published by preceding tasks, reachable at the path root.
    pub published: Map<String, Value>,
    /// Task-local data (`task.result`, `task.state`, loop variables),
    /// reachable as `$.task...`.
    pub task: Value,
}

impl EvalContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            published: Map::new(),
            task: Value::Null,
        }
    }

    pub fn with_task_result(mut self, result: Value) -> Self {
        let task = self.task.as_object_mut_or_insert();
        task.insert("result".to_string(), result);
        self
    }

    pub fn with_task_error(mut self, error: Value) -> Self {
        let task = self.task.as_object_mut_or_insert();
        task.insert("error".to_string(), error);
        self
    }

    pub fn publish(&mut self, name: impl Into<String>, value: Value) {
        self.published.insert(name.into(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.published.get(name)
    }

    /// Builds the root object that `Path` expressions are resolved
    /// against: published names at the top level, plus `input` and
    /// `task` namespaces.
    pub(super) fn root(&self) -> Value {
        let mut root = self.published.clone();
        root.insert("input".to_string(), self.input.clone());
        root.insert("task".to_string(), self.task.clone());
        Value::Object(root)
    }
}

trait ValueExt {
    fn as_object_mut_or_insert(&mut self) -> &mut Map<String, Value>;
}

impl ValueExt for Value {
    fn as_object_mut_or_insert(&mut self) -> &mut Map<String, Value> {
        if !self.is_object() {
            *self = Value::Object(Map::new());
        }
        self.as_object_mut().expect("just ensured object")
    }
}
