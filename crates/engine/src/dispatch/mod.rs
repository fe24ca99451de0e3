//! The scheduler/dispatcher (§4.6): drives a [`WorkflowExecution`] forward
//! by applying [`DispatchEvent`]s under the task (§4.4) and workflow (§4.5)
//! state machines.
//!
//! Each call to [`Dispatcher::dispatch`] is one atomic handler: it opens a
//! transaction, checks the event's `event_id` against the store's applied-
//! event ledger so a replayed event is a no-op (P5), does its work, and
//! commits. A [`StoreError::Conflict`] surfaced mid-handler should be
//! retried by the caller with backoff; everything else is terminal for that
//! event.

mod error;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use error::DispatchError;

use crate::domain::{
    ActionExecution, DelayKind, DispatchEvent, DispatchEventKind, ExecutionState, TaskExecution,
    WorkflowExecution,
};
use crate::eval::{self, EvalContext};
use crate::spec::{JoinSpec, Successor, TaskSpec, WorkflowSpec, WorkflowType};
use crate::store::{DelayedCall, ExecutionStore, Tx};

/// Drives workflow executions forward against a given [`ExecutionStore`].
///
/// Stateless beyond the store handle: every method opens its own
/// transaction and is safe to call concurrently from multiple dispatcher
/// workers, relying on the store's row locking for mutual exclusion.
pub struct Dispatcher<S: ExecutionStore> {
    store: Arc<S>,
}

impl<S: ExecutionStore> Dispatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates a new workflow execution and dispatches its initial task(s).
    #[instrument(skip(self, spec, input), fields(workflow = %spec.name))]
    pub async fn start(
        &self,
        spec: &WorkflowSpec,
        input: Value,
        project_id: &str,
    ) -> Result<Uuid, DispatchError> {
        let id = Uuid::now_v7();
        let mut workflow = WorkflowExecution::new(
            id,
            &spec.name,
            &spec.namespace,
            &spec.version,
            input,
            project_id,
        );

        let mut tx = self.store.begin().await?;
        self.store
            .create_workflow_execution(&mut tx, workflow.clone())
            .await?;
        transition_workflow(&mut workflow, ExecutionState::Running)?;
        self.store
            .update_workflow_execution(&mut tx, workflow.clone())
            .await?;

        for task_name in initial_tasks(spec) {
            self.dispatch_task(&mut tx, spec, &mut workflow, &task_name)
                .await?;
        }

        self.store.commit(tx).await?;
        info!(%id, "started workflow execution");
        Ok(id)
    }

    /// Applies one inbound event to the workflow it targets. Idempotent: a
    /// second delivery of the same `event_id` is a committed no-op.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, workflow = %event.workflow_execution_id))]
    pub async fn dispatch(&self, event: DispatchEvent) -> Result<(), DispatchError> {
        let mut tx = self.store.begin().await?;

        let first_delivery = self
            .store
            .record_event_applied(&mut tx, event.workflow_execution_id, event.event_id)
            .await?;
        if !first_delivery {
            debug!("event already applied, skipping");
            self.store.commit(tx).await?;
            return Ok(());
        }

        let mut workflow = self
            .store
            .get_workflow_execution_for_update(&mut tx, event.workflow_execution_id)
            .await?;
        let spec = self
            .store
            .get_workflow_definition(&workflow.spec_name, &workflow.spec_namespace, &workflow.project_id)
            .await?;

        match event.kind {
            DispatchEventKind::Start => {
                // Handled by `start`; a Start event arriving here means a
                // replay raced the initial commit, which idempotency above
                // already absorbed.
            }
            DispatchEventKind::TaskStart { task_execution_id } => {
                self.handle_task_start(&mut tx, &spec, &mut workflow, task_execution_id)
                    .await?;
            }
            DispatchEventKind::ActionDone {
                task_execution_id,
                action_execution_id,
                success,
                result,
                error,
            } => {
                self.handle_action_done(
                    &mut tx,
                    &spec,
                    &mut workflow,
                    task_execution_id,
                    action_execution_id,
                    success,
                    result,
                    error,
                )
                .await?;
            }
            DispatchEventKind::TimerFired {
                task_execution_id,
                kind,
            } => {
                self.handle_timer_fired(&mut tx, &spec, &mut workflow, task_execution_id, kind)
                    .await?;
            }
            DispatchEventKind::Stop => {
                transition_workflow(&mut workflow, ExecutionState::Stopped)?;
                self.store
                    .update_workflow_execution(&mut tx, workflow.clone())
                    .await?;
            }
            DispatchEventKind::Cancel => {
                workflow.error = Some("cancelled".to_string());
                transition_workflow(&mut workflow, ExecutionState::Error)?;
                self.store
                    .update_workflow_execution(&mut tx, workflow.clone())
                    .await?;
            }
            DispatchEventKind::Rerun { task_name } => {
                self.rerun_locked(&mut tx, &spec, &mut workflow, &task_name)
                    .await?;
            }
        }

        self.store.commit(tx).await?;
        Ok(())
    }

    /// Rejects unless `task_name` is terminal and every task reachable from
    /// it is terminal or still IDLE, then resets that subgraph to IDLE and
    /// re-dispatches `task_name`.
    #[instrument(skip(self))]
    pub async fn rerun(&self, workflow_execution_id: Uuid, task_name: &str) -> Result<(), DispatchError> {
        let mut tx = self.store.begin().await?;
        let mut workflow = self
            .store
            .get_workflow_execution_for_update(&mut tx, workflow_execution_id)
            .await?;
        let spec = self
            .store
            .get_workflow_definition(&workflow.spec_name, &workflow.spec_namespace, &workflow.project_id)
            .await?;
        self.rerun_locked(&mut tx, &spec, &mut workflow, task_name)
            .await?;
        self.store.commit(tx).await?;
        Ok(())
    }

    async fn rerun_locked(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task_name: &str,
    ) -> Result<(), DispatchError> {
        if !spec.tasks.contains_key(task_name) {
            return Err(DispatchError::UnknownTask(task_name.to_string()));
        }

        let executions = self.store.list_task_executions(workflow.id).await?;
        let target = executions
            .iter()
            .find(|t| t.task_name == task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task_name.to_string()))?;
        if !target.state.is_terminal() {
            return Err(DispatchError::RerunTargetNotTerminal {
                task: task_name.to_string(),
            });
        }

        let downstream = reachable_tasks(spec, task_name);
        for name in &downstream {
            if let Some(exec) = executions.iter().find(|t| &t.task_name == name) {
                if exec.state != ExecutionState::Idle && !exec.state.is_terminal() {
                    return Err(DispatchError::RerunDownstreamInProgress {
                        task: name.clone(),
                    });
                }
            }
        }

        for name in std::iter::once(task_name.to_string()).chain(downstream) {
            if let Some(mut exec) = executions.iter().find(|t| &t.task_name == &name).cloned() {
                exec.state = ExecutionState::Idle;
                exec.attempt = 0;
                exec.join_success_count = 0;
                exec.join_terminal_count = 0;
                exec.error = None;
                self.store.update_task_execution(tx, exec).await?;
            }
        }

        workflow.output = None;
        workflow.error = None;
        transition_workflow(workflow, ExecutionState::Running)?;
        self.store.update_workflow_execution(tx, workflow.clone()).await?;

        self.dispatch_task(tx, spec, workflow, task_name).await?;
        info!(workflow_id = %workflow.id, task_name, "rerun task");
        Ok(())
    }

    /// Finds or creates the `TaskExecution` for `task_name` and advances it
    /// from IDLE: either straight to action invocation, or through a
    /// `wait-before` delay first.
    async fn dispatch_task(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task_name: &str,
    ) -> Result<(), DispatchError> {
        let task_spec = spec
            .get_task(task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task_name.to_string()))?;

        let mut task = self.find_or_create_task(tx, workflow.id, task_name).await?;
        if task.state != ExecutionState::Idle {
            return Ok(());
        }

        if task_spec.wait_before > 0.0 {
            transition_task(&mut task, ExecutionState::Delayed)?;
            self.store.update_task_execution(tx, task.clone()).await?;
            self.store
                .schedule_delay(
                    tx,
                    DelayedCall {
                        id: Uuid::now_v7(),
                        task_execution_id: task.id,
                        workflow_execution_id: workflow.id,
                        kind: DelayKind::WaitBefore,
                        deadline: Utc::now() + seconds(task_spec.wait_before),
                    },
                )
                .await?;
            return Ok(());
        }

        self.start_action(tx, workflow, &mut task, task_spec).await
    }

    async fn find_or_create_task(
        &self,
        tx: &mut Tx,
        workflow_execution_id: Uuid,
        task_name: &str,
    ) -> Result<TaskExecution, DispatchError> {
        let existing = self
            .store
            .list_task_executions(workflow_execution_id)
            .await?
            .into_iter()
            .find(|t| t.task_name == task_name);

        Ok(match existing {
            Some(t) => t,
            None => {
                let task = TaskExecution::new(Uuid::now_v7(), workflow_execution_id, task_name);
                self.store.create_task_execution(tx, task.clone()).await?;
                task
            }
        })
    }

    async fn start_action(
        &self,
        tx: &mut Tx,
        workflow: &WorkflowExecution,
        task: &mut TaskExecution,
        task_spec: &TaskSpec,
    ) -> Result<(), DispatchError> {
        let input = self.evaluate_task_input(workflow, task, task_spec)?;
        task.input = input.clone();
        transition_task(task, ExecutionState::Running)?;
        self.store.update_task_execution(tx, task.clone()).await?;

        if let Some(action_name) = task_spec.action_name() {
            let action = ActionExecution::new(Uuid::now_v7(), task.id, action_name, input, task.attempt);
            self.store.create_action_execution(tx, action).await?;
        }
        // Sub-workflow task references (`TaskReference::Workflow`) are
        // resolved by whoever owns the CLI/worker boundary: it sees this
        // task reach RUNNING with no ActionExecution and starts the child
        // workflow, wiring its terminal state back as an ActionDone event.

        if let Some(timeout) = task_spec.timeout {
            self.store
                .schedule_delay(
                    tx,
                    DelayedCall {
                        id: Uuid::now_v7(),
                        task_execution_id: task.id,
                        workflow_execution_id: workflow.id,
                        kind: DelayKind::Timeout,
                        deadline: Utc::now() + seconds(timeout),
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn evaluate_task_input(
        &self,
        workflow: &WorkflowExecution,
        _task: &TaskExecution,
        task_spec: &TaskSpec,
    ) -> Result<Value, DispatchError> {
        let ctx = workflow_eval_context(workflow);
        let mut input = serde_json::Map::new();
        for (name, expr) in &task_spec.input {
            input.insert(name.clone(), eval::evaluate(expr, &ctx)?);
        }
        Ok(Value::Object(input))
    }

    async fn handle_task_start(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task_execution_id: Uuid,
    ) -> Result<(), DispatchError> {
        let mut task = self.store.get_task_execution_for_update(tx, task_execution_id).await?;
        let task_spec = spec
            .get_task(&task.task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task.task_name.clone()))?;
        transition_task(&mut task, ExecutionState::Running)?;
        self.start_action(tx, workflow, &mut task, task_spec).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_action_done(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task_execution_id: Uuid,
        action_execution_id: Uuid,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), DispatchError> {
        let mut task = self.store.get_task_execution_for_update(tx, task_execution_id).await?;
        let task_spec = spec
            .get_task(&task.task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task.task_name.clone()))?;

        // The action reported back before any timeout fired; drop the
        // pending timeout entry so it never fires against a task that has
        // already moved past this attempt.
        self.store.cancel_delay(tx, task.id).await?;

        if let Ok(mut action) = self.get_action(action_execution_id, task_execution_id).await {
            action.output = result.clone();
            action.error = error.clone();
            action.state = if success {
                ExecutionState::Success
            } else {
                ExecutionState::Error
            };
            self.store.update_action_execution(tx, action).await?;
        }

        if success {
            if task_spec.wait_after > 0.0 {
                task.error = None;
                transition_task(&mut task, ExecutionState::Delayed)?;
                self.store.update_task_execution(tx, task.clone()).await?;
                self.store
                    .schedule_delay(
                        tx,
                        DelayedCall {
                            id: Uuid::now_v7(),
                            task_execution_id: task.id,
                            workflow_execution_id: workflow.id,
                            kind: DelayKind::WaitAfter,
                            deadline: Utc::now() + seconds(task_spec.wait_after),
                        },
                    )
                    .await?;
                return Ok(());
            }
            self.finish_task_success(tx, spec, workflow, &mut task, task_spec, result)
                .await
        } else {
            self.handle_task_failure(tx, spec, workflow, &mut task, task_spec, error)
                .await
        }
    }

    async fn get_action(
        &self,
        action_execution_id: Uuid,
        task_execution_id: Uuid,
    ) -> Result<ActionExecution, crate::store::StoreError> {
        self.store
            .list_action_executions(task_execution_id)
            .await?
            .into_iter()
            .find(|a| a.id == action_execution_id)
            .ok_or(crate::store::StoreError::ActionExecutionNotFound(
                action_execution_id,
            ))
    }

    async fn handle_task_failure(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task: &mut TaskExecution,
        task_spec: &TaskSpec,
        error: Option<String>,
    ) -> Result<(), DispatchError> {
        let error_text = error.unwrap_or_else(|| "action failed".to_string());

        if let Some(retry) = &task_spec.retry {
            let ctx = workflow_eval_context(workflow).with_task_error_text(&error_text);
            let break_now = match &retry.break_on {
                Some(expr) => eval::truthy(&eval::evaluate(expr, &ctx)?),
                None => false,
            };
            let continue_allowed = match &retry.continue_on {
                Some(expr) => eval::truthy(&eval::evaluate(expr, &ctx)?),
                None => true,
            };

            if !break_now && continue_allowed && task.attempt < retry.count {
                task.attempt += 1;
                task.error = Some(error_text);
                transition_task(task, ExecutionState::Delayed)?;
                self.store.update_task_execution(tx, task.clone()).await?;
                self.store
                    .schedule_delay(
                        tx,
                        DelayedCall {
                            id: Uuid::now_v7(),
                            task_execution_id: task.id,
                            workflow_execution_id: workflow.id,
                            kind: DelayKind::Retry,
                            deadline: Utc::now() + seconds(retry.delay),
                        },
                    )
                    .await?;
                return Ok(());
            }
        }

        self.finish_task_error(tx, spec, workflow, task, error_text).await
    }

    async fn handle_timer_fired(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task_execution_id: Uuid,
        kind: DelayKind,
    ) -> Result<(), DispatchError> {
        let mut task = self.store.get_task_execution_for_update(tx, task_execution_id).await?;
        let task_spec = spec
            .get_task(&task.task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task.task_name.clone()))?;

        match kind {
            DelayKind::WaitBefore | DelayKind::Retry => {
                transition_task(&mut task, ExecutionState::Running)?;
                self.start_action(tx, workflow, &mut task, task_spec).await
            }
            DelayKind::WaitAfter => {
                let last_result = self
                    .store
                    .list_action_executions(task.id)
                    .await?
                    .into_iter()
                    .max_by_key(|a| a.attempt)
                    .and_then(|a| a.output);
                // finish_task_success transitions Running -> SUCCESS; the
                // task is currently DELAYED from scheduling this timer.
                transition_task(&mut task, ExecutionState::Running)?;
                self.finish_task_success(tx, spec, workflow, &mut task, task_spec, last_result)
                    .await
            }
            DelayKind::Timeout => {
                if task.state != ExecutionState::Running {
                    // The action already reported back and raced the
                    // timeout firing; `cancel_delay` should have pruned
                    // this entry, but treat it as a stale no-op if not.
                    return Ok(());
                }
                self.finish_task_error(tx, spec, workflow, &mut task, "task timed out".to_string())
                    .await
            }
        }
    }

    async fn finish_task_success(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task: &mut TaskExecution,
        task_spec: &TaskSpec,
        result: Option<Value>,
    ) -> Result<(), DispatchError> {
        task.error = None;
        transition_task(task, ExecutionState::Success)?;
        self.store.update_task_execution(tx, task.clone()).await?;

        let mut ctx = workflow_eval_context(workflow);
        ctx.task = serde_json::json!({ "result": result.clone().unwrap_or(Value::Null) });
        for (name, expr) in &task_spec.publish {
            let value = eval::evaluate(expr, &ctx)?;
            workflow.publish(name.clone(), value);
        }
        self.store
            .update_workflow_execution(tx, workflow.clone())
            .await?;

        let successors: Vec<Successor> = task_spec
            .successors
            .on_success
            .iter()
            .chain(task_spec.successors.on_complete.iter())
            .cloned()
            .collect();
        self.advance_successors(tx, spec, workflow, &task.task_name, &successors, true)
            .await?;

        self.check_workflow_terminal(tx, spec, workflow).await
    }

    async fn finish_task_error(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        task: &mut TaskExecution,
        error: String,
    ) -> Result<(), DispatchError> {
        task.error = Some(error);
        transition_task(task, ExecutionState::Error)?;
        self.store.update_task_execution(tx, task.clone()).await?;

        let task_spec = spec
            .get_task(&task.task_name)
            .ok_or_else(|| DispatchError::UnknownTask(task.task_name.clone()))?;
        let successors: Vec<Successor> = task_spec
            .successors
            .on_error
            .iter()
            .chain(task_spec.successors.on_complete.iter())
            .cloned()
            .collect();
        self.advance_successors(tx, spec, workflow, &task.task_name, &successors, false)
            .await?;

        self.check_workflow_terminal(tx, spec, workflow).await
    }

    async fn advance_successors(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
        from_task: &str,
        successors: &[Successor],
        predecessor_succeeded: bool,
    ) -> Result<(), DispatchError> {
        // A `reverse` workflow only runs the transitive closure that feeds
        // its declared output (§4.5, P4); a forward edge leading outside
        // that closure is a branch the output never needed and must not run.
        let closure = (spec.workflow_type == WorkflowType::Reverse).then(|| reverse_closure(spec));

        let ctx = workflow_eval_context(workflow);
        for successor in successors {
            if let Some(needed) = &closure {
                if !needed.contains(&successor.task) {
                    continue;
                }
            }
            if let Some(expr) = &successor.when {
                if !eval::truthy(&eval::evaluate(expr, &ctx)?) {
                    continue;
                }
            }

            let target_spec = spec
                .get_task(&successor.task)
                .ok_or_else(|| DispatchError::UnknownTask(successor.task.clone()))?;

            match &target_spec.join {
                None => {
                    self.dispatch_task(tx, spec, workflow, &successor.task).await?;
                }
                Some(join) => {
                    let mut target = self
                        .find_or_create_task(tx, workflow.id, &successor.task)
                        .await?;
                    if target.state != ExecutionState::Idle {
                        continue;
                    }
                    target.join_terminal_count += 1;
                    if predecessor_succeeded {
                        target.join_success_count += 1;
                    }

                    let total_inbound = inbound_edge_count(spec, &successor.task);
                    let satisfied = match join {
                        JoinSpec::All => target.join_success_count as usize >= total_inbound,
                        JoinSpec::Count(n) => target.join_success_count >= *n,
                    };
                    self.store.update_task_execution(tx, target.clone()).await?;

                    if satisfied {
                        debug!(task = %successor.task, from_task, "join satisfied");
                        self.dispatch_task(tx, spec, workflow, &successor.task).await?;
                    } else if target.join_terminal_count as usize >= total_inbound {
                        warn!(task = %successor.task, "join can never be satisfied, failing task");
                        let join_success_count = target.join_success_count;
                        Box::pin(self.finish_task_error(
                            tx,
                            spec,
                            workflow,
                            &mut target,
                            format!(
                                "join unsatisfiable: {join_success_count} of {total_inbound} inbound branches succeeded"
                            ),
                        ))
                        .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_workflow_terminal(
        &self,
        tx: &mut Tx,
        spec: &WorkflowSpec,
        workflow: &mut WorkflowExecution,
    ) -> Result<(), DispatchError> {
        let executions = self.store.list_task_executions(workflow.id).await?;
        let blocking = executions.iter().any(|t| self.is_blocking(spec, t));
        if blocking {
            return Ok(());
        }

        let any_error = executions.iter().any(|t| t.state == ExecutionState::Error);
        if any_error {
            workflow.error = Some("one or more tasks failed".to_string());
            transition_workflow(workflow, ExecutionState::Error)?;
        } else {
            let ctx = workflow_eval_context(workflow);
            let output = match &spec.output {
                Some(expr) => Some(eval::evaluate(expr, &ctx)?),
                None => None,
            };
            workflow.output = output;
            transition_workflow(workflow, ExecutionState::Success)?;
        }
        self.store.update_workflow_execution(tx, workflow.clone()).await?;
        info!(workflow_id = %workflow.id, state = %workflow.state, "workflow reached terminal state");
        Ok(())
    }

    /// A non-terminal task always has either already run (and so is still
    /// in flight) or is waiting to — either way the workflow isn't done.
    /// An unsatisfiable join fails itself outright in `advance_successors`,
    /// so there is no longer an IDLE state that can persist forever.
    fn is_blocking(&self, _spec: &WorkflowSpec, task: &TaskExecution) -> bool {
        !task.state.is_terminal()
    }
}

fn workflow_eval_context(workflow: &WorkflowExecution) -> EvalContext {
    let mut ctx = EvalContext::new(workflow.input.clone());
    for (name, value) in &workflow.context {
        ctx.publish(name.clone(), value.clone());
    }
    ctx
}

trait WithTaskErrorText {
    fn with_task_error_text(self, error: &str) -> Self;
}

impl WithTaskErrorText for EvalContext {
    fn with_task_error_text(mut self, error: &str) -> Self {
        self.task = serde_json::json!({ "error": error });
        self
    }
}

fn seconds(s: f64) -> ChronoDuration {
    ChronoDuration::milliseconds((s.max(0.0) * 1000.0) as i64)
}

fn transition_workflow(
    workflow: &mut WorkflowExecution,
    target: ExecutionState,
) -> Result<(), DispatchError> {
    if !workflow.state.can_transition_to(target) {
        return Err(DispatchError::InvalidTransition {
            entity: "workflow execution",
            id: workflow.id,
            from: workflow.state,
            to: target,
        });
    }
    workflow.state = target;
    workflow.updated_at = Utc::now();
    Ok(())
}

fn transition_task(task: &mut TaskExecution, target: ExecutionState) -> Result<(), DispatchError> {
    if !task.state.can_transition_to(target) {
        return Err(DispatchError::InvalidTransition {
            entity: "task execution",
            id: task.id,
            from: task.state,
            to: target,
        });
    }
    task.state = target;
    task.updated_at = Utc::now();
    Ok(())
}

/// Tasks to dispatch when a workflow starts: the declared `start-task` for
/// `direct` workflows, or the entry points of the output's dependency
/// closure for `reverse` workflows (§4.5).
fn initial_tasks(spec: &WorkflowSpec) -> Vec<String> {
    match spec.workflow_type {
        WorkflowType::Direct => spec.start_task.clone().into_iter().collect(),
        WorkflowType::Reverse => {
            let needed = reverse_closure(spec);
            needed
                .iter()
                .filter(|name| {
                    !spec.tasks.iter().any(|(candidate, task)| {
                        needed.contains(candidate.as_str())
                            && task.successors.referenced_tasks().any(|s| s == name.as_str())
                    })
                })
                .cloned()
                .collect()
        }
    }
}

/// The transitive closure of tasks a `reverse` workflow's declared
/// `output` depends on: every task publishing a name the output
/// expression reads, plus every task that transitively precedes one of
/// those via a successor edge (P4 — neither more nor fewer tasks run).
///
/// Falls back to the whole graph when `output` is absent or unparseable,
/// since nothing then constrains which tasks are needed.
fn reverse_closure(spec: &WorkflowSpec) -> BTreeSet<String> {
    let all_tasks = || spec.tasks.keys().cloned().collect();

    let Some(output) = &spec.output else {
        return all_tasks();
    };
    let Ok(roots) = eval::referenced_roots(output) else {
        return all_tasks();
    };

    let mut needed: BTreeSet<String> = spec
        .tasks
        .iter()
        .filter(|(_, task)| task.publish.keys().any(|name| roots.contains(name)))
        .map(|(name, _)| name.clone())
        .collect();

    loop {
        let mut grew = false;
        for (name, task) in &spec.tasks {
            if needed.contains(name) {
                continue;
            }
            if task.successors.referenced_tasks().any(|s| needed.contains(s)) {
                needed.insert(name.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    needed
}

/// Every task transitively reachable from `task_name` via any successor
/// policy, used to bound a rerun's blast radius.
fn reachable_tasks(spec: &WorkflowSpec, task_name: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![task_name.to_string()];
    while let Some(name) = stack.pop() {
        if let Some(task_spec) = spec.get_task(&name) {
            for next in task_spec.successors.referenced_tasks() {
                if seen.insert(next.to_string()) {
                    stack.push(next.to_string());
                }
            }
        }
    }
    seen.into_iter().collect()
}

/// Count of distinct tasks across the whole spec that name `task_name` as a
/// successor in any policy list.
fn inbound_edge_count(spec: &WorkflowSpec, task_name: &str) -> usize {
    spec.tasks
        .values()
        .filter(|t| t.successors.referenced_tasks().any(|n| n == task_name))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse_workflow_spec;
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    async fn run_action(
        dispatcher: &Dispatcher<InMemoryExecutionStore>,
        workflow_id: Uuid,
        task_name: &str,
        success: bool,
        result: Option<Value>,
    ) {
        let executions = dispatcher.store.list_task_executions(workflow_id).await.unwrap();
        let task = executions.into_iter().find(|t| t.task_name == task_name).unwrap();
        let action = dispatcher
            .store
            .list_action_executions(task.id)
            .await
            .unwrap()
            .into_iter()
            .max_by_key(|a| a.attempt)
            .unwrap();
        dispatcher
            .dispatch(DispatchEvent::new(
                workflow_id,
                DispatchEventKind::ActionDone {
                    task_execution_id: task.id,
                    action_execution_id: action.id,
                    success,
                    result,
                    error: if success { None } else { Some("boom".into()) },
                },
            ))
            .await
            .unwrap();
    }

    fn dispatcher() -> Dispatcher<InMemoryExecutionStore> {
        Dispatcher::new(Arc::new(InMemoryExecutionStore::new()))
    }

    #[tokio::test]
    async fn two_sequential_tasks_complete_the_workflow() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
    publish:
      greeting: "'Hi'"
    on-success:
      - task: t2
  t2:
    action: std.echo
    input:
      msg: $.greeting
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "t1", true, Some(json!("ok"))).await;
        run_action(&d, workflow_id, "t2", true, Some(json!("ok"))).await;

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Success);
    }

    #[tokio::test]
    async fn task_error_propagates_to_workflow_error() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: fails
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "t1", false, None).await;

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Error);
    }

    #[tokio::test]
    async fn retry_keeps_workflow_running_until_attempts_exhausted() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: flaky
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
    retry:
      count: 2
      delay: 0
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "t1", false, None).await;

        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let t1 = executions.into_iter().find(|t| t.task_name == "t1").unwrap();
        assert_eq!(t1.state, ExecutionState::Delayed);
        assert_eq!(t1.attempt, 1);

        let delayed = d.store.find_ready_delayed(Utc::now(), 10).await.unwrap();
        assert_eq!(delayed.len(), 1);
        d.dispatch(DispatchEvent::new(
            workflow_id,
            DispatchEventKind::TimerFired {
                task_execution_id: t1.id,
                kind: DelayKind::Retry,
            },
        ))
        .await
        .unwrap();

        run_action(&d, workflow_id, "t1", false, None).await;
        run_action(&d, workflow_id, "t1", false, None).await;

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Error);
    }

    #[tokio::test]
    async fn join_all_waits_for_every_branch() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: fanin
type: direct
start-task: a
tasks:
  a:
    action: std.echo
    on-success:
      - task: b
      - task: c
  b:
    action: std.echo
    on-success:
      - task: d
  c:
    action: std.echo
    on-success:
      - task: d
  d:
    action: std.echo
    join: all
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "a", true, Some(json!("ok"))).await;
        run_action(&d, workflow_id, "b", true, Some(json!("ok"))).await;

        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let d_task = executions.iter().find(|t| t.task_name == "d").unwrap();
        assert_eq!(d_task.state, ExecutionState::Idle);

        run_action(&d, workflow_id, "c", true, Some(json!("ok"))).await;
        run_action(&d, workflow_id, "d", true, Some(json!("ok"))).await;

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Success);
    }

    #[tokio::test]
    async fn join_all_fails_when_a_branch_errors() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: fanin-with-failure
type: direct
start-task: a
tasks:
  a:
    action: std.echo
    on-success:
      - task: b
      - task: e
  b:
    action: std.echo
    on-complete:
      - task: j
  e:
    action: std.echo
    on-complete:
      - task: j
  j:
    action: std.echo
    join: all
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "a", true, Some(json!("ok"))).await;
        run_action(&d, workflow_id, "b", false, None).await;
        run_action(&d, workflow_id, "e", true, Some(json!("ok"))).await;

        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let j_task = executions.iter().find(|t| t.task_name == "j").unwrap();
        assert_eq!(j_task.state, ExecutionState::Error);

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Error);
    }

    #[tokio::test]
    async fn reverse_workflow_runs_only_the_output_dependency_closure() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: rev
type: reverse
output: $.final
tasks:
  a:
    action: std.echo
    on-success:
      - task: b
      - task: unrelated
  b:
    action: std.echo
    publish:
      final: "'done'"
  unrelated:
    action: std.echo
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "a", true, Some(json!("ok"))).await;
        run_action(&d, workflow_id, "b", true, Some(json!("ok"))).await;

        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let names: BTreeSet<&str> = executions.iter().map(|t| t.task_name.as_str()).collect();
        assert_eq!(names, BTreeSet::from(["a", "b"]));

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Success);
        assert_eq!(workflow.output, Some(json!("done")));
    }

    #[tokio::test]
    async fn rerun_rejects_non_terminal_target() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        let result = d.rerun(workflow_id, "t1").await;
        assert!(matches!(result, Err(DispatchError::RerunTargetNotTerminal { .. })));
    }

    #[tokio::test]
    async fn rerun_resets_and_redispatches_terminal_task() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "t1", true, Some(json!("ok"))).await;

        d.rerun(workflow_id, "t1").await.unwrap();

        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let t1 = executions.into_iter().find(|t| t.task_name == "t1").unwrap();
        assert_eq!(t1.state, ExecutionState::Running);
    }

    #[tokio::test]
    async fn timeout_fires_while_action_is_still_running() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: slow
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
    timeout: 5
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let t1 = executions.into_iter().find(|t| t.task_name == "t1").unwrap();

        let delayed = d.store.find_ready_delayed(Utc::now() + ChronoDuration::seconds(10), 10).await.unwrap();
        assert_eq!(delayed.len(), 1);
        d.dispatch(DispatchEvent::new(
            workflow_id,
            DispatchEventKind::TimerFired {
                task_execution_id: t1.id,
                kind: DelayKind::Timeout,
            },
        ))
        .await
        .unwrap();

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Error);
    }

    #[tokio::test]
    async fn timeout_is_cancelled_once_action_completes() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: fast
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
    timeout: 5
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        run_action(&d, workflow_id, "t1", true, Some(json!("ok"))).await;

        let delayed = d.store.find_ready_delayed(Utc::now() + ChronoDuration::seconds(10), 10).await.unwrap();
        assert!(delayed.is_empty());
    }

    #[tokio::test]
    async fn replayed_event_is_a_no_op() {
        let spec = parse_workflow_spec(
            r#"
version: "1.0"
name: greet
type: direct
start-task: t1
tasks:
  t1:
    action: std.echo
"#,
        )
        .unwrap();

        let d = dispatcher();
        let mut tx = d.store.begin().await.unwrap();
        d.store.put_workflow_definition(&mut tx, "proj", spec.clone()).await.unwrap();
        d.store.commit(tx).await.unwrap();

        let workflow_id = d.start(&spec, json!({}), "proj").await.unwrap();
        let executions = d.store.list_task_executions(workflow_id).await.unwrap();
        let task = executions.into_iter().find(|t| t.task_name == "t1").unwrap();
        let action = d.store.list_action_executions(task.id).await.unwrap().remove(0);

        let event = DispatchEvent::new(
            workflow_id,
            DispatchEventKind::ActionDone {
                task_execution_id: task.id,
                action_execution_id: action.id,
                success: true,
                result: Some(json!("ok")),
                error: None,
            },
        );
        d.dispatch(event.clone()).await.unwrap();
        d.dispatch(event).await.unwrap();

        let workflow = d.store.get_workflow_execution(workflow_id).await.unwrap();
        assert_eq!(workflow.state, ExecutionState::Success);
    }
}
