//! The delay queue poller (§4.7): turns a [`crate::store::DelayedCall`]
//! whose deadline has passed into a `TimerFired` event on the dispatcher.
//!
//! Adaptive interval, grounded the same way a claimed-task poller backs
//! off when idle: polls at `min_interval` while it keeps finding ready
//! delays, backs off geometrically toward `max_interval` once a poll comes
//! back empty, and resets the moment work reappears.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::dispatch::Dispatcher;
use crate::domain::{DispatchEvent, DispatchEventKind};
use crate::store::ExecutionStore;

/// Polling configuration for the delay queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelayPollerConfig {
    /// Poll interval while delays keep being found ready.
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
    /// Poll interval once idle.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    /// Backoff multiplier applied to the interval after an empty poll.
    pub backoff_multiplier: f64,
    /// Maximum delays to fire per poll.
    pub batch_size: usize,
}

impl Default for DelayPollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            batch_size: 50,
        }
    }
}

/// Drains ready entries from an [`ExecutionStore`]'s delay queue and
/// re-enters them into the dispatcher as `TimerFired` events.
pub struct DelayPoller<S: ExecutionStore> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher<S>>,
    config: DelayPollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ExecutionStore> DelayPoller<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<Dispatcher<S>>,
        config: DelayPollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Runs the poll/dispatch/backoff loop until shutdown is signaled.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        loop {
            if *self.shutdown_rx.borrow() {
                debug!("delay poller shutting down");
                return;
            }

            let fired = self.poll_once().await;
            if fired == 0 {
                self.increase_backoff();
            } else {
                self.reset_backoff();
            }

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(self.current_interval) => {}
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// One poll/dispatch cycle; returns the number of delays fired.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> usize {
        let ready = match self
            .store
            .find_ready_delayed(chrono::Utc::now(), self.config.batch_size)
            .await
        {
            Ok(ready) => ready,
            Err(err) => {
                warn!(error = %err, "failed to poll delay queue");
                return 0;
            }
        };

        for call in &ready {
            trace!(task_execution_id = %call.task_execution_id, kind = ?call.kind, "firing delay");
            let event = DispatchEvent::new(
                call.workflow_execution_id,
                DispatchEventKind::TimerFired {
                    task_execution_id: call.task_execution_id,
                    kind: call.kind,
                },
            );
            if let Err(err) = self.dispatcher.dispatch(event).await {
                warn!(error = %err, task_execution_id = %call.task_execution_id, "failed to dispatch fired timer");
            }
        }

        ready.len()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::parse_workflow_spec;
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    #[tokio::test]
    async fn poll_once_fires_ready_retry_timer() {
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
      count: 1
      delay: 0
"#,
        )
        .unwrap();

        let store = Arc::new(InMemoryExecutionStore::new());
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));

        let mut tx = store.begin().await.unwrap();
        store
            .put_workflow_definition(&mut tx, "proj", spec.clone())
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let workflow_id = dispatcher.start(&spec, json!({}), "proj").await.unwrap();
        let executions = store.list_task_executions(workflow_id).await.unwrap();
        let task = executions.into_iter().find(|t| t.task_name == "t1").unwrap();
        let action = store.list_action_executions(task.id).await.unwrap().remove(0);

        dispatcher
            .dispatch(DispatchEvent::new(
                workflow_id,
                DispatchEventKind::ActionDone {
                    task_execution_id: task.id,
                    action_execution_id: action.id,
                    success: false,
                    result: None,
                    error: Some("boom".into()),
                },
            ))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let poller = DelayPoller::new(store.clone(), dispatcher.clone(), DelayPollerConfig::default(), rx);
        let fired = poller.poll_once().await;
        assert_eq!(fired, 1);

        let executions = store.list_task_executions(workflow_id).await.unwrap();
        let task = executions.into_iter().find(|t| t.task_name == "t1").unwrap();
        assert_eq!(task.state, crate::domain::ExecutionState::Running);
    }
}
