use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of a [`crate::store::DelayedCall`] entry (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DelayKind {
    WaitBefore,
    WaitAfter,
    Retry,
    Timeout,
}

/// An inbound event handled atomically by the dispatcher (§4.6).
///
/// Carries a stable `event_id` so a handler that is retried after a
/// storage conflict, or replayed after a crash between commit and
/// acknowledgement, can be recognized as already applied (P5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub event_id: Uuid,
    pub workflow_execution_id: Uuid,
    pub kind: DispatchEventKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchEventKind {
    Start,
    TaskStart {
        task_execution_id: Uuid,
    },
    ActionDone {
        task_execution_id: Uuid,
        action_execution_id: Uuid,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    },
    TimerFired {
        task_execution_id: Uuid,
        kind: DelayKind,
    },
    Stop,
    Cancel,
    Rerun {
        task_name: String,
    },
}

impl DispatchEvent {
    pub fn new(workflow_execution_id: Uuid, kind: DispatchEventKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workflow_execution_id,
            kind,
            occurred_at: Utc::now(),
        }
    }
}
