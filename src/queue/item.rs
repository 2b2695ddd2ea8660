//! Work items: the unit the scheduler admits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a logical work item. Retries keep the id.
pub type WorkItemId = Uuid;

/// What produced the work. Tasks always run before messages of the same group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// A scheduled task firing.
    Task,
    /// A batch of live chat messages.
    Message,
}

impl WorkKind {
    /// Priority order (lower = higher priority).
    pub fn priority(&self) -> u8 {
        match self {
            WorkKind::Task => 0,
            WorkKind::Message => 1,
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkKind::Task => write!(f, "task"),
            WorkKind::Message => write!(f, "message"),
        }
    }
}

/// What the worker is asked to do. Opaque to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Prompt handed to the agent.
    pub prompt: String,
    /// Anything the producer wants back in the outcome (chat id, task id, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Payload {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A unit of schedulable work for one group.
///
/// Items are immutable once enqueued; a retry is a fresh value built by
/// [`WorkItem::retry`].
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub group_id: String,
    pub kind: WorkKind,
    pub payload: Arc<Payload>,
    pub enqueued_at: DateTime<Utc>,
    /// Zero for the first run, incremented per retry.
    pub attempt: u32,
}

impl WorkItem {
    pub fn new(group_id: impl Into<String>, kind: WorkKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            kind,
            payload: Arc::new(payload),
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    pub fn message(group_id: impl Into<String>, payload: Payload) -> Self {
        Self::new(group_id, WorkKind::Message, payload)
    }

    pub fn task(group_id: impl Into<String>, payload: Payload) -> Self {
        Self::new(group_id, WorkKind::Task, payload)
    }

    /// The next attempt of this item, stamped with a fresh enqueue time.
    pub fn retry(&self) -> Self {
        Self {
            id: self.id,
            group_id: self.group_id.clone(),
            kind: self.kind,
            payload: Arc::clone(&self.payload),
            enqueued_at: Utc::now(),
            attempt: self.attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_outranks_message() {
        assert!(WorkKind::Task.priority() < WorkKind::Message.priority());
    }

    #[test]
    fn retry_is_a_new_value() {
        let item = WorkItem::message("g1", Payload::new("hello"));
        let retry = item.retry();

        assert_eq!(item.attempt, 0);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.id, item.id);
        assert_eq!(retry.group_id, "g1");
        assert!(Arc::ptr_eq(&retry.payload, &item.payload));
        assert!(retry.enqueued_at >= item.enqueued_at);
    }

    #[test]
    fn kind_serde() {
        let json = serde_json::to_string(&WorkKind::Task).unwrap();
        assert_eq!(json, "\"task\"");
        assert_eq!(WorkKind::Message.to_string(), "message");
    }
}
