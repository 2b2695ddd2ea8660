//! Message router: turns chat traffic into queue work and outcomes into replies.
//!
//! Every inbound message is buffered per group. The main group wakes the
//! assistant on every message; other groups only when a message matches the
//! trigger pattern. A trigger flushes the group's buffer into one Message item.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::RwLock;

use crate::channels::{ChannelManager, IncomingMessage, OutgoingResponse};
use crate::queue::{GroupQueue, OutcomeReceiver, Payload, RunOutcome, WorkItemId};

/// Most recent messages kept per group between triggers.
pub const MAX_BUFFERED_MESSAGES: usize = 50;

/// Which channel last carried traffic for each group.
pub type ReplyRoutes = Arc<RwLock<HashMap<String, String>>>;

pub struct MessageRouter {
    queue: GroupQueue,
    main_group: String,
    trigger: Regex,
    buffers: RwLock<HashMap<String, VecDeque<IncomingMessage>>>,
    routes: ReplyRoutes,
}

impl MessageRouter {
    pub fn new(queue: GroupQueue, main_group: impl Into<String>, trigger: Regex) -> Self {
        Self {
            queue,
            main_group: main_group.into(),
            trigger,
            buffers: RwLock::new(HashMap::new()),
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Shared view of group → channel, for the outcome dispatcher.
    pub fn routes(&self) -> ReplyRoutes {
        Arc::clone(&self.routes)
    }

    pub fn is_trigger(&self, msg: &IncomingMessage) -> bool {
        msg.group_id == self.main_group || self.trigger.is_match(msg.content.trim())
    }

    /// Buffer `msg` and, if it triggers, enqueue the group's batch.
    pub async fn handle(&self, msg: IncomingMessage) -> Option<WorkItemId> {
        let group_id = msg.group_id.clone();
        let payload = self.ingest(msg).await?;
        let id = self.queue.enqueue_message(group_id.clone(), payload);
        tracing::debug!(group_id = %group_id, item_id = %id, "Message batch queued");
        Some(id)
    }

    /// Buffer `msg`; returns the batch payload when the message triggers.
    pub async fn ingest(&self, msg: IncomingMessage) -> Option<Payload> {
        self.routes
            .write()
            .await
            .insert(msg.group_id.clone(), msg.channel.clone());

        let triggered = self.is_trigger(&msg);
        let group_id = msg.group_id.clone();
        let channel = msg.channel.clone();

        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(group_id.clone()).or_default();
        buffer.push_back(msg);
        while buffer.len() > MAX_BUFFERED_MESSAGES {
            buffer.pop_front();
        }

        if !triggered {
            tracing::trace!(group_id = %group_id, buffered = buffer.len(), "Message buffered");
            return None;
        }

        let batch: Vec<IncomingMessage> = buffer.drain(..).collect();
        Some(
            Payload::new(format_batch(&batch)).with_metadata(serde_json::json!({
                "channel": channel,
                "message_count": batch.len(),
            })),
        )
    }

    /// Number of messages waiting for a trigger in `group_id`.
    pub async fn buffered(&self, group_id: &str) -> usize {
        self.buffers
            .read()
            .await
            .get(group_id)
            .map_or(0, VecDeque::len)
    }
}

/// Render messages as `sender: content` lines, oldest first.
pub fn format_batch(messages: &[IncomingMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.sender(), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reply to send for an outcome, or `None` when there is nothing to say.
pub fn response_for(outcome: &RunOutcome, channel: &str) -> Option<OutgoingResponse> {
    let content = match outcome {
        RunOutcome::Completed { output, .. } => {
            let text = output.result.as_deref().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return None;
            }
            text.to_string()
        }
        RunOutcome::Abandoned { error, .. } => {
            format!("Sorry, I couldn't finish that request ({error}).")
        }
    };

    Some(OutgoingResponse {
        channel: channel.to_string(),
        group_id: outcome.group_id().to_string(),
        content,
        metadata: serde_json::json!({ "item_id": outcome.item().id }),
    })
}

/// Deliver outcomes as replies until the queue closes the outcome channel.
pub fn spawn_outcome_dispatcher(
    mut outcomes: OutcomeReceiver,
    channels: Arc<ChannelManager>,
    routes: ReplyRoutes,
    default_channel: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(outcome) = outcomes.recv().await {
            let channel = match outcome.item().payload.metadata.get("channel") {
                Some(serde_json::Value::String(name)) => name.clone(),
                _ => routes
                    .read()
                    .await
                    .get(outcome.group_id())
                    .cloned()
                    .unwrap_or_else(|| default_channel.clone()),
            };

            let Some(response) = response_for(&outcome, &channel) else {
                tracing::debug!(group_id = %outcome.group_id(), "Worker finished without a reply");
                continue;
            };
            if let Err(e) = channels.send(response).await {
                tracing::error!(group_id = %outcome.group_id(), "Failed to deliver reply: {}", e);
            }
        }
        tracing::debug!("Outcome dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, QueueConfig};
    use crate::error::WorkerError;
    use crate::queue::WorkItem;
    use crate::worker::{WorkerHandle, WorkerLauncher, WorkerOutput, WorkerRun};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct IdleLauncher;

    #[async_trait]
    impl WorkerLauncher for IdleLauncher {
        async fn start(&self, _item: &WorkItem) -> Result<Box<dyn WorkerHandle>, WorkerError> {
            Err(WorkerError::Terminal {
                reason: "not used".into(),
            })
        }
    }

    fn router() -> MessageRouter {
        let (queue, _outcomes) =
            GroupQueue::start(QueueConfig::default(), Arc::new(IdleLauncher)).unwrap();
        let trigger = HostConfig::default().trigger_pattern().unwrap();
        MessageRouter::new(queue, "main", trigger)
    }

    #[tokio::test]
    async fn main_group_always_triggers() {
        let router = router();
        let payload = router
            .ingest(IncomingMessage::new("cli", "main", "u1", "what's up"))
            .await
            .unwrap();
        assert_eq!(payload.prompt, "u1: what's up");
        assert_eq!(payload.metadata["channel"], "cli");
        assert_eq!(router.buffered("main").await, 0);
    }

    #[tokio::test]
    async fn other_groups_wait_for_trigger() {
        let router = router();
        let first = IncomingMessage::new("cli", "family", "u1", "dinner at 7?")
            .with_user_name("Alice");
        assert!(router.ingest(first).await.is_none());
        assert_eq!(router.buffered("family").await, 1);

        let second = IncomingMessage::new("cli", "family", "u2", "@andy book a table");
        let payload = router.ingest(second).await.unwrap();
        assert_eq!(payload.prompt, "Alice: dinner at 7?\nu2: @andy book a table");
        assert_eq!(payload.metadata["message_count"], 2);
        assert_eq!(router.buffered("family").await, 0);
    }

    #[tokio::test]
    async fn mention_mid_sentence_does_not_trigger() {
        let router = router();
        let msg = IncomingMessage::new("cli", "family", "u1", "ask @Andy later");
        assert!(!router.is_trigger(&msg));
        let msg = IncomingMessage::new("cli", "family", "u1", "@Andyx hello");
        assert!(!router.is_trigger(&msg));
    }

    #[tokio::test]
    async fn buffer_is_capped() {
        let router = router();
        for i in 0..(MAX_BUFFERED_MESSAGES + 10) {
            let msg = IncomingMessage::new("cli", "family", "u1", format!("msg {i}"));
            assert!(router.ingest(msg).await.is_none());
        }
        assert_eq!(router.buffered("family").await, MAX_BUFFERED_MESSAGES);

        let payload = router
            .ingest(IncomingMessage::new("cli", "family", "u1", "@Andy summarize"))
            .await
            .unwrap();
        assert_eq!(payload.metadata["message_count"], MAX_BUFFERED_MESSAGES);
        assert!(payload.prompt.starts_with("u1: msg 11\n"));
    }

    #[tokio::test]
    async fn routes_track_last_channel() {
        let router = router();
        router
            .ingest(IncomingMessage::new("telegram", "family", "u1", "hi"))
            .await;
        let routes = router.routes();
        assert_eq!(
            routes.read().await.get("family").map(String::as_str),
            Some("telegram")
        );
    }

    fn completed(result: Option<&str>) -> RunOutcome {
        let item = WorkItem::message("g1", Payload::new("p"));
        let run = WorkerRun::new(Uuid::new_v4(), &item);
        RunOutcome::Completed {
            item,
            output: WorkerOutput {
                result: result.map(String::from),
                session_id: None,
            },
            run,
        }
    }

    #[test]
    fn completed_outcome_becomes_reply() {
        let response = response_for(&completed(Some("  done  ")), "cli").unwrap();
        assert_eq!(response.channel, "cli");
        assert_eq!(response.group_id, "g1");
        assert_eq!(response.content, "done");
    }

    #[test]
    fn empty_result_sends_nothing() {
        assert!(response_for(&completed(None), "cli").is_none());
        assert!(response_for(&completed(Some("   ")), "cli").is_none());
    }

    #[test]
    fn abandoned_outcome_becomes_notice() {
        let item = WorkItem::task("g1", Payload::new("p"));
        let run = WorkerRun::new(Uuid::new_v4(), &item);
        let outcome = RunOutcome::Abandoned {
            item,
            error: WorkerError::Terminal {
                reason: "bad input".into(),
            },
            run,
        };
        let response = response_for(&outcome, "cli").unwrap();
        assert!(response.content.starts_with("Sorry"));
        assert!(response.content.contains("bad input"));
    }
}
