//! Per-group lane: ordered pending work plus the group's single worker slot.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{QueueError, ReleaseScope};
use crate::queue::item::{WorkItem, WorkItemId, WorkKind};
use crate::worker::RunId;

/// Pending work and the active run for one group.
///
/// The queue is kept as two partitions, tasks first then messages, each in
/// enqueue order.
#[derive(Debug)]
pub struct Lane {
    group_id: String,
    queue: VecDeque<WorkItem>,
    active: Option<RunId>,
    total_processed: u64,
}

impl Lane {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            queue: VecDeque::new(),
            active: None,
            total_processed: 0,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Queue an item. Tasks go behind earlier tasks but ahead of every message.
    pub fn enqueue(&mut self, item: WorkItem) {
        match item.kind {
            WorkKind::Message => self.queue.push_back(item),
            WorkKind::Task => {
                let at = self
                    .queue
                    .iter()
                    .position(|queued| queued.kind == WorkKind::Message)
                    .unwrap_or(self.queue.len());
                self.queue.insert(at, item);
            }
        }
    }

    pub fn peek_next(&self) -> Option<&WorkItem> {
        self.queue.front()
    }

    /// Claim the group slot for `run_id` and take `item_id` out of the queue.
    ///
    /// Returns `None` when a run is already active or the item is gone.
    pub fn try_activate(&mut self, item_id: WorkItemId, run_id: RunId) -> Option<WorkItem> {
        if self.active.is_some() {
            return None;
        }
        let at = self.queue.iter().position(|queued| queued.id == item_id)?;
        let item = self.queue.remove(at)?;
        self.active = Some(run_id);
        Some(item)
    }

    /// Free the group slot held by `run_id`.
    pub fn release(&mut self, run_id: RunId) -> Result<(), QueueError> {
        if self.active != Some(run_id) {
            return Err(QueueError::DoubleRelease {
                scope: ReleaseScope::Lane,
                group_id: Some(self.group_id.clone()),
            });
        }
        self.active = None;
        self.total_processed += 1;
        Ok(())
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Has queued work and a free slot.
    pub fn is_eligible(&self) -> bool {
        self.active.is_none() && !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop everything still queued, returning how many items were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn stats(&self) -> LaneStats {
        LaneStats {
            group_id: self.group_id.clone(),
            queued_tasks: self
                .queue
                .iter()
                .filter(|item| item.kind == WorkKind::Task)
                .count(),
            queued_messages: self
                .queue
                .iter()
                .filter(|item| item.kind == WorkKind::Message)
                .count(),
            active: self.active.is_some(),
            total_processed: self.total_processed,
        }
    }
}

/// Statistics for a single lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub group_id: String,
    pub queued_tasks: usize,
    pub queued_messages: usize,
    pub active: bool,
    pub total_processed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::item::Payload;
    use uuid::Uuid;

    fn message(text: &str) -> WorkItem {
        WorkItem::message("g1", Payload::new(text))
    }

    fn task(text: &str) -> WorkItem {
        WorkItem::task("g1", Payload::new(text))
    }

    fn prompts(lane: &mut Lane) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(next) = lane.peek_next().map(|item| item.id) {
            let run = Uuid::new_v4();
            let item = lane.try_activate(next, run).unwrap();
            lane.release(run).unwrap();
            out.push(item.payload.prompt.clone());
        }
        out
    }

    #[test]
    fn tasks_jump_messages_but_not_tasks() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("m1"));
        lane.enqueue(task("t1"));
        lane.enqueue(message("m2"));
        lane.enqueue(task("t2"));

        assert_eq!(prompts(&mut lane), vec!["t1", "t2", "m1", "m2"]);
    }

    #[test]
    fn messages_are_fifo() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("a"));
        lane.enqueue(message("b"));
        lane.enqueue(message("c"));

        assert_eq!(prompts(&mut lane), vec!["a", "b", "c"]);
    }

    #[test]
    fn single_active_run() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("a"));
        lane.enqueue(message("b"));

        let first = lane.peek_next().unwrap().id;
        let run = Uuid::new_v4();
        assert!(lane.try_activate(first, run).is_some());
        assert!(!lane.is_eligible());

        let second = lane.peek_next().unwrap().id;
        assert!(lane.try_activate(second, Uuid::new_v4()).is_none());
        assert_eq!(lane.len(), 1);

        lane.release(run).unwrap();
        assert!(lane.is_eligible());
    }

    #[test]
    fn double_release_is_reported() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("a"));
        let id = lane.peek_next().unwrap().id;
        let run = Uuid::new_v4();
        lane.try_activate(id, run).unwrap();

        assert!(lane.release(run).is_ok());
        assert_eq!(
            lane.release(run),
            Err(QueueError::DoubleRelease {
                scope: ReleaseScope::Lane,
                group_id: Some("g1".to_string()),
            })
        );
        assert!(!lane.is_active());
        assert_eq!(lane.stats().total_processed, 1);
    }

    #[test]
    fn release_with_wrong_run_keeps_slot() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("a"));
        let id = lane.peek_next().unwrap().id;
        let run = Uuid::new_v4();
        lane.try_activate(id, run).unwrap();

        assert!(lane.release(Uuid::new_v4()).is_err());
        assert_eq!(lane.active_run(), Some(run));
    }

    #[test]
    fn stats_split_by_kind() {
        let mut lane = Lane::new("g1");
        lane.enqueue(message("a"));
        lane.enqueue(task("t"));
        lane.enqueue(message("b"));

        let stats = lane.stats();
        assert_eq!(stats.queued_tasks, 1);
        assert_eq!(stats.queued_messages, 2);
        assert!(!stats.active);

        assert_eq!(lane.clear(), 3);
        assert!(lane.is_empty());
    }
}
