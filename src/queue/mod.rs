//! Group queue: per-group lanes, global admission and worker supervision.
//!
//! Core components:
//! - `item`: work items (task or message batch) and their payload
//! - `lane`: per-group ordered queue with a single active-worker slot
//! - `admission`: global cap on running workers
//! - `scheduler`: the loop that owns lanes and admits work
//! - `supervisor`: drives one admitted run to its outcome
//! - `backoff`: exponential retry delays
//! - `shutdown`: drain with a deadline, then force-terminate

pub mod admission;
pub mod backoff;
pub mod item;
pub mod lane;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::QueueConfig;
use crate::error::{ConfigError, QueueError};
use crate::worker::WorkerLauncher;

pub use admission::GlobalAdmission;
pub use backoff::RetryPolicy;
pub use item::{Payload, WorkItem, WorkItemId, WorkKind};
pub use lane::{Lane, LaneStats};
pub use scheduler::QueueSnapshot;
pub use shutdown::{ShutdownPhase, ShutdownReport};
pub use supervisor::RunOutcome;

use scheduler::{Command, SchedulerLoop};
use supervisor::SupervisorContext;

/// Receiving end for run outcomes.
pub type OutcomeReceiver = mpsc::UnboundedReceiver<RunOutcome>;

/// Handle to the group queue. Cheap to clone; all clones share one scheduler.
#[derive(Clone)]
pub struct GroupQueue {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<QueueSnapshot>,
    phase: Arc<watch::Sender<ShutdownPhase>>,
}

impl GroupQueue {
    /// Spawn the scheduler loop. Must be called inside a Tokio runtime.
    ///
    /// Outcomes of every item (completed or abandoned) arrive on the returned
    /// receiver.
    pub fn start(
        config: QueueConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<(Self, OutcomeReceiver), ConfigError> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(QueueSnapshot::empty(config.max_concurrent));
        let (phase_tx, _) = watch::channel(ShutdownPhase::Accepting);
        let phase = Arc::new(phase_tx);

        let supervisor_ctx = SupervisorContext {
            launcher,
            max_retries: config.max_retries,
            worker_timeout: config.worker_timeout,
            retry: config.retry,
            outcomes: outcome_tx,
            phase: Arc::clone(&phase),
        };

        let scheduler = SchedulerLoop::new(
            config.max_concurrent,
            config.safety_wake_interval,
            command_rx,
            command_tx.downgrade(),
            snapshot_tx,
            supervisor_ctx,
        );
        tokio::spawn(scheduler.run());

        tracing::info!(
            max_concurrent = config.max_concurrent,
            max_retries = config.max_retries,
            worker_timeout_ms = config.worker_timeout.as_millis() as u64,
            "Group queue started"
        );

        Ok((
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
                phase,
            },
            outcome_rx,
        ))
    }

    /// Queue a batch of chat messages for a group.
    pub fn enqueue_message(&self, group_id: impl Into<String>, payload: Payload) -> WorkItemId {
        self.enqueue(WorkItem::message(group_id, payload))
    }

    /// Queue a scheduled task run for a group. Runs before the group's messages.
    pub fn enqueue_task(&self, group_id: impl Into<String>, payload: Payload) -> WorkItemId {
        self.enqueue(WorkItem::task(group_id, payload))
    }

    /// Queue a prepared item. Never blocks; after shutdown has begun the item
    /// is dropped.
    pub fn enqueue(&self, item: WorkItem) -> WorkItemId {
        let id = item.id;
        if let Err(e) = self.try_enqueue(item) {
            tracing::warn!(item_id = %id, "Work item dropped: {}", e);
        }
        id
    }

    /// Like [`GroupQueue::enqueue`], but reports when the item was not accepted.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<WorkItemId, QueueError> {
        if *self.phase.borrow() != ShutdownPhase::Accepting {
            return Err(QueueError::ShuttingDown);
        }
        let id = item.id;
        self.commands
            .send(Command::Enqueue(item))
            .map_err(|_| QueueError::ShuttingDown)?;
        Ok(id)
    }

    /// Whether a worker for `group_id` is currently admitted.
    pub fn is_group_active(&self, group_id: &str) -> bool {
        self.snapshot.borrow().active_groups.contains(group_id)
    }

    /// Number of workers currently admitted across all groups.
    pub fn running_count(&self) -> usize {
        self.snapshot.borrow().running
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch the scheduler's published state.
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.clone()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Per-lane queue depths and activity.
    pub async fn lane_stats(&self) -> Vec<LaneStats> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stats(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop admitting, drop queued work, wait up to `deadline` for running
    /// workers and terminate the rest. Resolves once nothing is running.
    pub async fn shutdown(&self, deadline: std::time::Duration) -> ShutdownReport {
        shutdown::coordinate(&self.commands, self.snapshot.clone(), &self.phase, deadline).await
    }
}
