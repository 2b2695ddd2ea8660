//! Scheduler loop: the single owner of lanes and the global admission count.
//!
//! Producers and supervisors talk to the loop over an unbounded command
//! channel. Every wake drains whatever commands are waiting, then runs one
//! admission cycle and publishes a snapshot for read-only introspection.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::queue::admission::GlobalAdmission;
use crate::queue::item::WorkItem;
use crate::queue::lane::{Lane, LaneStats};
use crate::queue::supervisor::{Supervisor, SupervisorContext};
use crate::worker::RunId;

/// Requests handled by the scheduler loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// New work, or a retry whose backoff has elapsed.
    Enqueue(WorkItem),
    /// A supervisor is done with its slots.
    Finished { group_id: String, run_id: RunId },
    /// Per-lane statistics.
    Stats(oneshot::Sender<Vec<LaneStats>>),
    /// Stop admitting and drop queued work; replies with the number dropped.
    Drain(oneshot::Sender<usize>),
    /// Exit the loop.
    Stop,
}

/// Read-only view of the scheduler, republished after every wake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub running: usize,
    pub max_concurrent: usize,
    pub active_groups: BTreeSet<String>,
    pub queued: usize,
    pub draining: bool,
}

impl QueueSnapshot {
    pub(crate) fn empty(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }
}

pub(crate) struct SchedulerLoop {
    lanes: Vec<Lane>,
    index: HashMap<String, usize>,
    admission: GlobalAdmission,
    /// Lane the next cycle starts from.
    cursor: usize,
    draining: bool,
    safety_wake_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Handed to supervisors; weak so the loop alone does not keep the channel open.
    command_tx: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<QueueSnapshot>,
    supervisor_ctx: SupervisorContext,
}

impl SchedulerLoop {
    pub(crate) fn new(
        max_concurrent: usize,
        safety_wake_interval: Duration,
        commands: mpsc::UnboundedReceiver<Command>,
        command_tx: mpsc::WeakUnboundedSender<Command>,
        snapshot: watch::Sender<QueueSnapshot>,
        supervisor_ctx: SupervisorContext,
    ) -> Self {
        Self {
            lanes: Vec::new(),
            index: HashMap::new(),
            admission: GlobalAdmission::new(max_concurrent),
            cursor: 0,
            draining: false,
            safety_wake_interval,
            commands,
            command_tx,
            snapshot,
            supervisor_ctx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut safety = tokio::time::interval(self.safety_wake_interval);
        safety.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut open = true;
        while open {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            open = self.handle(command);
                            while open {
                                match self.commands.try_recv() {
                                    Ok(command) => open = self.handle(command),
                                    Err(_) => break,
                                }
                            }
                        }
                        None => open = false,
                    }
                }
                _ = safety.tick() => {
                    tracing::trace!("Scheduler safety wake");
                }
            }

            if open {
                self.schedule();
            }
            self.publish();
        }

        tracing::debug!(
            running = self.admission.running(),
            "Scheduler loop stopped"
        );
    }

    /// Apply one command. Returns false when the loop should exit.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue(item) => self.enqueue(item),
            Command::Finished { group_id, run_id } => self.finish(&group_id, run_id),
            Command::Stats(reply) => {
                let stats = self.lanes.iter().map(Lane::stats).collect();
                let _ = reply.send(stats);
            }
            Command::Drain(reply) => {
                let dropped = self.drain();
                let _ = reply.send(dropped);
            }
            Command::Stop => return false,
        }
        true
    }

    fn enqueue(&mut self, item: WorkItem) {
        if self.draining {
            tracing::debug!(
                group_id = %item.group_id,
                item_id = %item.id,
                "Queue draining, dropping work item"
            );
            return;
        }

        let idx = match self.index.get(&item.group_id) {
            Some(idx) => *idx,
            None => {
                self.lanes.push(Lane::new(item.group_id.clone()));
                let idx = self.lanes.len() - 1;
                self.index.insert(item.group_id.clone(), idx);
                idx
            }
        };

        let lane = &mut self.lanes[idx];
        tracing::debug!(
            group_id = %item.group_id,
            item_id = %item.id,
            kind = %item.kind,
            attempt = item.attempt,
            queued = lane.len(),
            active = lane.is_active(),
            "Lane enqueue"
        );
        lane.enqueue(item);
    }

    /// Release the lane slot, then the global slot. A lane release that does
    /// not match leaves the global count alone.
    fn finish(&mut self, group_id: &str, run_id: RunId) {
        let Some(&idx) = self.index.get(group_id) else {
            tracing::error!(group_id = %group_id, run_id = %run_id, "Finished run for unknown lane");
            return;
        };

        if let Err(e) = self.lanes[idx].release(run_id) {
            tracing::error!(group_id = %group_id, run_id = %run_id, "{}", e);
            return;
        }

        if let Err(e) = self.admission.release() {
            tracing::error!(group_id = %group_id, run_id = %run_id, "{}", e);
        }
    }

    fn drain(&mut self) -> usize {
        self.draining = true;
        let dropped: usize = self.lanes.iter_mut().map(Lane::clear).sum();
        tracing::info!(
            dropped,
            running = self.admission.running(),
            "Queue draining"
        );
        dropped
    }

    /// One admission cycle over the lanes, starting at the round-robin cursor.
    fn schedule(&mut self) {
        if self.draining || self.lanes.is_empty() {
            return;
        }

        let len = self.lanes.len();
        let start = self.cursor % len;

        for offset in 0..len {
            let idx = (start + offset) % len;
            if !self.lanes[idx].is_eligible() {
                continue;
            }
            if !self.admission.try_acquire() {
                tracing::debug!(
                    running = self.admission.running(),
                    max = self.admission.max_concurrent(),
                    "At concurrency limit, waiting for a slot"
                );
                break;
            }

            let lane = &mut self.lanes[idx];
            let run_id = Uuid::new_v4();
            let activated = match lane.peek_next().map(|item| item.id) {
                Some(item_id) => lane.try_activate(item_id, run_id),
                None => None,
            };

            match activated {
                Some(item) => {
                    self.cursor = idx + 1;
                    self.dispatch(idx, run_id, item);
                }
                None => {
                    tracing::warn!(
                        group_id = %self.lanes[idx].group_id(),
                        "Lane activation lost a race, returning global slot"
                    );
                    if let Err(e) = self.admission.release() {
                        tracing::error!("{}", e);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, idx: usize, run_id: RunId, item: WorkItem) {
        let Some(commands) = self.command_tx.upgrade() else {
            tracing::warn!(
                group_id = %item.group_id,
                "Queue handles dropped, not starting worker"
            );
            if self.lanes[idx].release(run_id).is_ok()
                && let Err(e) = self.admission.release()
            {
                tracing::error!("{}", e);
            }
            return;
        };

        tracing::info!(
            group_id = %item.group_id,
            item_id = %item.id,
            run_id = %run_id,
            kind = %item.kind,
            attempt = item.attempt,
            running = self.admission.running(),
            "Admitting work item"
        );

        let supervisor = Supervisor::new(run_id, item, self.supervisor_ctx.clone(), commands);
        tokio::spawn(supervisor.run());
    }

    fn publish(&self) {
        let active_groups: BTreeSet<String> = self
            .lanes
            .iter()
            .filter(|lane| lane.is_active())
            .map(|lane| lane.group_id().to_string())
            .collect();
        debug_assert_eq!(active_groups.len(), self.admission.running());

        self.snapshot.send_replace(QueueSnapshot {
            running: self.admission.running(),
            max_concurrent: self.admission.max_concurrent(),
            active_groups,
            queued: self.lanes.iter().map(Lane::len).sum(),
            draining: self.draining,
        });
    }
}
