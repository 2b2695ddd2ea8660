//! Worker supervisor: owns one admitted run from launch to terminal state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};

use crate::error::WorkerError;
use crate::queue::backoff::RetryPolicy;
use crate::queue::item::WorkItem;
use crate::queue::scheduler::Command;
use crate::queue::shutdown::{ShutdownPhase, wait_for_phase};
use crate::worker::{RunId, RunState, WorkerLauncher, WorkerOutput, WorkerRun};

/// How an item ended, delivered on the outcome channel.
///
/// Retries are not reported; only the final attempt produces an outcome.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed {
        item: WorkItem,
        output: WorkerOutput,
        run: WorkerRun,
    },
    Abandoned {
        item: WorkItem,
        error: WorkerError,
        run: WorkerRun,
    },
}

impl RunOutcome {
    pub fn item(&self) -> &WorkItem {
        match self {
            Self::Completed { item, .. } | Self::Abandoned { item, .. } => item,
        }
    }

    pub fn run(&self) -> &WorkerRun {
        match self {
            Self::Completed { run, .. } | Self::Abandoned { run, .. } => run,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.item().group_id
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Everything a supervisor needs besides its item.
#[derive(Clone)]
pub(crate) struct SupervisorContext {
    pub launcher: Arc<dyn WorkerLauncher>,
    pub max_retries: u32,
    pub worker_timeout: Duration,
    pub retry: RetryPolicy,
    pub outcomes: mpsc::UnboundedSender<RunOutcome>,
    pub phase: Arc<watch::Sender<ShutdownPhase>>,
}

/// Hands the group and global slots back to the scheduler exactly once,
/// including when the supervisor task panics.
struct SlotGuard {
    group_id: String,
    run_id: RunId,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl SlotGuard {
    fn release(&mut self) {
        if let Some(commands) = self.commands.take() {
            let finished = Command::Finished {
                group_id: self.group_id.clone(),
                run_id: self.run_id,
            };
            if commands.send(finished).is_err() {
                tracing::debug!(group_id = %self.group_id, "Scheduler gone, slot release skipped");
            }
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.commands.is_some() {
            tracing::warn!(
                group_id = %self.group_id,
                run_id = %self.run_id,
                "Supervisor exited without releasing its slot"
            );
            self.release();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

enum Wake {
    Finished(Result<WorkerOutput, WorkerError>),
    TimedOut,
    Terminate,
}

pub(crate) struct Supervisor {
    item: WorkItem,
    run: WorkerRun,
    ctx: SupervisorContext,
    commands: mpsc::UnboundedSender<Command>,
    slot: SlotGuard,
}

impl Supervisor {
    pub(crate) fn new(
        run_id: RunId,
        item: WorkItem,
        ctx: SupervisorContext,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let slot = SlotGuard {
            group_id: item.group_id.clone(),
            run_id,
            commands: Some(commands.clone()),
        };
        Self {
            run: WorkerRun::new(run_id, &item),
            item,
            ctx,
            commands,
            slot,
        }
    }

    pub(crate) async fn run(mut self) {
        let result = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(WorkerError::Terminal {
                reason: format!("worker panicked: {}", panic_message(panic.as_ref())),
            }),
        };
        match result {
            Ok(output) => self.succeed(output),
            Err(error) => self.fail(error).await,
        }
    }

    /// Start the worker and wait for it, bounded by the run timeout and shutdown.
    async fn execute(&mut self) -> Result<WorkerOutput, WorkerError> {
        let timeout = self.ctx.worker_timeout;

        let starting = tokio::select! {
            result = tokio::time::timeout(timeout, self.ctx.launcher.start(&self.item)) => Some(result),
            _ = wait_for_phase(self.ctx.phase.subscribe(), |p| p == ShutdownPhase::Terminating) => None,
        };
        let mut handle = match starting {
            Some(Ok(started)) => started?,
            Some(Err(_)) => {
                return Err(WorkerError::Start {
                    reason: format!("launcher did not respond within {timeout:?}"),
                });
            }
            None => {
                tracing::warn!(
                    group_id = %self.item.group_id,
                    run_id = %self.run.run_id,
                    "Shutdown deadline reached while worker was starting"
                );
                return Err(WorkerError::Cancelled);
            }
        };
        self.transition(RunState::Running, None);

        let phase = self.ctx.phase.subscribe();
        let wake = tokio::select! {
            result = tokio::time::timeout(timeout, handle.wait()) => match result {
                Ok(result) => Wake::Finished(result),
                Err(_) => Wake::TimedOut,
            },
            _ = wait_for_phase(phase, |p| p == ShutdownPhase::Terminating) => Wake::Terminate,
        };

        match wake {
            Wake::Finished(result) => result,
            Wake::TimedOut => {
                tracing::warn!(
                    group_id = %self.item.group_id,
                    run_id = %self.run.run_id,
                    ?timeout,
                    "Worker timed out, terminating"
                );
                handle.terminate().await;
                Err(WorkerError::Timeout { timeout })
            }
            Wake::Terminate => {
                tracing::warn!(
                    group_id = %self.item.group_id,
                    run_id = %self.run.run_id,
                    "Shutdown deadline reached, terminating worker"
                );
                handle.terminate().await;
                Err(WorkerError::Cancelled)
            }
        }
    }

    fn succeed(mut self, output: WorkerOutput) {
        self.transition(RunState::Succeeded, None);
        tracing::info!(
            group_id = %self.item.group_id,
            run_id = %self.run.run_id,
            attempt = self.item.attempt,
            elapsed_ms = self.run.elapsed().as_millis() as u64,
            "Worker succeeded"
        );

        self.deliver(RunOutcome::Completed {
            item: self.item.clone(),
            output,
            run: self.run.clone(),
        });
        self.slot.release();
    }

    async fn fail(mut self, error: WorkerError) {
        let state = if error.is_timeout() {
            RunState::TimedOut
        } else {
            RunState::Failed
        };
        self.transition(state, Some(error.to_string()));

        let accepting = *self.ctx.phase.borrow() == ShutdownPhase::Accepting;
        let attempt = self.item.attempt;

        if error.is_retryable() && accepting && attempt < self.ctx.max_retries {
            let delay = self.ctx.retry.delay(attempt);
            self.transition(
                RunState::RetryScheduled,
                Some(format!("retry in {delay:?}")),
            );
            tracing::warn!(
                group_id = %self.item.group_id,
                run_id = %self.run.run_id,
                attempt,
                max_retries = self.ctx.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Worker failed, retrying: {}",
                error
            );

            // The group can run other work while this item backs off.
            self.slot.release();
            self.retry_after(delay).await;
            return;
        }

        let error = if error.is_retryable() && accepting {
            WorkerError::RetriesExhausted {
                attempts: attempt + 1,
                last: Box::new(error),
            }
        } else {
            error
        };
        self.transition(RunState::Abandoned, Some(error.to_string()));
        tracing::error!(
            group_id = %self.item.group_id,
            run_id = %self.run.run_id,
            item_id = %self.item.id,
            attempt,
            "Abandoning work item: {}",
            error
        );

        self.slot.release();
        self.deliver(RunOutcome::Abandoned {
            item: self.item.clone(),
            error,
            run: self.run.clone(),
        });
    }

    /// Re-enqueue the next attempt once `delay` has passed, unless shutdown starts first.
    async fn retry_after(self, delay: Duration) {
        let retry = self.item.retry();
        let phase = self.ctx.phase.subscribe();

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if self.commands.send(Command::Enqueue(retry)).is_err() {
                    tracing::debug!(group_id = %self.item.group_id, "Scheduler gone, retry dropped");
                }
            }
            _ = wait_for_phase(phase, |p| p != ShutdownPhase::Accepting) => {
                tracing::info!(
                    group_id = %self.item.group_id,
                    item_id = %self.item.id,
                    "Shutdown started, pending retry dropped"
                );
            }
        }
    }

    fn deliver(&self, outcome: RunOutcome) {
        if self.ctx.outcomes.send(outcome).is_err() {
            tracing::debug!(group_id = %self.item.group_id, "Outcome receiver dropped");
        }
    }

    fn transition(&mut self, state: RunState, reason: Option<String>) {
        if let Err(e) = self.run.transition_to(state, reason) {
            tracing::error!(run_id = %self.run.run_id, "{}", e);
        }
    }
}
