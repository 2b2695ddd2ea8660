//! Shutdown coordination: drain the queue, wait for running workers up to a
//! deadline, then force-terminate whatever is left.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::queue::scheduler::{Command, QueueSnapshot};

/// How long force-terminated workers get to report back.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Where the queue is in its shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    /// Normal operation.
    Accepting,
    /// No new admissions; running workers are allowed to finish.
    Draining,
    /// Deadline passed; running workers are being killed.
    Terminating,
}

/// What happened during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued items discarded without running.
    pub dropped: usize,
    /// Workers still running at the deadline and force-terminated.
    pub terminated: usize,
    /// Workers that had not reported back even after termination.
    pub stranded: usize,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Every running worker finished on its own before the deadline.
    pub fn drained_cleanly(&self) -> bool {
        self.terminated == 0 && self.stranded == 0
    }
}

/// Resolve once `done` holds for the current phase. Pends forever if the
/// phase sender is gone.
pub(crate) async fn wait_for_phase(
    mut phase: watch::Receiver<ShutdownPhase>,
    done: impl Fn(ShutdownPhase) -> bool,
) {
    loop {
        if done(*phase.borrow_and_update()) {
            return;
        }
        if phase.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve once nothing is running (or the scheduler has exited).
async fn wait_until_idle(mut snapshot: watch::Receiver<QueueSnapshot>) {
    loop {
        if snapshot.borrow_and_update().running == 0 {
            return;
        }
        if snapshot.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) async fn coordinate(
    commands: &mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<QueueSnapshot>,
    phase: &watch::Sender<ShutdownPhase>,
    deadline: Duration,
) -> ShutdownReport {
    let started = Instant::now();
    phase.send_replace(ShutdownPhase::Draining);

    let (reply_tx, reply_rx) = oneshot::channel();
    let dropped = if commands.send(Command::Drain(reply_tx)).is_ok() {
        reply_rx.await.unwrap_or(0)
    } else {
        0
    };

    let running = snapshot.borrow().running;
    tracing::info!(
        running,
        dropped,
        deadline_ms = deadline.as_millis() as u64,
        "Shutdown: waiting for running workers"
    );

    let mut terminated = 0;
    let mut stranded = 0;
    if tokio::time::timeout(deadline, wait_until_idle(snapshot.clone()))
        .await
        .is_err()
    {
        terminated = snapshot.borrow().running;
        tracing::warn!(
            remaining = terminated,
            "Shutdown deadline reached, terminating workers"
        );
        phase.send_replace(ShutdownPhase::Terminating);

        if tokio::time::timeout(TERMINATE_GRACE, wait_until_idle(snapshot.clone()))
            .await
            .is_err()
        {
            stranded = snapshot.borrow().running;
            tracing::error!(
                stranded,
                "Workers did not report back after termination"
            );
        }
    }

    let _ = commands.send(Command::Stop);

    let report = ShutdownReport {
        dropped,
        terminated,
        stranded,
        elapsed: started.elapsed(),
    };
    tracing::info!(
        dropped = report.dropped,
        terminated = report.terminated,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Shutdown complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_phase_sees_current_value() {
        let (tx, rx) = watch::channel(ShutdownPhase::Terminating);
        wait_for_phase(rx, |p| p == ShutdownPhase::Terminating).await;
        drop(tx);
    }

    #[tokio::test]
    async fn wait_for_phase_wakes_on_change() {
        let (tx, rx) = watch::channel(ShutdownPhase::Accepting);
        let waiter = tokio::spawn(wait_for_phase(rx, |p| p != ShutdownPhase::Accepting));
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send_replace(ShutdownPhase::Draining);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_phase_pends_when_sender_dropped() {
        let (tx, rx) = watch::channel(ShutdownPhase::Accepting);
        drop(tx);
        let waited = tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_phase(rx, |p| p == ShutdownPhase::Terminating),
        )
        .await;
        assert!(waited.is_err());
    }

    #[test]
    fn clean_report() {
        let report = ShutdownReport {
            dropped: 3,
            terminated: 0,
            stranded: 0,
            elapsed: Duration::from_millis(10),
        };
        assert!(report.drained_cleanly());
    }
}
