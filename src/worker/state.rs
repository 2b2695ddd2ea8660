//! Worker run state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{WorkItem, WorkItemId, WorkKind};

/// Identifier of one execution attempt.
pub type RunId = Uuid;

/// State of a worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Launcher has been invoked.
    Starting,
    /// Worker is up and being awaited.
    Running,
    /// Worker finished with a result.
    Succeeded,
    /// Worker could not start or failed while running.
    Failed,
    /// Worker exceeded the per-run deadline and was terminated.
    TimedOut,
    /// A new attempt has been scheduled after backoff.
    RetryScheduled,
    /// No further attempts will be made.
    Abandoned,
}

impl RunState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Failed) |
            (Running, Succeeded) | (Running, Failed) | (Running, TimedOut) |
            (Failed, RetryScheduled) | (Failed, Abandoned) |
            (TimedOut, RetryScheduled) | (TimedOut, Abandoned)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::RetryScheduled | Self::Abandoned
        )
    }

    /// Starting or Running.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::RetryScheduled => "retry_scheduled",
            Self::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Lifecycle record of one admitted attempt, owned by its supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRun {
    pub run_id: RunId,
    pub item_id: WorkItemId,
    pub group_id: String,
    pub kind: WorkKind,
    pub attempt: u32,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl WorkerRun {
    pub fn new(run_id: RunId, item: &WorkItem) -> Self {
        Self {
            run_id,
            item_id: item.id,
            group_id: item.group_id.clone(),
            kind: item.kind,
            attempt: item.attempt,
            state: RunState::Starting,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: RunState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }

        Ok(())
    }

    /// Time from admission to the terminal state (or now).
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// States visited, starting with `Starting`.
    pub fn history(&self) -> Vec<RunState> {
        std::iter::once(RunState::Starting)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}
