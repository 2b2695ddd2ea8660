//! Worker boundary: how the queue starts, awaits and stops agent processes.
//!
//! - `state`: run lifecycle (Starting → Running → Succeeded/Failed/TimedOut)
//! - `process`: launcher that runs the agent as a child process

pub mod process;
pub mod state;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::queue::WorkItem;

pub use process::{ProcessLauncher, ProcessLauncherConfig};
pub use state::{RunId, RunState, StateTransition, WorkerRun};

/// Result of a successful worker run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Reply text, if the agent produced one.
    pub result: Option<String>,
    /// Agent session to resume next time, if the worker reported one.
    #[serde(default)]
    pub session_id: Option<String>,
}

impl WorkerOutput {
    pub fn text(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            session_id: None,
        }
    }
}

/// Starts a worker for an admitted item.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Launch the worker. Failing here is a retryable [`WorkerError::Start`].
    async fn start(&self, item: &WorkItem) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

/// A running worker.
#[async_trait]
pub trait WorkerHandle: Send {
    /// Wait until the worker finishes. Must be cancel-safe: the supervisor
    /// drops this future on timeout or shutdown and calls `terminate`.
    async fn wait(&mut self) -> Result<WorkerOutput, WorkerError>;

    /// Force the worker to stop.
    async fn terminate(&mut self);
}
