//! Scheduled tasks: cron-driven prompts queued ahead of chat traffic.
//!
//! Tasks are loaded from a JSON array:
//!
//! ```json
//! [{"id": "standup", "group_id": "team", "prompt": "Post the standup reminder",
//!   "schedule": "0 0 9 * * MON-FRI"}]
//! ```
//!
//! Schedules use the `cron` crate's format (seconds field first).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::{GroupQueue, Payload, ShutdownPhase};

/// A recurring prompt for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_id: String,
    pub prompt: String,
    /// Cron expression.
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTask {
    /// Queue payload for one firing of this task.
    pub fn payload(&self, fired_at: DateTime<Utc>) -> Payload {
        Payload::new(self.prompt.clone()).with_metadata(serde_json::json!({
            "task_id": self.id,
            "fired_at": fired_at.to_rfc3339(),
        }))
    }
}

/// Next fire time strictly after `after`.
pub fn next_cron_fire(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    let cron_schedule =
        cron::Schedule::from_str(schedule).map_err(|e| format!("invalid cron: {e}"))?;
    Ok(cron_schedule.after(&after).next())
}

struct TaskEntry {
    task: ScheduledTask,
    schedule: cron::Schedule,
    next_fire: Option<DateTime<Utc>>,
}

/// Tracks when each task fires next.
pub struct TaskScheduler {
    entries: Vec<TaskEntry>,
}

impl TaskScheduler {
    /// Parse every schedule; the first fire is the first slot after `now`.
    pub fn new(tasks: Vec<ScheduledTask>, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(tasks.len());
        for task in tasks {
            let schedule =
                cron::Schedule::from_str(&task.schedule).map_err(|e| ConfigError::InvalidValue {
                    key: format!("tasks.{}.schedule", task.id),
                    message: e.to_string(),
                })?;
            let next_fire = schedule.after(&now).next();
            entries.push(TaskEntry {
                task,
                schedule,
                next_fire,
            });
        }
        Ok(Self { entries })
    }

    /// Read tasks from a JSON file.
    pub fn load(path: &Path, now: DateTime<Utc>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let tasks: Vec<ScheduledTask> = serde_json::from_str(&raw).map_err(|e| {
            ConfigError::ParseError(format!("{}: {}", path.display(), e))
        })?;
        Self::new(tasks, now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_fire(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.task.id == task_id)
            .and_then(|e| e.next_fire)
    }

    /// Tasks due at `now`. Each returned task's next fire moves past `now`, so
    /// missed slots collapse into a single firing.
    pub fn due_tasks(&mut self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if !entry.task.enabled {
                continue;
            }
            if let Some(next) = entry.next_fire
                && next <= now
            {
                due.push(entry.task.clone());
                entry.next_fire = entry.schedule.after(&now).next();
            }
        }
        due
    }
}

/// Poll for due tasks every `interval` and queue them. Stops once the queue
/// leaves the accepting phase.
pub fn spawn_task_ticker(
    queue: GroupQueue,
    mut scheduler: TaskScheduler,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if queue.phase() != ShutdownPhase::Accepting {
                break;
            }

            let now = Utc::now();
            for task in scheduler.due_tasks(now) {
                let id = queue.enqueue_task(task.group_id.clone(), task.payload(now));
                tracing::info!(
                    task_id = %task.id,
                    group_id = %task.group_id,
                    item_id = %id,
                    "Scheduled task queued"
                );
            }
        }
        tracing::debug!("Task ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn task(id: &str, schedule: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_id: "team".to_string(),
            prompt: format!("run {id}"),
            schedule: schedule.to_string(),
            enabled: true,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn next_cron_fire_valid() {
        let next = next_cron_fire("0 0 * * * *", at(10, 30)).unwrap();
        assert_eq!(next, Some(at(11, 0)));
    }

    #[test]
    fn next_cron_fire_invalid() {
        assert!(next_cron_fire("not a cron", at(10, 30)).is_err());
    }

    #[test]
    fn due_tasks_fire_once_per_slot() {
        let mut scheduler = TaskScheduler::new(vec![task("hourly", "0 0 * * * *")], at(10, 30)).unwrap();
        assert_eq!(scheduler.next_fire("hourly"), Some(at(11, 0)));

        assert!(scheduler.due_tasks(at(10, 59)).is_empty());

        let due = scheduler.due_tasks(at(11, 0));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "hourly");
        assert_eq!(scheduler.next_fire("hourly"), Some(at(12, 0)));

        assert!(scheduler.due_tasks(at(11, 30)).is_empty());
    }

    #[test]
    fn missed_slots_collapse() {
        let mut scheduler = TaskScheduler::new(vec![task("hourly", "0 0 * * * *")], at(10, 30)).unwrap();
        assert_eq!(scheduler.due_tasks(at(14, 10)).len(), 1);
        assert_eq!(scheduler.next_fire("hourly"), Some(at(15, 0)));
    }

    #[test]
    fn disabled_tasks_never_fire() {
        let mut disabled = task("off", "0 0 * * * *");
        disabled.enabled = false;
        let mut scheduler = TaskScheduler::new(vec![disabled], at(10, 30)).unwrap();
        assert!(scheduler.due_tasks(at(23, 0)).is_empty());
    }

    #[test]
    fn invalid_schedule_rejected() {
        let err = TaskScheduler::new(vec![task("bad", "whenever")], at(10, 30))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tasks.bad.schedule"));
    }

    #[test]
    fn payload_carries_task_id() {
        let payload = task("hourly", "0 0 * * * *").payload(at(11, 0));
        assert_eq!(payload.prompt, "run hourly");
        assert_eq!(payload.metadata["task_id"], "hourly");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "a", "group_id": "team", "prompt": "p", "schedule": "0 0 9 * * *"}},
                {{"id": "b", "group_id": "main", "prompt": "q", "schedule": "0 30 * * * *", "enabled": false}}
            ]"#
        )
        .unwrap();

        let scheduler = TaskScheduler::load(file.path(), at(8, 0)).unwrap();
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.next_fire("a"), Some(at(9, 0)));
    }

    #[test]
    fn load_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = TaskScheduler::load(file.path(), at(8, 0)).err().unwrap();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
