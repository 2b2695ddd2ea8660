use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use chatlane::channels::{ChannelManager, CliChannel};
use chatlane::config::{HostConfig, QueueConfig};
use chatlane::queue::GroupQueue;
use chatlane::router::{self, MessageRouter};
use chatlane::tasks::{self, TaskScheduler};
use chatlane::worker::{ProcessLauncher, ProcessLauncherConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let queue_config = QueueConfig::from_env().context("invalid queue configuration")?;
    let host_config = HostConfig::from_env().context("invalid host configuration")?;

    // Initialize tracing; the guard flushes the log file on exit.
    let (file_layer, _log_guard) = match &host_config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chatlane.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    eprintln!("chatlane v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Assistant: @{}", host_config.assistant_name);
    eprintln!("   Main group: {}", host_config.main_group);
    eprintln!("   Worker: {}", host_config.worker_program);
    eprintln!("   Max concurrent workers: {}", queue_config.max_concurrent);
    eprintln!("   Type `group: message` and press Enter. Ctrl+C to exit.\n");

    // ── Queue ───────────────────────────────────────────────────────────
    let launcher = ProcessLauncher::new(
        ProcessLauncherConfig::new(host_config.worker_program.clone())
            .with_args(host_config.worker_args.clone()),
    );
    let (queue, outcomes) = GroupQueue::start(queue_config.clone(), Arc::new(launcher))
        .context("failed to start group queue")?;

    // ── Channels ────────────────────────────────────────────────────────
    let mut channels = ChannelManager::new();
    channels.add(Arc::new(CliChannel::new(host_config.main_group.clone())));
    let channels = Arc::new(channels);
    let mut messages = channels
        .start_all()
        .await
        .context("failed to start channels")?;

    let trigger = host_config
        .trigger_pattern()
        .context("invalid assistant name")?;
    let router = MessageRouter::new(queue.clone(), host_config.main_group.clone(), trigger);
    let dispatcher = router::spawn_outcome_dispatcher(
        outcomes,
        Arc::clone(&channels),
        router.routes(),
        "cli".to_string(),
    );

    // ── Scheduled tasks ─────────────────────────────────────────────────
    let ticker = match &host_config.tasks_file {
        Some(path) => {
            let scheduler = TaskScheduler::load(path, Utc::now())
                .with_context(|| format!("failed to load tasks from {}", path.display()))?;
            eprintln!("   Scheduled tasks: {}", scheduler.len());
            Some(tasks::spawn_task_ticker(
                queue.clone(),
                scheduler,
                host_config.task_tick_interval,
            ))
        }
        None => None,
    };

    // ── Message loop ────────────────────────────────────────────────────
    tracing::info!("chatlane ready and listening");
    loop {
        let message = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down...");
                break;
            }
            msg = messages.next() => match msg {
                Some(m) => m,
                None => {
                    tracing::info!("All channel streams ended, shutting down...");
                    break;
                }
            },
        };
        router.handle(message).await;
    }

    if let Some(ticker) = ticker {
        ticker.abort();
    }

    let report = queue.shutdown(queue_config.shutdown_deadline).await;
    if !report.drained_cleanly() {
        tracing::warn!(
            terminated = report.terminated,
            stranded = report.stranded,
            "Workers were terminated at shutdown"
        );
    }

    drop(router);
    drop(queue);
    // Replies for runs that finished during shutdown are still delivered.
    if tokio::time::timeout(std::time::Duration::from_secs(2), dispatcher)
        .await
        .is_err()
    {
        tracing::debug!("Outcome dispatcher still busy at exit");
    }
    channels.shutdown_all().await;

    Ok(())
}
