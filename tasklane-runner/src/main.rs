//! Tasklane Runner
//!
//! Submits one command to the configured backend and waits for it.
//!
//! Usage: `tasklane-runner <command> [args...]`
//!
//! The backend and task settings come from `TASKLANE_*` environment
//! variables (see [`config::Config::from_env`]). The process exits
//! successfully only if the task ends in `DONE`; Ctrl-C cancels the task and
//! waits for the backend to confirm.

mod config;

use anyhow::{Context, Result};
use tasklane_core::{Task, TaskState};
use tasklane_scheduler::{ControlLoop, SchedulerRegistry};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklane_runner=info,tasklane_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let command: Vec<String> = std::env::args().skip(1).collect();
    if command.is_empty() {
        anyhow::bail!("usage: tasklane-runner <command> [args...]");
    }

    let config = load_config()?;
    info!(
        "Loaded configuration: backend={}, poll_interval={:?}",
        config.backend, config.poll_interval
    );

    let registry = SchedulerRegistry::from_config(config.backends_config());
    let adapter = registry
        .get_scheduler(&config.backend)
        .with_context(|| format!("Available backends: {}", registry.names().join(", ")))?;

    let mut task = Task::new(config.task_name.clone(), command);
    if let Some(limit) = config.wall_clock_limit {
        task = task.with_wall_clock_limit(limit);
    }

    let mut control = ControlLoop::new(adapter, config.loop_config());
    let id = control
        .submit(task, config.activation_script.as_deref())
        .await
        .context("Failed to submit task")?;
    info!("Submitted task {} to the {} backend", id, config.backend);

    let handle = control.handle();
    let interrupted = id.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling task {}", interrupted);
            if let Err(e) = handle.cancel(interrupted).await {
                error!("Failed to cancel task: {}", e);
            }
        }
    });

    let completed = control
        .run_until_idle()
        .await
        .context("Control loop failed")?;
    let task = completed
        .into_iter()
        .find(|task| task.id() == Some(&id))
        .context("Task missing from the completed log")?;

    if task.state() != TaskState::Done {
        anyhow::bail!("Task {} ended in state {}", id, task.state());
    }

    info!("Task {} completed successfully", id);
    Ok(())
}

/// Loads and validates configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Invalid TASKLANE_* environment")?;
    config.validate()?;
    Ok(config)
}
