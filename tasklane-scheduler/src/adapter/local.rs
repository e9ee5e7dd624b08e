//! Local subprocess backend
//!
//! Runs each task as a child process of this one. Process state is read
//! with a non-blocking `try_wait` on every kick, so a poll cycle never waits
//! for a child to finish.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tasklane_core::{Task, TaskId, TaskState};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::tracker::Tracker;
use super::{BackendAdapter, Operation, cancel_target, ensure_new, ensure_owner};
use crate::config::LocalConfig;
use crate::error::{Result, SchedulerError};

const BACKEND: &str = "local";

/// Adapter that forks one subprocess per task
///
/// Holding is not supported: a local process starts the moment it is
/// submitted, so there is no queue to hold it in.
pub struct LocalAdapter {
    config: LocalConfig,
    tracker: Tracker,

    /// Child handles of processes not yet reaped
    children: Mutex<HashMap<TaskId, Child>>,
}

impl LocalAdapter {
    /// Creates a local adapter with default settings and no wall-clock limit
    pub fn new() -> Self {
        Self::with_config(LocalConfig::default())
    }

    pub fn with_config(config: LocalConfig) -> Self {
        Self {
            config,
            tracker: Tracker::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> MutexGuard<'_, HashMap<TaskId, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds the command for a task, wrapping it in a shell that sources
    /// the activation script when one is given
    fn build_command(&self, task: &Task, activation_script: Option<&Path>) -> Result<Command> {
        let (program, args) = task
            .command()
            .split_first()
            .ok_or_else(|| SchedulerError::submission(BACKEND, "command is empty"))?;

        let mut command = match activation_script {
            Some(script) => {
                // $0 is the script, "$@" the task command
                let mut command = Command::new(&self.config.shell);
                command
                    .arg("-c")
                    .arg(". \"$0\" && exec \"$@\"")
                    .arg(script)
                    .arg(program)
                    .args(args);
                command
            }
            None => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        Ok(command)
    }

    /// State a finished child maps to
    ///
    /// Only a child that died from a signal after a cancel counts as
    /// cancelled; one that exited on its own keeps its real outcome.
    fn exit_state(&self, id: &TaskId, status: ExitStatus) -> TaskState {
        if self.tracker.cancel_requested(id) && killed_by_signal(status) {
            TaskState::Cancelled
        } else if status.success() {
            TaskState::Done
        } else {
            TaskState::Failed
        }
    }
}

#[cfg(unix)]
fn killed_by_signal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(status: ExitStatus) -> bool {
    !status.success()
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn supports(&self, operation: Operation) -> bool {
        !matches!(operation, Operation::Hold | Operation::ReleaseHold)
    }

    async fn submit(&self, task: &mut Task, activation_script: Option<&Path>) -> Result<()> {
        ensure_new(task)?;

        let script = activation_script.or(task.activation_script());
        let mut command = self.build_command(task, script)?;

        let child = command
            .spawn()
            .map_err(|e| SchedulerError::submission(BACKEND, format!("failed to spawn: {}", e)))?;

        let id = TaskId::new(Uuid::new_v4().to_string());
        task.mark_submitted(id.clone(), BACKEND)?;

        info!(
            "Started local task {} ({}) with pid {:?}",
            id,
            task.name(),
            child.id()
        );

        self.tracker.insert(id.clone(), TaskState::Queued);
        self.children().insert(id, child);
        Ok(())
    }

    fn update(&self, id: &TaskId, state: TaskState) {
        self.tracker.observe(id, state);
    }

    async fn kick(&self) -> Result<()> {
        let mut children = self.children();
        let mut finished = Vec::new();

        for (id, child) in children.iter_mut() {
            match child.try_wait()? {
                Some(status) => {
                    let state = self.exit_state(id, status);
                    debug!("Local task {} exited with {} -> {}", id, status, state);
                    self.tracker.observe(id, state);
                    finished.push(id.clone());
                }
                None => {
                    self.tracker.observe(id, TaskState::Running);
                }
            }
        }

        for id in finished {
            children.remove(&id);
        }
        Ok(())
    }

    fn status(&self, id: &TaskId) -> Option<TaskState> {
        self.tracker.state(id)
    }

    fn timeout(&self, task: &Task) -> bool {
        if task.is_terminal() {
            return false;
        }
        let Some(limit) = task.wall_clock_limit().or(self.config.wall_clock_limit) else {
            return false;
        };
        task.elapsed_since_submit(Utc::now())
            .is_some_and(|elapsed| elapsed > limit)
    }

    async fn cancel(&self, task: &mut Task) -> Result<()> {
        let Some(id) = cancel_target(task, BACKEND)? else {
            return Ok(());
        };

        let mut children = self.children();
        let Some(child) = children.get_mut(&id) else {
            debug!("Local task {} already exited, nothing to cancel", id);
            return Ok(());
        };

        // Exited but not yet reaped: record how it ended instead of killing
        if let Some(status) = child.try_wait()? {
            let state = self.exit_state(&id, status);
            debug!("Local task {} exited with {} before cancel -> {}", id, status, state);
            self.tracker.observe(&id, state);
            children.remove(&id);
            return Ok(());
        }

        self.tracker.mark_cancel_requested(&id);
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill local task {}: {}", id, e);
        } else {
            info!("Sent kill to local task {}", id);
        }
        Ok(())
    }

    fn get_ids(&self) -> Result<HashSet<TaskId>> {
        Ok(self.tracker.ids())
    }

    async fn hold(&self, task: &mut Task) -> Result<()> {
        ensure_owner(task, BACKEND)?;
        Err(SchedulerError::unsupported(BACKEND, Operation::Hold))
    }

    async fn release_hold(&self, task: &mut Task) -> Result<()> {
        ensure_owner(task, BACKEND)?;
        Err(SchedulerError::unsupported(BACKEND, Operation::ReleaseHold))
    }

    fn forget(&self, id: &TaskId) {
        self.tracker.remove(id);
        // Dropping the handle does not kill the process; tokio reaps it
        if self.children().remove(id).is_some() {
            debug!("Stopped tracking running local task {}", id);
        }
    }
}
