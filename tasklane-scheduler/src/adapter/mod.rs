//! Backend adapters
//!
//! One implementation of [`BackendAdapter`] per execution substrate. Adapters
//! never own tasks: they receive them by reference, mutate them on submit,
//! cancel and hold, and otherwise keep only a small amount of bookkeeping
//! about the native identifiers they issued.
//!
//! Available adapters:
//! - [`LocalAdapter`]: forks a subprocess on this machine
//! - [`SlurmAdapter`]: `sbatch` / `squeue` / `sacct` / `scancel` / `scontrol`
//! - [`PbsAdapter`]: `qsub` / `qstat` / `qdel` / `qhold` / `qrls`

mod command;
#[cfg(all(test, unix))]
mod fake_tools;
mod local;
mod pbs;
mod slurm;
mod tracker;

pub use local::LocalAdapter;
pub use pbs::PbsAdapter;
pub use slurm::SlurmAdapter;

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use tasklane_core::{Task, TaskId, TaskState};

use crate::error::{Result, SchedulerError};

/// Operations an adapter may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Submit,
    Update,
    Kick,
    Timeout,
    Cancel,
    GetIds,
    Hold,
    ReleaseHold,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Submit => write!(f, "submit"),
            Operation::Update => write!(f, "update"),
            Operation::Kick => write!(f, "kick"),
            Operation::Timeout => write!(f, "timeout"),
            Operation::Cancel => write!(f, "cancel"),
            Operation::GetIds => write!(f, "get_ids"),
            Operation::Hold => write!(f, "hold"),
            Operation::ReleaseHold => write!(f, "release_hold"),
        }
    }
}

/// Uniform control surface over a job execution backend
///
/// `cancel`, `get_ids`, `hold` and `release_hold` have default bodies that
/// fail with [`SchedulerError::NotImplemented`]. Every concrete adapter must
/// override them; one that cannot hold jobs overrides `hold` to return
/// [`SchedulerError::UnsupportedOperation`] instead, and says so through
/// [`BackendAdapter::supports`].
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Registry name of this backend (`"local"`, `"slurm"`, `"pbs"`)
    fn name(&self) -> &'static str;

    /// Capability query, so callers can check before calling
    fn supports(&self, operation: Operation) -> bool {
        matches!(
            operation,
            Operation::Submit | Operation::Update | Operation::Kick | Operation::Timeout
        )
    }

    /// Dispatches a `NEW` task and assigns its identifier
    ///
    /// # Arguments
    /// * `task` - Task in state `NEW`; moves to `QUEUED` on success
    /// * `activation_script` - Environment-setup script sourced before the
    ///   command. Falls back to the task's own script when `None`.
    ///
    /// # Errors
    /// [`SchedulerError::Submission`] if the backend rejects the job. The
    /// task is left in `NEW`; the adapter never retries on its own.
    async fn submit(&self, task: &mut Task, activation_script: Option<&Path>) -> Result<()>;

    /// Pushes an externally observed state into the adapter's bookkeeping
    ///
    /// Does not query the backend. Regressions (e.g. a terminal task reported
    /// as running) are ignored.
    fn update(&self, id: &TaskId, state: TaskState);

    /// Polls the backend for every tracked, non-terminal task right now
    async fn kick(&self) -> Result<()>;

    /// Last state observed for `id`, by polling or by `update`
    fn status(&self, id: &TaskId) -> Option<TaskState>;

    /// Returns true if `task` has exhausted its wall-clock budget
    fn timeout(&self, task: &Task) -> bool;

    /// Requests termination of a queued or running task
    ///
    /// A task that is already terminal is left alone and the call succeeds.
    /// The task reaches `CANCELLED` through the regular poll path, not by
    /// the time this returns.
    async fn cancel(&self, task: &mut Task) -> Result<()> {
        let _ = task;
        Err(SchedulerError::not_implemented(self.name(), Operation::Cancel))
    }

    /// All native identifiers currently tracked
    fn get_ids(&self) -> Result<HashSet<TaskId>> {
        Err(SchedulerError::not_implemented(self.name(), Operation::GetIds))
    }

    /// Moves a `QUEUED` task to `HELD`
    async fn hold(&self, task: &mut Task) -> Result<()> {
        let _ = task;
        Err(SchedulerError::not_implemented(self.name(), Operation::Hold))
    }

    /// Moves a `HELD` task back to `QUEUED`
    async fn release_hold(&self, task: &mut Task) -> Result<()> {
        let _ = task;
        Err(SchedulerError::not_implemented(
            self.name(),
            Operation::ReleaseHold,
        ))
    }

    /// Drops bookkeeping for a task the caller no longer tracks
    fn forget(&self, id: &TaskId) {
        let _ = id;
    }
}

/// Returns the task's id, failing for unsubmitted tasks
pub(crate) fn submitted_id(task: &Task) -> Result<TaskId> {
    task.id()
        .cloned()
        .ok_or_else(|| SchedulerError::NotSubmitted(task.name().to_string()))
}

/// Checks that `task` was issued by `backend`
pub(crate) fn ensure_owner(task: &Task, backend: &str) -> Result<TaskId> {
    let id = submitted_id(task)?;
    match task.backend_name() {
        Some(owner) if owner == backend => Ok(id),
        owner => Err(SchedulerError::WrongBackend {
            task: id,
            owner: owner.unwrap_or("unknown").to_string(),
            backend: backend.to_string(),
        }),
    }
}

/// Rejects submission of anything but a fresh task
pub(crate) fn ensure_new(task: &Task) -> Result<()> {
    if task.state() != TaskState::New || task.is_submitted() {
        return Err(tasklane_core::TransitionError::Illegal {
            task: task.label(),
            from: task.state(),
            to: TaskState::Queued,
        }
        .into());
    }
    Ok(())
}

/// Validates a hold/release transition before the tool is invoked
///
/// # Returns
/// `false` when the task is already in `to`, so there is nothing to send
pub(crate) fn check_transition(task: &Task, to: TaskState) -> Result<bool> {
    let allowed = match to {
        TaskState::Held => matches!(task.state(), TaskState::Queued | TaskState::Held),
        TaskState::Queued => matches!(task.state(), TaskState::Held | TaskState::Queued),
        _ => false,
    };
    if !allowed {
        return Err(tasklane_core::TransitionError::Illegal {
            task: task.label(),
            from: task.state(),
            to,
        }
        .into());
    }
    Ok(task.state() != to)
}

/// Common cancel prologue shared by all adapters
///
/// Returns `None` when there is nothing left to do: the task is terminal
/// (cancellation loses the race against completion, which is not an error)
/// or it was never submitted and has simply been marked `CANCELLED`.
pub(crate) fn cancel_target(task: &mut Task, backend: &str) -> Result<Option<TaskId>> {
    if task.is_terminal() {
        tracing::debug!(
            "Ignoring cancel for task {}: already {}",
            task.label(),
            task.state()
        );
        return Ok(None);
    }
    if !task.is_submitted() {
        task.transition(TaskState::Cancelled)?;
        tracing::info!("Cancelled unsubmitted task {}", task.label());
        return Ok(None);
    }
    ensure_owner(task, backend).map(Some)
}
