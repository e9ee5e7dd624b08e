//! Cross-task access to a running control loop

use tasklane_core::{Task, TaskId, TaskState};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SchedulerError};

type Reply = oneshot::Sender<Result<()>>;

/// Requests queued for the control loop
#[derive(Debug)]
pub(crate) enum LoopCommand {
    Track { task: Task, reply: Reply },
    Update { id: TaskId, state: TaskState },
    Cancel { id: TaskId, reply: Reply },
    Hold { id: TaskId, reply: Reply },
    ReleaseHold { id: TaskId, reply: Reply },
    Kick,
    Shutdown,
}

/// Cloneable handle to a [`ControlLoop`](super::ControlLoop)
///
/// Tracked tasks are owned by the loop; the handle only sends requests.
/// Requests that wait for a reply are served while the loop is running
/// (`run`, `run_until_idle` or a `poll_cycle` call) and fail with
/// [`SchedulerError::LoopClosed`] once the loop has been dropped.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<LoopCommand>,
}

impl ControlHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<LoopCommand>) -> Self {
        Self { commands }
    }

    /// Hands a submitted task over to the loop
    pub async fn track(&self, task: Task) -> Result<()> {
        self.request(|reply| LoopCommand::Track { task, reply })
            .await
    }

    /// Pushes an externally observed state, applied on the next cycle
    pub fn update(&self, id: TaskId, state: TaskState) -> Result<()> {
        self.send(LoopCommand::Update { id, state })
    }

    pub async fn cancel(&self, id: TaskId) -> Result<()> {
        self.request(|reply| LoopCommand::Cancel { id, reply })
            .await
    }

    pub async fn hold(&self, id: TaskId) -> Result<()> {
        self.request(|reply| LoopCommand::Hold { id, reply }).await
    }

    pub async fn release_hold(&self, id: TaskId) -> Result<()> {
        self.request(|reply| LoopCommand::ReleaseHold { id, reply })
            .await
    }

    /// Wakes the loop for an immediate poll cycle
    pub fn kick(&self) -> Result<()> {
        self.send(LoopCommand::Kick)
    }

    /// Asks a running loop to return
    pub fn shutdown(&self) -> Result<()> {
        self.send(LoopCommand::Shutdown)
    }

    fn send(&self, command: LoopCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::LoopClosed)
    }

    async fn request<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(Reply) -> LoopCommand,
    {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| SchedulerError::LoopClosed)?
    }
}
