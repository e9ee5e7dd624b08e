//! Control loop
//!
//! Drives every tracked task of one backend adapter to a terminal state.
//! Each cycle applies queued requests, polls the backend once, moves tasks
//! to the states the adapter reports, enforces wall-clock budgets and
//! retires finished tasks into the completed log.

mod handle;
mod history;

pub use handle::ControlHandle;
pub use history::{HistorySink, InMemoryHistory};

use handle::LoopCommand;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tasklane_core::{Task, TaskId, TaskState, TransitionError};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapter::BackendAdapter;
use crate::config::LoopConfig;
use crate::error::{Result, SchedulerError};

/// What a single poll cycle changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Whether the backend was polled
    pub polled: bool,

    /// State changes applied, in task id order
    pub transitions: Vec<(TaskId, TaskState)>,

    /// Tasks forced to `TIMEOUT` this cycle
    pub timed_out: Vec<TaskId>,

    /// Tasks moved to the completed log this cycle
    pub retired: Vec<TaskId>,

    /// Tasks still active after the cycle
    pub active: usize,
}

/// Caller-driven scheduler loop over one backend adapter
///
/// The loop owns its tracked tasks. Other tasks and threads interact with
/// it through a [`ControlHandle`].
pub struct ControlLoop {
    adapter: Arc<dyn BackendAdapter>,
    config: LoopConfig,
    active: BTreeMap<TaskId, Task>,
    completed: Vec<Task>,
    history: Option<Arc<dyn HistorySink>>,
    commands_tx: mpsc::UnboundedSender<LoopCommand>,
    commands_rx: mpsc::UnboundedReceiver<LoopCommand>,
    shutdown: bool,
}

impl ControlLoop {
    pub fn new(adapter: Arc<dyn BackendAdapter>, config: LoopConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            adapter,
            config,
            active: BTreeMap::new(),
            completed: Vec::new(),
            history: None,
            commands_tx,
            commands_rx,
            shutdown: false,
        }
    }

    /// Also hands every retired task to `history`
    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle::new(self.commands_tx.clone())
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    /// Submits `task` through the loop's adapter and starts tracking it
    ///
    /// # Returns
    /// The identifier the backend assigned
    pub async fn submit(
        &mut self,
        mut task: Task,
        activation_script: Option<&Path>,
    ) -> Result<TaskId> {
        self.adapter.submit(&mut task, activation_script).await?;
        let id = task
            .id()
            .cloned()
            .ok_or_else(|| SchedulerError::NotSubmitted(task.name().to_string()))?;
        self.track(task)?;
        Ok(id)
    }

    /// Starts tracking a task already submitted through this loop's adapter
    ///
    /// A task that is already terminal goes straight to the completed log.
    pub fn track(&mut self, task: Task) -> Result<()> {
        let Some(id) = task.id().cloned() else {
            return Err(SchedulerError::NotSubmitted(task.name().to_string()));
        };
        let backend = self.adapter.name();
        if task.backend_name() != Some(backend) {
            return Err(SchedulerError::WrongBackend {
                task: id,
                owner: task.backend_name().unwrap_or("unknown").to_string(),
                backend: backend.to_string(),
            });
        }

        if task.is_terminal() {
            self.retire(task);
            return Ok(());
        }
        if self.active.contains_key(&id) {
            debug!("Task {} is already tracked", id);
            return Ok(());
        }

        debug!("Tracking task {} ({})", id, task.name());
        self.active.insert(id, task);
        Ok(())
    }

    /// Runs one cycle: requests, poll, state changes, timeouts, retirement
    pub async fn poll_cycle(&mut self) -> Result<CycleReport> {
        self.drain_commands().await;

        let mut report = CycleReport::default();
        if !self.active.is_empty() {
            self.adapter.kick().await?;
            report.polled = true;
        }

        for (id, task) in self.active.iter_mut() {
            if let Some(state) = self.adapter.status(id)
                && state != task.state()
            {
                match task.transition(state) {
                    Ok(true) => {
                        info!("Task {} ({}) is now {}", id, task.name(), state);
                        report.transitions.push((id.clone(), state));
                    }
                    Ok(false) => {}
                    Err(e) => debug!("Ignoring reported state: {}", e),
                }
            }

            if !task.is_terminal() && self.adapter.timeout(task) {
                task.transition(TaskState::Timeout)?;
                self.adapter.update(id, TaskState::Timeout);
                warn!("Task {} ({}) exceeded its wall-clock limit", id, task.name());
                report.transitions.push((id.clone(), TaskState::Timeout));
                report.timed_out.push(id.clone());
            }
        }

        let finished: Vec<TaskId> = self
            .active
            .iter()
            .filter(|(_, task)| task.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            if let Some(task) = self.active.remove(&id) {
                self.retire(task);
                report.retired.push(id);
            }
        }

        report.active = self.active.len();
        Ok(report)
    }

    /// Polls every `poll_interval` until a shutdown request arrives
    ///
    /// A kick runs a cycle immediately and restarts the interval. Adapter
    /// errors end the loop and are returned.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Starting {} control loop (interval: {:?})",
            self.adapter.name(),
            self.config.poll_interval
        );

        self.shutdown = false;
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.poll_cycle().await?;
                    log_cycle(&report);
                }
                Some(command) = self.commands_rx.recv() => {
                    if matches!(command, LoopCommand::Kick) {
                        debug!("Kicked");
                        let report = self.poll_cycle().await?;
                        log_cycle(&report);
                        interval.reset();
                    } else {
                        self.apply(command).await;
                    }
                }
            }
        }

        info!("{} control loop stopped", self.adapter.name());
        Ok(())
    }

    /// Polls until no task is active, then returns the completed log
    ///
    /// Requests arriving through a handle are applied between cycles and
    /// trigger the next cycle immediately. A shutdown request also returns.
    pub async fn run_until_idle(&mut self) -> Result<Vec<Task>> {
        self.shutdown = false;
        let mut interval = time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(command) = self.commands_rx.recv() => {
                    self.apply(command).await;
                    interval.reset();
                }
            }

            let report = self.poll_cycle().await?;
            log_cycle(&report);
            if self.active.is_empty() || self.shutdown {
                break;
            }
        }

        Ok(self.drain_completed())
    }

    /// Requests cancellation of a tracked task
    ///
    /// Cancelling a task that already finished is a no-op.
    pub async fn cancel(&mut self, id: &TaskId) -> Result<()> {
        if let Some(task) = self.active.get_mut(id) {
            return self.adapter.cancel(task).await;
        }
        if self.completed_task(id).is_some() {
            debug!("Task {} already finished, nothing to cancel", id);
            return Ok(());
        }
        Err(SchedulerError::UnknownTask(id.clone()))
    }

    pub async fn hold(&mut self, id: &TaskId) -> Result<()> {
        match self.active.get_mut(id) {
            Some(task) => self.adapter.hold(task).await,
            None => Err(self.not_active(id, TaskState::Held)),
        }
    }

    pub async fn release_hold(&mut self, id: &TaskId) -> Result<()> {
        match self.active.get_mut(id) {
            Some(task) => self.adapter.release_hold(task).await,
            None => Err(self.not_active(id, TaskState::Queued)),
        }
    }

    /// Pushes an externally observed state to the adapter
    ///
    /// Takes effect on the next cycle, subject to the transition rules.
    pub fn update(&self, id: &TaskId, state: TaskState) {
        self.adapter.update(id, state);
    }

    /// Tasks still being driven, in id order
    pub fn active(&self) -> impl Iterator<Item = &Task> {
        self.active.values()
    }

    /// Finished tasks, in completion order
    pub fn completed(&self) -> &[Task] {
        &self.completed
    }

    /// Hands the completed log over to the caller
    pub fn drain_completed(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.completed)
    }

    /// Looks a task up among active and completed tasks
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.active.get(id).or_else(|| self.completed_task(id))
    }

    fn completed_task(&self, id: &TaskId) -> Option<&Task> {
        self.completed.iter().find(|task| task.id() == Some(id))
    }

    /// Error for hold or release on a task the loop no longer drives
    fn not_active(&self, id: &TaskId, to: TaskState) -> SchedulerError {
        match self.completed_task(id) {
            Some(task) => TransitionError::Illegal {
                task: id.to_string(),
                from: task.state(),
                to,
            }
            .into(),
            None => SchedulerError::UnknownTask(id.clone()),
        }
    }

    fn retire(&mut self, task: Task) {
        if let Some(id) = task.id() {
            self.adapter.forget(id);
        }
        info!("Task {} ({}) finished: {}", task.label(), task.name(), task.state());
        if let Some(history) = &self.history {
            history.record(task.clone());
        }
        self.completed.push(task);
    }

    async fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            self.apply(command).await;
        }
    }

    async fn apply(&mut self, command: LoopCommand) {
        match command {
            LoopCommand::Track { task, reply } => {
                let _ = reply.send(self.track(task));
            }
            LoopCommand::Update { id, state } => self.update(&id, state),
            LoopCommand::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(&id).await);
            }
            LoopCommand::Hold { id, reply } => {
                let _ = reply.send(self.hold(&id).await);
            }
            LoopCommand::ReleaseHold { id, reply } => {
                let _ = reply.send(self.release_hold(&id).await);
            }
            // Every cycle polls; a kick drained mid-cycle needs nothing more
            LoopCommand::Kick => {}
            LoopCommand::Shutdown => {
                debug!("Shutdown requested");
                self.shutdown = true;
            }
        }
    }
}

fn log_cycle(report: &CycleReport) {
    if !report.retired.is_empty() {
        info!(
            "{} task(s) finished this cycle, {} still active",
            report.retired.len(),
            report.active
        );
    } else {
        debug!("Poll cycle done, {} task(s) active", report.active);
    }
}
