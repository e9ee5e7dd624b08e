//! Task domain model
//!
//! A task is one unit of submitted work. The caller creates it, a backend
//! adapter assigns its identifier at submit time, and the control loop keeps
//! its state current until it reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::state::{TaskState, TransitionError};

/// Backend-assigned task identifier
///
/// Opaque to everything but the adapter that issued it: a UUID for local
/// processes, a job number for SLURM, `NNN.server` for PBS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A unit of work and its runtime state
///
/// Fields are private so the identifier can only be assigned once and the
/// state can only move along legal transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: Option<TaskId>,
    name: String,
    command: Vec<String>,
    state: TaskState,
    activation_script: Option<PathBuf>,
    wall_clock_limit: Option<Duration>,
    backend_name: Option<String>,
    created_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    last_updated_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new, unsubmitted task
    ///
    /// # Arguments
    /// * `name` - Human readable name, used as the job name on cluster backends
    /// * `command` - Executable followed by its arguments
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            name: name.into(),
            command,
            state: TaskState::New,
            activation_script: None,
            wall_clock_limit: None,
            backend_name: None,
            created_at: now,
            submitted_at: None,
            last_updated_at: now,
        }
    }

    /// Sets the environment-setup script the backend sources before the command
    pub fn with_activation_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.activation_script = Some(path.into());
        self
    }

    /// Sets the wall-clock budget for this task
    pub fn with_wall_clock_limit(mut self, limit: Duration) -> Self {
        self.wall_clock_limit = Some(limit);
        self
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.id.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn activation_script(&self) -> Option<&Path> {
        self.activation_script.as_deref()
    }

    pub fn wall_clock_limit(&self) -> Option<Duration> {
        self.wall_clock_limit
    }

    /// Name of the adapter that owns this task, once submitted
    pub fn backend_name(&self) -> Option<&str> {
        self.backend_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_submitted(&self) -> bool {
        self.id.is_some()
    }

    /// Time since submission, or `None` for unsubmitted tasks
    pub fn elapsed_since_submit(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.submitted_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }

    /// Records a successful submission
    ///
    /// Assigns the identifier, the owning backend and moves the task to
    /// `Queued`. Fails if the task already has an identifier or has left
    /// `New`.
    pub fn mark_submitted(
        &mut self,
        id: TaskId,
        backend: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if let Some(existing) = &self.id {
            return Err(TransitionError::AlreadySubmitted {
                task: self.name.clone(),
                id: existing.clone(),
            });
        }
        if self.state != TaskState::New {
            return Err(self.illegal(TaskState::Queued));
        }

        let now = Utc::now();
        self.id = Some(id);
        self.backend_name = Some(backend.into());
        self.state = TaskState::Queued;
        self.submitted_at = Some(now);
        self.last_updated_at = now;
        Ok(())
    }

    /// Moves the task to `next`
    ///
    /// # Returns
    /// `true` if the state changed, `false` if the task was already in `next`
    pub fn transition(&mut self, next: TaskState) -> Result<bool, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(self.illegal(next));
        }
        if self.state == next {
            return Ok(false);
        }
        self.state = next;
        self.last_updated_at = Utc::now();
        Ok(true)
    }

    /// Label used in logs and errors: the id when known, otherwise the name
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => self.name.clone(),
        }
    }

    fn illegal(&self, to: TaskState) -> TransitionError {
        TransitionError::Illegal {
            task: self.label(),
            from: self.state,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_task() -> Task {
        Task::new("echo", vec!["echo".to_string(), "hi".to_string()])
    }

    #[test]
    fn test_new_task_is_unsubmitted() {
        let task = echo_task();
        assert_eq!(task.state(), TaskState::New);
        assert!(task.id().is_none());
        assert!(task.backend_name().is_none());
        assert!(task.submitted_at().is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_mark_submitted_assigns_identity_once() {
        let mut task = echo_task();
        task.mark_submitted(TaskId::new("42"), "slurm").unwrap();

        assert_eq!(task.id(), Some(&TaskId::new("42")));
        assert_eq!(task.backend_name(), Some("slurm"));
        assert_eq!(task.state(), TaskState::Queued);
        assert!(task.submitted_at().is_some());

        let err = task.mark_submitted(TaskId::new("43"), "slurm").unwrap_err();
        assert!(matches!(err, TransitionError::AlreadySubmitted { .. }));
        assert_eq!(task.id(), Some(&TaskId::new("42")));
    }

    #[test]
    fn test_transition_reports_change() {
        let mut task = echo_task();
        task.mark_submitted(TaskId::new("1"), "local").unwrap();

        assert!(task.transition(TaskState::Running).unwrap());
        assert!(!task.transition(TaskState::Running).unwrap());
        assert!(task.transition(TaskState::Done).unwrap());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_terminal_task_cannot_be_revived() {
        let mut task = echo_task();
        task.mark_submitted(TaskId::new("1"), "local").unwrap();
        task.transition(TaskState::Failed).unwrap();

        for next in [TaskState::Queued, TaskState::Running, TaskState::Held] {
            assert!(task.transition(next).is_err());
        }
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn test_label_prefers_id() {
        let mut task = echo_task();
        assert_eq!(task.label(), "echo");
        task.mark_submitted(TaskId::new("7.pbs01"), "pbs").unwrap();
        assert_eq!(task.label(), "7.pbs01");
    }

    #[test]
    fn test_builder_options() {
        let task = echo_task()
            .with_activation_script("/opt/env/activate.sh")
            .with_wall_clock_limit(Duration::from_secs(90));

        assert_eq!(
            task.activation_script(),
            Some(Path::new("/opt/env/activate.sh"))
        );
        assert_eq!(task.wall_clock_limit(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_serializes_state_in_upper_case() {
        let task = echo_task();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["state"], "NEW");
        assert_eq!(json["command"][1], "hi");
    }
}
