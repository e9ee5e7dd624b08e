//! Error types for the Tasklane scheduler

use tasklane_core::{TaskId, TransitionError};
use thiserror::Error;

use crate::adapter::Operation;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur when driving tasks through a backend
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The backend rejected the job or could not be reached; the task stays `NEW`
    #[error("Submission to {backend} failed: {reason}")]
    Submission {
        /// Backend that refused the submission
        backend: String,
        /// What the backend reported
        reason: String,
    },

    /// Registry lookup for a backend name nobody registered
    #[error("Unknown scheduler backend: '{0}'")]
    UnknownBackend(String),

    /// Adapter or loop configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A backend with this name is already registered
    #[error("Scheduler backend already registered: '{0}'")]
    DuplicateBackend(String),

    /// The adapter deliberately does not offer this operation
    #[error("{backend} backend does not support {operation}")]
    UnsupportedOperation {
        backend: String,
        operation: Operation,
    },

    /// The adapter never overrode this operation of the base interface
    #[error("{backend} backend does not implement {operation}")]
    NotImplemented {
        backend: String,
        operation: Operation,
    },

    /// Requested state change is not allowed from the task's current state
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Operation needs a backend identity the task does not have yet
    #[error("Task '{0}' has not been submitted")]
    NotSubmitted(String),

    /// Task belongs to a different adapter
    #[error("Task {task} is owned by the {owner} backend, not {backend}")]
    WrongBackend {
        task: TaskId,
        owner: String,
        backend: String,
    },

    /// No tracked task with this identifier
    #[error("Task {0} is not tracked")]
    UnknownTask(TaskId),

    /// A backend tool exited unsuccessfully or printed something unparseable
    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    /// Spawning or waiting on a process failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The control loop behind a handle has stopped
    #[error("Control loop is no longer running")]
    LoopClosed,
}

impl SchedulerError {
    /// Create a submission error
    pub fn submission(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Submission {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    /// Create an error for an operation the backend does not offer
    pub fn unsupported(backend: impl Into<String>, operation: Operation) -> Self {
        Self::UnsupportedOperation {
            backend: backend.into(),
            operation,
        }
    }

    /// Create an error for a base-interface stub that was never overridden
    pub fn not_implemented(backend: impl Into<String>, operation: Operation) -> Self {
        Self::NotImplemented {
            backend: backend.into(),
            operation,
        }
    }

    /// Create a backend tool failure
    pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: message.into(),
        }
    }

    /// Check if this error is the documented "operation not supported" condition
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation { .. })
    }

    /// Check if this error comes from a missing adapter override
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }

    /// Check if this error is a rejected submission
    pub fn is_submission(&self) -> bool {
        matches!(self, Self::Submission { .. })
    }
}
