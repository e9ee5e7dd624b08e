//! Task state machine
//!
//! States only move forward, with one exception: a queued task may be put on
//! hold and released again any number of times. Terminal states are absorbing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::task::TaskId;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created by the caller, not yet submitted
    New,

    /// Accepted by the backend, waiting for resources
    Queued,

    /// Executing on the backend
    Running,

    /// Suspended in the queue by an explicit hold request
    Held,

    /// Finished successfully
    Done,

    /// Finished unsuccessfully
    Failed,

    /// Terminated on request
    Cancelled,

    /// Exceeded its wall-clock budget
    Timeout,
}

impl TaskState {
    /// Every state, in declaration order
    pub const ALL: [TaskState; 8] = [
        TaskState::New,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Held,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Cancelled,
        TaskState::Timeout,
    ];

    /// Returns true for states no task can leave
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled | TaskState::Timeout
        )
    }

    /// Position in the forward ordering. `Queued` and `Held` share a rank.
    fn rank(self) -> u8 {
        match self {
            TaskState::New => 0,
            TaskState::Queued | TaskState::Held => 1,
            TaskState::Running => 2,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled | TaskState::Timeout => 3,
        }
    }

    /// Checks whether `self -> next` is a legal transition
    ///
    /// Staying in the same state is always accepted, including for terminal
    /// states, so repeated reports of the same final state are harmless.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() || next == TaskState::New {
            return false;
        }
        match (self, next) {
            (TaskState::Queued, TaskState::Held) | (TaskState::Held, TaskState::Queued) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::New => write!(f, "NEW"),
            TaskState::Queued => write!(f, "QUEUED"),
            TaskState::Running => write!(f, "RUNNING"),
            TaskState::Held => write!(f, "HELD"),
            TaskState::Done => write!(f, "DONE"),
            TaskState::Failed => write!(f, "FAILED"),
            TaskState::Cancelled => write!(f, "CANCELLED"),
            TaskState::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Rejected state change on a task
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The requested move breaks the forward-only ordering
    #[error("task '{task}' cannot move from {from} to {to}")]
    Illegal {
        task: String,
        from: TaskState,
        to: TaskState,
    },

    /// The task already carries a backend identifier
    #[error("task '{task}' was already submitted as {id}")]
    AlreadySubmitted { task: String, id: TaskId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = TaskState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                TaskState::Done,
                TaskState::Failed,
                TaskState::Cancelled,
                TaskState::Timeout
            ]
        );
    }

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(TaskState::New.can_transition_to(TaskState::Queued));
        assert!(TaskState::Queued.can_transition_to(TaskState::Running));
        assert!(TaskState::Queued.can_transition_to(TaskState::Done));
        assert!(TaskState::Running.can_transition_to(TaskState::Failed));
        assert!(TaskState::Held.can_transition_to(TaskState::Cancelled));
        assert!(TaskState::New.can_transition_to(TaskState::Cancelled));
    }

    #[test]
    fn test_hold_is_reversible() {
        assert!(TaskState::Queued.can_transition_to(TaskState::Held));
        assert!(TaskState::Held.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Running.can_transition_to(TaskState::Held));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!TaskState::Running.can_transition_to(TaskState::Queued));
        assert!(!TaskState::Queued.can_transition_to(TaskState::New));
        assert!(!TaskState::Held.can_transition_to(TaskState::New));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_display_uses_upper_case() {
        assert_eq!(TaskState::Cancelled.to_string(), "CANCELLED");
        assert_eq!(TaskState::New.to_string(), "NEW");
    }
}
