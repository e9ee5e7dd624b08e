//! Completed-task history
//!
//! The control loop hands every task that reaches a terminal state to an
//! optional [`HistorySink`], in addition to its own completed log.

use std::sync::{Mutex, PoisonError};
use tasklane_core::Task;

/// Receiver of finished tasks
pub trait HistorySink: Send + Sync {
    /// Records a task that has just left the active set
    ///
    /// # Arguments
    /// * `task` - Snapshot of the task in its terminal state
    fn record(&self, task: Task);
}

/// In-memory implementation of HistorySink
///
/// Keeps tasks in completion order until drained.
#[derive(Default)]
pub struct InMemoryHistory {
    tasks: Mutex<Vec<Task>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies of every recorded task, oldest first
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns every recorded task
    pub fn drain(&self) -> Vec<Task> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.drain(..).collect()
    }
}

impl HistorySink for InMemoryHistory {
    fn record(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let history = InMemoryHistory::new();
        assert!(history.is_empty());

        history.record(Task::new("a", vec!["true".to_string()]));
        history.record(Task::new("b", vec!["true".to_string()]));
        assert_eq!(history.len(), 2);
        assert_eq!(history.tasks()[1].name(), "b");

        let drained = history.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name(), "a");
        assert!(history.is_empty());
    }
}
