//! Per-adapter bookkeeping of issued identifiers
//!
//! Records, for each native id an adapter issued, the last state observed
//! for it and whether a cancel was requested. Observations follow the same
//! transition rules as `Task`, so stale reports never move an entry
//! backwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tasklane_core::{TaskId, TaskState};
use tracing::debug;

/// Consecutive polls an id may be absent from the backend's listing before
/// it is treated as gone
pub(crate) const MISSED_POLLS_BEFORE_LOST: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: TaskState,
    cancel_requested: bool,
    missed_polls: u32,
}

/// Thread-safe map of tracked ids
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    entries: Mutex<HashMap<TaskId, Entry>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a freshly submitted id
    pub(crate) fn insert(&self, id: TaskId, state: TaskState) {
        self.lock().insert(
            id,
            Entry {
                state,
                cancel_requested: false,
                missed_polls: 0,
            },
        );
    }

    /// Records an observed state; ignored for unknown ids and regressions
    ///
    /// # Returns
    /// `true` if the stored state changed
    pub(crate) fn observe(&self, id: &TaskId, state: TaskState) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(id) else {
            debug!("Ignoring state {} for untracked task {}", state, id);
            return false;
        };
        entry.missed_polls = 0;
        if entry.state == state {
            return false;
        }
        if !entry.state.can_transition_to(state) {
            debug!(
                "Ignoring regression of task {} from {} to {}",
                id, entry.state, state
            );
            return false;
        }
        entry.state = state;
        true
    }

    pub(crate) fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.lock().get(id).map(|e| e.state)
    }

    pub(crate) fn mark_cancel_requested(&self, id: &TaskId) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.cancel_requested = true;
        }
    }

    pub(crate) fn cancel_requested(&self, id: &TaskId) -> bool {
        self.lock().get(id).is_some_and(|e| e.cancel_requested)
    }

    /// Notes that a poll listed `id`, even in a state that could not be mapped
    pub(crate) fn seen(&self, id: &TaskId) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.missed_polls = 0;
        }
    }

    /// Counts a poll whose listing did not include `id`
    ///
    /// # Returns
    /// Consecutive misses so far, reset by the next `observe`
    pub(crate) fn record_miss(&self, id: &TaskId) -> u32 {
        match self.lock().get_mut(id) {
            Some(entry) => {
                entry.missed_polls += 1;
                entry.missed_polls
            }
            None => 0,
        }
    }

    pub(crate) fn ids(&self) -> HashSet<TaskId> {
        self.lock().keys().cloned().collect()
    }

    /// Ids whose last observed state is not terminal, sorted for stable
    /// command lines
    pub(crate) fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .lock()
            .iter()
            .filter(|(_, e)| !e.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn remove(&self, id: &TaskId) {
        self.lock().remove(id);
    }
}
