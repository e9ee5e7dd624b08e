//! Tasklane Core
//!
//! Core types for the Tasklane job scheduler.
//!
//! This crate contains the domain model shared by every scheduler backend:
//! the `Task` unit of work, its identifier, and the state machine that
//! governs how a task may move between states.

pub mod domain;

pub use domain::state::{TaskState, TransitionError};
pub use domain::task::{Task, TaskId};
