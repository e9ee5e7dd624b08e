//! Core domain types
//!
//! These types are shared between the scheduler adapters (which mutate and
//! report on tasks) and the callers that create tasks and consume their
//! final state.

pub mod state;
pub mod task;
