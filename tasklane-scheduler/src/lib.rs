//! Tasklane scheduler
//!
//! Submits tasks to an execution backend and drives them to completion.
//!
//! - [`adapter`]: the [`BackendAdapter`] interface and the local, SLURM and
//!   PBS implementations
//! - [`registry`]: name-based adapter lookup
//! - [`control`]: the [`ControlLoop`] that polls an adapter and retires
//!   finished tasks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tasklane_core::Task;
//! use tasklane_scheduler::{ControlLoop, LoopConfig, SchedulerRegistry};
//!
//! #[tokio::main]
//! async fn main() -> tasklane_scheduler::Result<()> {
//!     let registry = SchedulerRegistry::new();
//!     let adapter = registry.get_scheduler("slurm")?;
//!
//!     let mut control = ControlLoop::new(Arc::clone(&adapter), LoopConfig::default());
//!     let task = Task::new("train", vec!["python3".into(), "train.py".into()]);
//!     control.submit(task, None).await?;
//!
//!     for task in control.run_until_idle().await? {
//!         println!("{}: {}", task.label(), task.state());
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod control;
pub mod error;
pub mod registry;

pub use adapter::{BackendAdapter, LocalAdapter, Operation, PbsAdapter, SlurmAdapter};
pub use config::{BackendsConfig, LocalConfig, LoopConfig, PbsConfig, SlurmConfig};
pub use control::{ControlHandle, ControlLoop, CycleReport, HistorySink, InMemoryHistory};
pub use error::{Result, SchedulerError};
pub use registry::SchedulerRegistry;
