//! Scheduler registry
//!
//! Resolves a backend name to a freshly constructed adapter. Names are
//! case-insensitive: `"SLURM"` and `"slurm"` select the same backend.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::adapter::{BackendAdapter, LocalAdapter, PbsAdapter, SlurmAdapter};
use crate::config::BackendsConfig;
use crate::error::{Result, SchedulerError};

type Factory = Box<dyn Fn() -> Arc<dyn BackendAdapter> + Send + Sync>;

/// Name to adapter-factory mapping
pub struct SchedulerRegistry {
    factories: HashMap<String, Factory>,
}

impl SchedulerRegistry {
    /// Registry of the built-in backends with default settings
    pub fn new() -> Self {
        Self::from_config(BackendsConfig::default())
    }

    /// Registry of the built-in backends, each built from `config`
    pub fn from_config(config: BackendsConfig) -> Self {
        let BackendsConfig { local, slurm, pbs } = config;
        let mut factories: HashMap<String, Factory> = HashMap::new();

        factories.insert(
            "local".to_string(),
            Box::new(move || -> Arc<dyn BackendAdapter> {
                Arc::new(LocalAdapter::with_config(local.clone()))
            }),
        );
        factories.insert(
            "slurm".to_string(),
            Box::new(move || -> Arc<dyn BackendAdapter> {
                Arc::new(SlurmAdapter::with_config(slurm.clone()))
            }),
        );
        factories.insert(
            "pbs".to_string(),
            Box::new(move || -> Arc<dyn BackendAdapter> {
                Arc::new(PbsAdapter::with_config(pbs.clone()))
            }),
        );

        Self { factories }
    }

    /// Adds a backend under `name`
    ///
    /// # Errors
    /// [`SchedulerError::DuplicateBackend`] if the name is taken, including
    /// by a built-in backend.
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn BackendAdapter> + Send + Sync + 'static,
    {
        let key = name.to_lowercase();
        if self.factories.contains_key(&key) {
            return Err(SchedulerError::DuplicateBackend(key));
        }
        debug!("Registered scheduler backend '{}'", key);
        self.factories.insert(key, Box::new(factory));
        Ok(())
    }

    /// Builds a new adapter for `name`
    pub fn get_scheduler(&self, name: &str) -> Result<Arc<dyn BackendAdapter>> {
        let key = name.to_lowercase();
        self.factories
            .get(&key)
            .map(|factory| factory())
            .ok_or(SchedulerError::UnknownBackend(name.to_string()))
    }

    /// Registered backend names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
