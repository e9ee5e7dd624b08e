//! Runner configuration
//!
//! Which backend to submit to, how often to poll it and the per-task
//! settings forwarded to the adapter.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use tasklane_scheduler::{BackendsConfig, LoopConfig};

/// Runner configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry name of the backend (e.g., "local", "slurm", "pbs")
    pub backend: String,

    /// Time between two poll cycles
    pub poll_interval: Duration,

    /// Wall-clock budget for the task, if any
    pub wall_clock_limit: Option<Duration>,

    /// Script sourced before the command runs
    pub activation_script: Option<PathBuf>,

    /// Human-readable task name, also used as the batch job name
    pub task_name: String,

    pub slurm_partition: Option<String>,
    pub slurm_account: Option<String>,
    pub pbs_queue: Option<String>,
    pub pbs_account: Option<String>,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - TASKLANE_BACKEND (default: local)
    /// - TASKLANE_POLL_INTERVAL (seconds, default: 5)
    /// - TASKLANE_WALL_CLOCK_LIMIT (seconds)
    /// - TASKLANE_ACTIVATION_SCRIPT
    /// - TASKLANE_TASK_NAME (default: tasklane-task)
    /// - TASKLANE_SLURM_PARTITION, TASKLANE_SLURM_ACCOUNT
    /// - TASKLANE_PBS_QUEUE, TASKLANE_PBS_ACCOUNT
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source
    fn from_vars<F>(var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let seconds = |name: &str| -> anyhow::Result<Option<Duration>> {
            value(name)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .with_context(|| format!("{} must be a whole number of seconds", name))
                })
                .transpose()
        };

        Ok(Self {
            backend: value("TASKLANE_BACKEND").unwrap_or(defaults.backend),
            poll_interval: seconds("TASKLANE_POLL_INTERVAL")?.unwrap_or(defaults.poll_interval),
            wall_clock_limit: seconds("TASKLANE_WALL_CLOCK_LIMIT")?,
            activation_script: value("TASKLANE_ACTIVATION_SCRIPT").map(PathBuf::from),
            task_name: value("TASKLANE_TASK_NAME").unwrap_or(defaults.task_name),
            slurm_partition: value("TASKLANE_SLURM_PARTITION"),
            slurm_account: value("TASKLANE_SLURM_ACCOUNT"),
            pbs_queue: value("TASKLANE_PBS_QUEUE"),
            pbs_account: value("TASKLANE_PBS_ACCOUNT"),
        })
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::new(self.poll_interval)
    }

    /// Adapter settings for the registry
    pub fn backends_config(&self) -> BackendsConfig {
        let mut backends = BackendsConfig::default();
        backends.slurm.partition = self.slurm_partition.clone();
        backends.slurm.account = self.slurm_account.clone();
        backends.pbs.queue = self.pbs_queue.clone();
        backends.pbs.account = self.pbs_account.clone();
        backends
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend.is_empty() {
            anyhow::bail!("backend cannot be empty");
        }

        if self.task_name.is_empty() {
            anyhow::bail!("task_name cannot be empty");
        }

        if self.wall_clock_limit.is_some_and(|limit| limit.is_zero()) {
            anyhow::bail!("wall_clock_limit must be greater than 0");
        }

        self.loop_config().validate()?;
        self.backends_config().validate()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            poll_interval: Duration::from_secs(5),
            wall_clock_limit: None,
            activation_script: None,
            task_name: "tasklane-task".to_string(),
            slurm_partition: None,
            slurm_account: None,
            pbs_queue: None,
            pbs_account: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend, "local");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.wall_clock_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars() {
        let config = from_pairs(&[
            ("TASKLANE_BACKEND", "SLURM"),
            ("TASKLANE_POLL_INTERVAL", "30"),
            ("TASKLANE_WALL_CLOCK_LIMIT", "3600"),
            ("TASKLANE_SLURM_PARTITION", "gpu"),
            ("TASKLANE_TASK_NAME", ""),
        ])
        .unwrap();

        assert_eq!(config.backend, "SLURM");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.wall_clock_limit, Some(Duration::from_secs(3600)));
        assert_eq!(config.task_name, "tasklane-task");
        assert_eq!(
            config.backends_config().slurm.partition.as_deref(),
            Some("gpu")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_interval_rejected() {
        assert!(from_pairs(&[("TASKLANE_POLL_INTERVAL", "5s")]).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.poll_interval = Duration::from_secs(1);

        config.wall_clock_limit = Some(Duration::ZERO);
        assert!(config.validate().is_err());
        config.wall_clock_limit = None;

        config.backend = String::new();
        assert!(config.validate().is_err());
    }
}
