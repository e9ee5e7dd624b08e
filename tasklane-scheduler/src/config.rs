//! Scheduler configuration
//!
//! Settings for the control loop and for each backend adapter. Every
//! external tool an adapter invokes is configurable so deployments can point
//! at wrappers (and tests at fakes).

use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Control loop configuration
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Time between two regular poll cycles
    pub poll_interval: Duration,
}

impl LoopConfig {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// Local subprocess backend configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Shell used to source activation scripts
    pub shell: String,

    /// Default wall-clock budget for tasks without their own limit
    pub wall_clock_limit: Option<Duration>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            wall_clock_limit: None,
        }
    }
}

/// SLURM backend configuration
#[derive(Debug, Clone)]
pub struct SlurmConfig {
    pub sbatch: String,
    pub squeue: String,
    pub sacct: String,
    pub scancel: String,
    pub scontrol: String,

    /// Partition passed to `sbatch --partition`
    pub partition: Option<String>,

    /// Account passed to `sbatch --account`
    pub account: Option<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            scontrol: "scontrol".to_string(),
            partition: None,
            account: None,
        }
    }
}

/// PBS backend configuration
#[derive(Debug, Clone)]
pub struct PbsConfig {
    pub qsub: String,
    pub qstat: String,
    pub qdel: String,
    pub qhold: String,
    pub qrls: String,

    /// Destination queue passed to `qsub -q`
    pub queue: Option<String>,

    /// Account passed to `qsub -A`
    pub account: Option<String>,

    /// Pass `-x` to qstat so finished jobs are still reported (PBS Pro)
    pub include_finished: bool,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qdel: "qdel".to_string(),
            qhold: "qhold".to_string(),
            qrls: "qrls".to_string(),
            queue: None,
            account: None,
            include_finished: true,
        }
    }
}

/// Configuration for every built-in backend
///
/// Captured by the registry so each `get_scheduler` call builds a fresh
/// adapter from the same settings.
#[derive(Debug, Clone, Default)]
pub struct BackendsConfig {
    pub local: LocalConfig,
    pub slurm: SlurmConfig,
    pub pbs: PbsConfig,
}

impl BackendsConfig {
    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.local.shell.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "local shell cannot be empty".to_string(),
            ));
        }
        if self.local.wall_clock_limit.is_some_and(|d| d.is_zero()) {
            return Err(SchedulerError::InvalidConfig(
                "local wall_clock_limit must be greater than 0".to_string(),
            ));
        }

        let tools = [
            ("sbatch", &self.slurm.sbatch),
            ("squeue", &self.slurm.squeue),
            ("sacct", &self.slurm.sacct),
            ("scancel", &self.slurm.scancel),
            ("scontrol", &self.slurm.scontrol),
            ("qsub", &self.pbs.qsub),
            ("qstat", &self.pbs.qstat),
            ("qdel", &self.pbs.qdel),
            ("qhold", &self.pbs.qhold),
            ("qrls", &self.pbs.qrls),
        ];
        for (tool, path) in tools {
            if path.is_empty() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{} command cannot be empty",
                    tool
                )));
            }
        }

        Ok(())
    }
}
