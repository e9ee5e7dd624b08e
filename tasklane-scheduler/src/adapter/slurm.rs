//! SLURM backend
//!
//! Submits with `sbatch --wrap`, polls with `squeue` and falls back to
//! `sacct` for jobs that already left the queue. Hold and release go through
//! `scontrol`, cancellation through `scancel`.
//!
//! Wall-clock enforcement is left to SLURM itself: the task's limit is passed
//! as `--time`, and an expired job comes back from the scheduler as
//! `TIMEOUT`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tasklane_core::{Task, TaskId, TaskState};
use tracing::{debug, info, warn};

use super::command::{format_walltime, run_tool, shell_join, shell_quote};
use super::tracker::{MISSED_POLLS_BEFORE_LOST, Tracker};
use super::{
    BackendAdapter, Operation, cancel_target, check_transition, ensure_new, ensure_owner,
};
use crate::config::SlurmConfig;
use crate::error::{Result, SchedulerError};

const BACKEND: &str = "slurm";

/// Adapter that drives jobs through the SLURM command-line tools
pub struct SlurmAdapter {
    config: SlurmConfig,
    tracker: Tracker,
}

impl SlurmAdapter {
    pub fn new() -> Self {
        Self::with_config(SlurmConfig::default())
    }

    pub fn with_config(config: SlurmConfig) -> Self {
        Self {
            config,
            tracker: Tracker::new(),
        }
    }

    fn sbatch_args(&self, task: &Task, activation_script: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "--parsable".to_string(),
            format!("--job-name={}", task.name()),
        ];
        if let Some(partition) = &self.config.partition {
            args.push(format!("--partition={}", partition));
        }
        if let Some(account) = &self.config.account {
            args.push(format!("--account={}", account));
        }
        if let Some(limit) = task.wall_clock_limit() {
            args.push(format!("--time={}", format_walltime(limit)));
        }

        let command = shell_join(task.command());
        let wrap = match activation_script {
            Some(script) => format!(
                ". {} && {}",
                shell_quote(&script.to_string_lossy()),
                command
            ),
            None => command,
        };
        args.push(format!("--wrap={}", wrap));
        args
    }

    /// Looks up jobs that no longer appear in `squeue`
    async fn query_accounting(&self, ids: &[TaskId]) -> Result<HashMap<TaskId, TaskState>> {
        let args = vec![
            "--noheader".to_string(),
            "--parsable2".to_string(),
            "--allocations".to_string(),
            "--format=JobID,State".to_string(),
            format!("--jobs={}", join_ids(ids)),
        ];
        let output = run_tool(&self.config.sacct, &args, None)
            .await?
            .checked(&self.config.sacct)?;
        Ok(parse_sacct(&output.stdout))
    }

    /// Handles a job neither squeue nor sacct reports
    ///
    /// Accounting can lag behind squeue for a freshly finished job, so the
    /// job is only given up on after several polls.
    fn job_missing(&self, id: &TaskId) {
        let misses = self.tracker.record_miss(id);
        if misses < MISSED_POLLS_BEFORE_LOST {
            debug!("SLURM job {} not reported yet ({} time(s))", id, misses);
            return;
        }
        warn!(
            "SLURM job {} unknown to squeue and sacct for {} polls, marking it failed",
            id, misses
        );
        self.tracker.observe(id, TaskState::Failed);
    }

    async fn scontrol(&self, action: &str, id: &TaskId) -> Result<()> {
        let args = vec![action.to_string(), id.to_string()];
        run_tool(&self.config.scontrol, &args, None)
            .await?
            .checked(&self.config.scontrol)?;
        Ok(())
    }
}

impl Default for SlurmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for SlurmAdapter {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn supports(&self, _operation: Operation) -> bool {
        true
    }

    async fn submit(&self, task: &mut Task, activation_script: Option<&Path>) -> Result<()> {
        ensure_new(task)?;
        if task.command().is_empty() {
            return Err(SchedulerError::submission(BACKEND, "command is empty"));
        }

        let script = activation_script.or(task.activation_script());
        let args = self.sbatch_args(task, script);

        let output = run_tool(&self.config.sbatch, &args, None)
            .await
            .map_err(|e| {
                SchedulerError::submission(
                    BACKEND,
                    format!("failed to run {}: {}", self.config.sbatch, e),
                )
            })?;
        if !output.success {
            return Err(SchedulerError::submission(BACKEND, output.describe()));
        }

        let id = parse_sbatch_output(&output.stdout).ok_or_else(|| {
            SchedulerError::submission(
                BACKEND,
                format!("unrecognised sbatch output: '{}'", output.stdout.trim()),
            )
        })?;

        task.mark_submitted(id.clone(), BACKEND)?;
        self.tracker.insert(id.clone(), TaskState::Queued);
        info!("Submitted SLURM job {} ({})", id, task.name());
        Ok(())
    }

    fn update(&self, id: &TaskId, state: TaskState) {
        self.tracker.observe(id, state);
    }

    async fn kick(&self) -> Result<()> {
        let ids = self.tracker.active_ids();
        if ids.is_empty() {
            return Ok(());
        }

        let args = vec![
            "--noheader".to_string(),
            "--format=%i %T %r".to_string(),
            format!("--jobs={}", join_ids(&ids)),
        ];
        let output = run_tool(&self.config.squeue, &args, None).await?;
        let queued = if output.success {
            parse_squeue(&output.stdout)
        } else if output.stderr.contains("Invalid job id") {
            // squeue refuses the whole request once any listed job is purged
            HashMap::new()
        } else {
            return Err(SchedulerError::command(&self.config.squeue, output.describe()));
        };

        let missing: Vec<TaskId> = ids
            .iter()
            .filter(|id| !queued.contains_key(*id))
            .cloned()
            .collect();
        let finished = if missing.is_empty() {
            HashMap::new()
        } else {
            self.query_accounting(&missing).await?
        };

        for id in &ids {
            match queued.get(id).or_else(|| finished.get(id)) {
                Some(&state) => {
                    if self.tracker.observe(id, state) {
                        debug!("SLURM job {} is now {}", id, state);
                    }
                }
                None if self.tracker.cancel_requested(id) => {
                    self.tracker.observe(id, TaskState::Cancelled);
                }
                None => self.job_missing(id),
            }
        }
        Ok(())
    }

    fn status(&self, id: &TaskId) -> Option<TaskState> {
        self.tracker.state(id)
    }

    fn timeout(&self, _task: &Task) -> bool {
        false
    }

    async fn cancel(&self, task: &mut Task) -> Result<()> {
        let Some(id) = cancel_target(task, BACKEND)? else {
            return Ok(());
        };

        let output = run_tool(&self.config.scancel, &[id.to_string()], None).await?;
        if output.success {
            self.tracker.mark_cancel_requested(&id);
            info!("Requested cancellation of SLURM job {}", id);
        } else if output.stderr.contains("Invalid job id")
            || output.stderr.contains("already completing or completed")
        {
            debug!("SLURM job {} finished before it could be cancelled", id);
        } else {
            return Err(SchedulerError::command(&self.config.scancel, output.describe()));
        }
        Ok(())
    }

    fn get_ids(&self) -> Result<HashSet<TaskId>> {
        Ok(self.tracker.ids())
    }

    async fn hold(&self, task: &mut Task) -> Result<()> {
        let id = ensure_owner(task, BACKEND)?;
        if !check_transition(task, TaskState::Held)? {
            debug!("Task {} is already {}", id, TaskState::Held);
            return Ok(());
        }

        self.scontrol("hold", &id).await?;
        task.transition(TaskState::Held)?;
        self.tracker.observe(&id, TaskState::Held);
        info!("Held SLURM job {}", id);
        Ok(())
    }

    async fn release_hold(&self, task: &mut Task) -> Result<()> {
        let id = ensure_owner(task, BACKEND)?;
        if !check_transition(task, TaskState::Queued)? {
            debug!("Task {} is already {}", id, TaskState::Queued);
            return Ok(());
        }

        self.scontrol("release", &id).await?;
        task.transition(TaskState::Queued)?;
        self.tracker.observe(&id, TaskState::Queued);
        info!("Released SLURM job {}", id);
        Ok(())
    }

    fn forget(&self, id: &TaskId) {
        self.tracker.remove(id);
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Extracts the job id from `sbatch` output
///
/// Handles `--parsable` output (`12345` or `12345;cluster`) as well as the
/// default `Submitted batch job 12345`.
pub(crate) fn parse_sbatch_output(stdout: &str) -> Option<TaskId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let raw = match line.strip_prefix("Submitted batch job") {
        Some(rest) => rest.split_whitespace().next()?,
        None => line.split(';').next()?.trim(),
    };
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return None;
    }
    Some(TaskId::new(raw))
}

/// Parses `squeue --noheader --format="%i %T %r"` output
pub(crate) fn parse_squeue(stdout: &str) -> HashMap<TaskId, TaskState> {
    let mut states = HashMap::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        let reason = fields.next().unwrap_or("");
        match map_state(state, reason) {
            Some(mapped) => {
                states.insert(TaskId::new(id), mapped);
            }
            None => warn!("Unknown SLURM state '{}' for job {}", state, id),
        }
    }
    states
}

/// Parses `sacct --parsable2 --format=JobID,State` output
///
/// States such as `CANCELLED by 1000` are reduced to their first word.
pub(crate) fn parse_sacct(stdout: &str) -> HashMap<TaskId, TaskState> {
    let mut states = HashMap::new();
    for line in stdout.lines() {
        let Some((id, state)) = line.trim().split_once('|') else {
            continue;
        };
        if id.contains('.') {
            continue;
        }
        let state = state.split_whitespace().next().unwrap_or("");
        if let Some(mapped) = map_state(state, "") {
            states.insert(TaskId::new(id), mapped);
        }
    }
    states
}

/// Maps a SLURM job state (long form) and pending reason to a task state
pub(crate) fn map_state(state: &str, reason: &str) -> Option<TaskState> {
    let mapped = match state.trim_end_matches('+') {
        "PENDING" if reason.starts_with("JobHeld") => TaskState::Held,
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" | "RESIZING" => {
            TaskState::Queued
        }
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STOPPED" | "SIGNALING" | "STAGE_OUT" => {
            TaskState::Running
        }
        "COMPLETED" => TaskState::Done,
        "CANCELLED" => TaskState::Cancelled,
        "TIMEOUT" | "DEADLINE" => TaskState::Timeout,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "PREEMPTED" => {
            TaskState::Failed
        }
        _ => return None,
    };
    Some(mapped)
}
