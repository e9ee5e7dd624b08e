//! PBS backend
//!
//! Supports PBS Pro and Torque. Jobs are submitted by piping a small shell
//! script to `qsub`, and polled with `qstat -f`, whose `Job Id:` blocks
//! carry the job state and, once finished, the exit status.

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
use crate::config::PbsConfig;
use crate::error::{Result, SchedulerError};

const BACKEND: &str = "pbs";

/// Messages qdel prints when the job already left the system
const FINISHED_MARKERS: [&str; 3] = [
    "Unknown Job Id",
    "Job has finished",
    "Request invalid for state of job",
];

/// One job as reported by `qstat -f`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QstatJob {
    pub state: String,
    pub exit_status: Option<i32>,
}

/// Adapter that drives jobs through the PBS command-line tools
pub struct PbsAdapter {
    config: PbsConfig,
    tracker: Tracker,
}

impl PbsAdapter {
    pub fn new() -> Self {
        Self::with_config(PbsConfig::default())
    }

    pub fn with_config(config: PbsConfig) -> Self {
        Self {
            config,
            tracker: Tracker::new(),
        }
    }

    fn qsub_args(&self, task: &Task) -> Vec<String> {
        let mut args = vec!["-N".to_string(), task.name().to_string()];
        if let Some(queue) = &self.config.queue {
            args.push("-q".to_string());
            args.push(queue.clone());
        }
        if let Some(account) = &self.config.account {
            args.push("-A".to_string());
            args.push(account.clone());
        }
        if let Some(limit) = task.wall_clock_limit() {
            args.push("-l".to_string());
            args.push(format!("walltime={}", format_walltime(limit)));
        }
        args
    }

    /// Handles a job qstat no longer lists
    ///
    /// Without `-x` a finished job simply drops out of qstat, so after a few
    /// misses it is assumed done. With `-x` the job should still be listed,
    /// so its disappearance (expired history) is recorded as a failure.
    fn job_missing(&self, id: &TaskId) {
        let misses = self.tracker.record_miss(id);
        if misses < MISSED_POLLS_BEFORE_LOST {
            debug!("PBS job {} not reported by qstat ({} time(s))", id, misses);
            return;
        }
        let state = if self.config.include_finished {
            TaskState::Failed
        } else {
            TaskState::Done
        };
        warn!(
            "PBS job {} missing from qstat for {} polls, assuming {}",
            id, misses, state
        );
        self.tracker.observe(id, state);
    }

    async fn run_control(&self, program: &str, id: &TaskId) -> Result<()> {
        run_tool(program, &[id.to_string()], None)
            .await?
            .checked(program)?;
        Ok(())
    }
}

impl Default for PbsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for PbsAdapter {
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

        let script = batch_script(task.command(), activation_script.or(task.activation_script()));
        let args = self.qsub_args(task);

        let output = run_tool(&self.config.qsub, &args, Some(&script))
            .await
            .map_err(|e| {
                SchedulerError::submission(
                    BACKEND,
                    format!("failed to run {}: {}", self.config.qsub, e),
                )
            })?;
        if !output.success {
            return Err(SchedulerError::submission(BACKEND, output.describe()));
        }

        let raw = output.stdout.trim();
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            return Err(SchedulerError::submission(
                BACKEND,
                format!("unrecognised qsub output: '{}'", raw),
            ));
        }

        let id = TaskId::new(raw);
        task.mark_submitted(id.clone(), BACKEND)?;
        self.tracker.insert(id.clone(), TaskState::Queued);
        info!("Submitted PBS job {} ({})", id, task.name());
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

        let mut args = vec!["-f".to_string()];
        if self.config.include_finished {
            args.push("-x".to_string());
        }
        args.extend(ids.iter().map(TaskId::to_string));

        let output = run_tool(&self.config.qstat, &args, None).await?;
        // qstat exits non-zero if any listed job is unknown but still
        // reports the others
        if !output.success && !output.stderr.contains("Unknown Job Id") {
            return Err(SchedulerError::command(&self.config.qstat, output.describe()));
        }
        let jobs = parse_qstat_full(&output.stdout);

        for id in &ids {
            let cancel_requested = self.tracker.cancel_requested(id);
            match lookup(&jobs, id) {
                Some(job) => match map_state(&job.state, job.exit_status, cancel_requested) {
                    Some(state) => {
                        if self.tracker.observe(id, state) {
                            debug!("PBS job {} is now {}", id, state);
                        }
                    }
                    None => {
                        self.tracker.seen(id);
                        warn!("Unknown PBS state '{}' for job {}", job.state, id);
                    }
                },
                None if cancel_requested => {
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

        let output = run_tool(&self.config.qdel, &[id.to_string()], None).await?;
        if output.success {
            self.tracker.mark_cancel_requested(&id);
            info!("Requested deletion of PBS job {}", id);
        } else if FINISHED_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            debug!("PBS job {} finished before it could be deleted", id);
        } else {
            return Err(SchedulerError::command(&self.config.qdel, output.describe()));
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

        self.run_control(&self.config.qhold, &id).await?;
        task.transition(TaskState::Held)?;
        self.tracker.observe(&id, TaskState::Held);
        info!("Held PBS job {}", id);
        Ok(())
    }

    async fn release_hold(&self, task: &mut Task) -> Result<()> {
        let id = ensure_owner(task, BACKEND)?;
        if !check_transition(task, TaskState::Queued)? {
            debug!("Task {} is already {}", id, TaskState::Queued);
            return Ok(());
        }

        self.run_control(&self.config.qrls, &id).await?;
        task.transition(TaskState::Queued)?;
        self.tracker.observe(&id, TaskState::Queued);
        info!("Released PBS job {}", id);
        Ok(())
    }

    fn forget(&self, id: &TaskId) {
        self.tracker.remove(id);
    }
}

/// Builds the batch script fed to qsub on stdin
pub(crate) fn batch_script(command: &[String], activation_script: Option<&Path>) -> String {
    let mut script = String::from("#!/bin/sh\n");
    if let Some(path) = activation_script {
        script.push_str(&format!(". {}\n", shell_quote(&path.to_string_lossy())));
    }
    script.push_str(&format!("exec {}\n", shell_join(command)));
    script
}

/// Finds a job by full id, then by its numeric prefix
///
/// Servers may print a longer host part than qsub did
/// (`12.head` vs `12.head.cluster.org`).
fn lookup<'a>(jobs: &'a HashMap<String, QstatJob>, id: &TaskId) -> Option<&'a QstatJob> {
    jobs.get(id.as_str()).or_else(|| {
        let short = short_id(id.as_str());
        jobs.iter()
            .find(|(key, _)| short_id(key) == short)
            .map(|(_, job)| job)
    })
}

fn short_id(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

/// Parses `qstat -f` output into job id -> state and exit status
pub(crate) fn parse_qstat_full(stdout: &str) -> HashMap<String, QstatJob> {
    let mut jobs = HashMap::new();
    let mut current: Option<(String, QstatJob)> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("Job Id:") {
            if let Some((id, job)) = current.take() {
                jobs.insert(id, job);
            }
            current = Some((
                id.trim().to_string(),
                QstatJob {
                    state: String::new(),
                    exit_status: None,
                },
            ));
            continue;
        }

        let Some((_, job)) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "job_state" => job.state = value.trim().to_string(),
            "exit_status" => match value.trim().parse() {
                Ok(code) => job.exit_status = Some(code),
                Err(_) => warn!("Unparseable PBS exit status '{}'", value.trim()),
            },
            _ => {}
        }
    }

    if let Some((id, job)) = current {
        jobs.insert(id, job);
    }
    jobs
}

/// Maps a PBS single-letter job state to a task state
pub(crate) fn map_state(
    state: &str,
    exit_status: Option<i32>,
    cancel_requested: bool,
) -> Option<TaskState> {
    let mapped = match state {
        "Q" | "W" | "T" => TaskState::Queued,
        "H" => TaskState::Held,
        "R" | "E" | "S" | "U" | "B" => TaskState::Running,
        "F" | "C" | "X" => {
            if cancel_requested {
                TaskState::Cancelled
            } else if exit_status == Some(0) {
                TaskState::Done
            } else {
                TaskState::Failed
            }
        }
        _ => return None,
    };
    Some(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const QSTAT_FULL: &str = "\
Job Id: 101.pbs-head
    Job_Name = train
    job_state = R
    queue = workq

Job Id: 102.pbs-head
    Job_Name = eval
    job_state = F
    Exit_status = 0

Job Id: 103.pbs-head
    job_state = F
    Exit_status = 2
";

    #[test]
    fn test_parse_qstat_full() {
        let jobs = parse_qstat_full(QSTAT_FULL);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs["101.pbs-head"].state, "R");
        assert_eq!(jobs["101.pbs-head"].exit_status, None);
        assert_eq!(jobs["102.pbs-head"].exit_status, Some(0));
        assert_eq!(jobs["103.pbs-head"].exit_status, Some(2));
    }

    #[test]
    fn test_torque_lower_case_exit_status() {
        let jobs = parse_qstat_full("Job Id: 7.torque\n    job_state = C\n    exit_status = 0\n");
        assert_eq!(
            map_state(&jobs["7.torque"].state, jobs["7.torque"].exit_status, false),
            Some(TaskState::Done)
        );
    }

    #[test]
    fn test_map_state() {
        assert_eq!(map_state("Q", None, false), Some(TaskState::Queued));
        assert_eq!(map_state("H", None, false), Some(TaskState::Held));
        assert_eq!(map_state("R", None, false), Some(TaskState::Running));
        assert_eq!(map_state("F", Some(0), false), Some(TaskState::Done));
        assert_eq!(map_state("F", Some(1), false), Some(TaskState::Failed));
        assert_eq!(map_state("F", Some(271), true), Some(TaskState::Cancelled));
        assert_eq!(map_state("?", None, false), None);
    }

    #[test]
    fn test_lookup_by_short_id() {
        let jobs = parse_qstat_full(QSTAT_FULL);
        assert!(lookup(&jobs, &TaskId::new("101.pbs-head.cluster.org")).is_some());
        assert!(lookup(&jobs, &TaskId::new("999.pbs-head")).is_none());
    }

    #[test]
    fn test_batch_script() {
        let command = vec!["python3".to_string(), "run.py".to_string(), "a b".to_string()];
        assert_eq!(
            batch_script(&command, Some(Path::new("/opt/env/activate.sh"))),
            "#!/bin/sh\n. /opt/env/activate.sh\nexec python3 run.py 'a b'\n"
        );
        assert_eq!(batch_script(&command[..1], None), "#!/bin/sh\nexec python3\n");
    }

    #[test]
    fn test_qsub_args() {
        let adapter = PbsAdapter::with_config(PbsConfig {
            queue: Some("workq".to_string()),
            ..PbsConfig::default()
        });
        let task = Task::new("sim", vec!["true".to_string()])
            .with_wall_clock_limit(Duration::from_secs(7200));
        assert_eq!(
            adapter.qsub_args(&task),
            vec!["-N", "sim", "-q", "workq", "-l", "walltime=02:00:00"]
        );
    }

    #[cfg(unix)]
    mod fake_cluster {
        use super::*;
        use crate::adapter::fake_tools::FakeTools;

        fn fake_pbs() -> FakeTools {
            let fake = FakeTools::new();
            fake.tool(
                "qsub",
                "cat > \"$LOG_DIR/qsub.script\"\nprintf '%s\\n' \"$@\" > \"$LOG_DIR/qsub.args\"\necho '101.pbs-head'",
            );
            fake.output_tool("qstat", "qstat.out");
            fake.recording_tool("qdel");
            fake.recording_tool("qhold");
            fake.recording_tool("qrls");
            fake
        }

        fn adapter(fake: &FakeTools) -> PbsAdapter {
            PbsAdapter::with_config(PbsConfig {
                qsub: fake.bin("qsub"),
                qstat: fake.bin("qstat"),
                qdel: fake.bin("qdel"),
                qhold: fake.bin("qhold"),
                qrls: fake.bin("qrls"),
                ..PbsConfig::default()
            })
        }

        async fn submitted(adapter: &PbsAdapter) -> Task {
            let mut task = Task::new("sim", vec!["./simulate".to_string(), "--steps=10".to_string()]);
            adapter.submit(&mut task, None).await.unwrap();
            task
        }

        #[tokio::test]
        async fn test_submit_pipes_script_to_qsub() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let mut task = Task::new("sim", vec!["./simulate".to_string()])
                .with_activation_script("/opt/env/activate.sh");

            adapter.submit(&mut task, None).await.unwrap();

            assert_eq!(task.id(), Some(&TaskId::new("101.pbs-head")));
            assert_eq!(task.state(), TaskState::Queued);
            assert_eq!(
                fake.read("qsub.script"),
                "#!/bin/sh\n. /opt/env/activate.sh\nexec ./simulate\n"
            );
            assert!(fake.read("qsub.args").contains("sim"));
        }

        #[tokio::test]
        async fn test_rejected_submission_leaves_task_new() {
            let fake = fake_pbs();
            fake.tool("qsub", "echo 'qsub: Unknown queue' >&2\nexit 170");
            let adapter = adapter(&fake);
            let mut task = Task::new("sim", vec!["true".to_string()]);

            let err = adapter.submit(&mut task, None).await.unwrap_err();

            assert!(err.is_submission());
            assert_eq!(task.state(), TaskState::New);
            assert!(task.id().is_none());
        }

        #[tokio::test]
        async fn test_kick_reads_qstat() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let task = submitted(&adapter).await;
            let id = task.id().unwrap();

            fake.set_output("qstat.out", "Job Id: 101.pbs-head\n    job_state = R\n");
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(id), Some(TaskState::Running));

            fake.set_output(
                "qstat.out",
                "Job Id: 101.pbs-head\n    job_state = F\n    Exit_status = 0\n",
            );
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(id), Some(TaskState::Done));
        }

        #[tokio::test]
        async fn test_hold_and_release() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let mut task = submitted(&adapter).await;

            adapter.hold(&mut task).await.unwrap();
            assert_eq!(task.state(), TaskState::Held);

            adapter.release_hold(&mut task).await.unwrap();
            assert_eq!(task.state(), TaskState::Queued);

            let calls = fake.calls();
            assert!(calls.contains("qhold 101.pbs-head"));
            assert!(calls.contains("qrls 101.pbs-head"));
        }

        #[tokio::test]
        async fn test_release_requires_held() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let mut task = submitted(&adapter).await;

            // Already queued: nothing is sent, qrls would reject an unheld job
            adapter.release_hold(&mut task).await.unwrap();
            assert_eq!(task.state(), TaskState::Queued);
            assert!(!fake.calls().contains("qrls"));

            task.transition(TaskState::Running).unwrap();
            assert!(adapter.release_hold(&mut task).await.is_err());
            assert_eq!(task.state(), TaskState::Running);
        }

        #[tokio::test]
        async fn test_cancel_then_poll() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let mut task = submitted(&adapter).await;

            adapter.cancel(&mut task).await.unwrap();
            assert!(fake.calls().contains("qdel 101.pbs-head"));

            fake.set_output(
                "qstat.out",
                "Job Id: 101.pbs-head\n    job_state = F\n    Exit_status = 271\n",
            );
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(task.id().unwrap()), Some(TaskState::Cancelled));
        }

        #[tokio::test]
        async fn test_cancel_of_finished_job_is_silent() {
            let fake = fake_pbs();
            fake.tool("qdel", "echo 'qdel: Unknown Job Id 101.pbs-head' >&2\nexit 153");
            let adapter = adapter(&fake);
            let mut task = submitted(&adapter).await;

            adapter.cancel(&mut task).await.unwrap();

            fake.set_output(
                "qstat.out",
                "Job Id: 101.pbs-head\n    job_state = F\n    Exit_status = 0\n",
            );
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(task.id().unwrap()), Some(TaskState::Done));
        }

        #[tokio::test]
        async fn test_failed_qdel_keeps_real_outcome() {
            let fake = fake_pbs();
            fake.tool("qdel", "echo 'qdel: Unauthorized Request 101.pbs-head' >&2\nexit 159");
            let adapter = adapter(&fake);
            let mut task = submitted(&adapter).await;

            let err = adapter.cancel(&mut task).await.unwrap_err();
            assert!(matches!(err, SchedulerError::Command { .. }));

            fake.set_output(
                "qstat.out",
                "Job Id: 101.pbs-head\n    job_state = F\n    Exit_status = 0\n",
            );
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(task.id().unwrap()), Some(TaskState::Done));
        }

        #[tokio::test]
        async fn test_job_dropped_from_qstat_without_history_is_done() {
            let fake = fake_pbs();
            let adapter = PbsAdapter::with_config(PbsConfig {
                include_finished: false,
                ..adapter(&fake).config
            });
            let task = submitted(&adapter).await;
            let id = task.id().unwrap();

            fake.set_output("qstat.out", "Job Id: 101.pbs-head\n    job_state = R\n");
            adapter.kick().await.unwrap();

            fake.set_output("qstat.out", "");
            for _ in 1..MISSED_POLLS_BEFORE_LOST {
                adapter.kick().await.unwrap();
                assert_eq!(adapter.status(id), Some(TaskState::Running));
            }
            adapter.kick().await.unwrap();
            assert_eq!(adapter.status(id), Some(TaskState::Done));
        }

        #[tokio::test]
        async fn test_job_missing_from_history_is_failed() {
            let fake = fake_pbs();
            let adapter = adapter(&fake);
            let task = submitted(&adapter).await;

            for _ in 0..MISSED_POLLS_BEFORE_LOST {
                adapter.kick().await.unwrap();
            }
            assert_eq!(adapter.status(task.id().unwrap()), Some(TaskState::Failed));
        }

        #[tokio::test]
        async fn test_qstat_failure_propagates() {
            let fake = fake_pbs();
            fake.tool("qstat", "echo 'Connection refused' >&2\nexit 2");
            let adapter = adapter(&fake);
            submitted(&adapter).await;

            assert!(adapter.kick().await.is_err());
        }
    }
}
