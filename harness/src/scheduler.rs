//! Scheduler boundary and the SLURM implementation.
//!
//! The controller only needs three primitives from the batch system: submit a
//! job (optionally after a predecessor terminates), ask for a job's state, and
//! cancel a job. `sbatch`, `squeue` and `scancel` provide them.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    job::{JobDescriptor, Submission},
    state::now_timestamp,
};

/// Opaque scheduler job handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduler view of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, not started.
    Pending,
    /// Started and not yet terminal.
    Running,
    /// Reached a terminal scheduler state (COMPLETED, TIMEOUT, CANCELLED, ...).
    Finished(String),
    /// No longer known to the scheduler.
    Gone,
}

impl JobStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// The batch system, as seen by the controller.
pub trait Scheduler {
    /// Queue an attempt. Returns once the scheduler has accepted it.
    fn submit(
        &self,
        job: &JobDescriptor,
        submission: &Submission,
        workdir: &Path,
        rust_log: Option<&str>,
    ) -> Result<JobId, SchedulerError>;

    fn status(&self, id: &JobId) -> Result<JobStatus, SchedulerError>;

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError>;

    /// The job this process is running inside, if any.
    fn current_job(&self) -> Option<JobId>;
}

impl<T: Scheduler + ?Sized> Scheduler for Arc<T> {
    fn submit(
        &self,
        job: &JobDescriptor,
        submission: &Submission,
        workdir: &Path,
        rust_log: Option<&str>,
    ) -> Result<JobId, SchedulerError> {
        (**self).submit(job, submission, workdir, rust_log)
    }

    fn status(&self, id: &JobId) -> Result<JobStatus, SchedulerError> {
        (**self).status(id)
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        (**self).cancel(id)
    }

    fn current_job(&self) -> Option<JobId> {
        (**self).current_job()
    }
}

/// SLURM via its command-line tools.
pub struct Slurm {
    /// Directory generated batch scripts are written to.
    script_dir: PathBuf,
}

impl Slurm {
    #[must_use]
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
        }
    }

    /// Check whether `sbatch` is on the PATH.
    #[must_use]
    pub fn is_available() -> bool {
        Command::new("which")
            .arg("sbatch")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run(program: &str, args: &[&str]) -> Result<String, SchedulerError> {
        tracing::debug!("Running: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SchedulerError::Io(program.to_string(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SchedulerError::Command(program.to_string(), stderr));
        }
        Ok(stdout)
    }
}

impl Scheduler for Slurm {
    fn submit(
        &self,
        job: &JobDescriptor,
        submission: &Submission,
        workdir: &Path,
        rust_log: Option<&str>,
    ) -> Result<JobId, SchedulerError> {
        std::fs::create_dir_all(&self.script_dir)
            .map_err(|e| SchedulerError::Io(self.script_dir.display().to_string(), e))?;

        let stamp = now_timestamp().replace([' ', ':'], "-");
        let script_path = self.script_dir.join(format!("{}-{stamp}.sbatch", job.name));
        std::fs::write(
            &script_path,
            job.batch_script(submission, workdir, rust_log),
        )
        .map_err(|e| SchedulerError::Io(script_path.display().to_string(), e))?;

        let script = script_path.to_string_lossy();
        let output = Self::run("sbatch", &["--parsable", &script])?;
        parse_sbatch_output(&output)
    }

    fn status(&self, id: &JobId) -> Result<JobStatus, SchedulerError> {
        match Self::run("squeue", &["-h", "-j", &id.0, "-o", "%T"]) {
            Ok(output) => Ok(parse_squeue_state(&output)),
            // squeue errors out for ids that already left the controller's memory
            Err(SchedulerError::Command(_, stderr)) if is_invalid_job_id(&stderr) => {
                Ok(JobStatus::Gone)
            }
            Err(e) => Err(e),
        }
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        tracing::info!("Cancelling SLURM job {}", id);
        Self::run("scancel", &[&id.0])?;
        Ok(())
    }

    fn current_job(&self) -> Option<JobId> {
        std::env::var("SLURM_JOB_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .map(JobId)
    }
}

/// `sbatch --parsable` prints `<jobid>` or `<jobid>;<cluster>`.
fn parse_sbatch_output(output: &str) -> Result<JobId, SchedulerError> {
    let id = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(';').next())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_'))
        .ok_or_else(|| SchedulerError::Parse(output.trim().to_string()))?;
    Ok(JobId(id.to_string()))
}

fn parse_squeue_state(output: &str) -> JobStatus {
    let Some(state) = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_ascii_uppercase)
    else {
        return JobStatus::Gone;
    };

    match state.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED" => {
            JobStatus::Pending
        }
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
            JobStatus::Running
        }
        _ => JobStatus::Finished(state),
    }
}

fn is_invalid_job_id(text: &str) -> bool {
    text.to_ascii_lowercase().contains("invalid job id")
}

/// Errors from the scheduler boundary.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to run {0}: {1}")]
    Io(String, std::io::Error),
    #[error("{0} failed: {1}")]
    Command(String, String),
    #[error("could not parse job id from sbatch output {0:?}")]
    Parse(String),
}
