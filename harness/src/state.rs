//! Chain state tracking and persistence.
//!
//! Records where the resubmission chain stands and persists it to JSON so
//! every attempt, and the operator, sees the same picture.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::Path,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{progress::TerminationSignal, scheduler::JobId};

/// Status of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Nothing has run yet, or the first attempt is queued.
    #[default]
    Pending,
    /// An attempt is executing.
    Running,
    /// Target step count reached.
    Completed,
    /// The last attempt stopped on the wall clock; the next one is queued.
    Incomplete,
    /// An attempt failed; nothing is queued.
    Failed,
    /// Stopped by the operator.
    Cancelled,
}

impl ChainStatus {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Incomplete => "INCOMPLETE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// No further attempt should start without operator action.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stopped short of the target; only a reset restarts the chain.
    #[must_use]
    pub fn is_halted(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// One finished attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub job: Option<JobId>,
    pub signal: TerminationSignal,
    pub step_before: u64,
    pub step_after: u64,
    pub exit_code: Option<i32>,
    pub started_at: Option<String>,
    pub finished_at: String,
}

/// Persistent state of one chain.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainState {
    pub status: ChainStatus,
    /// Target the chain was started with; later attempts must agree.
    pub target_steps: Option<u64>,
    /// Step count seen after the last attempt.
    pub last_step: Option<u64>,
    /// Attempts started so far.
    pub attempts: u32,
    /// Submissions made by attempts (the initial submission is not counted).
    pub resubmissions: u32,
    /// Job holding the Run State while status is Running.
    pub current_job: Option<JobId>,
    /// Job queued to run next.
    pub pending_job: Option<JobId>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

/// Manages state persistence with file locking.
pub struct StateManager {
    /// Path to the state file.
    pub path: std::path::PathBuf,
}

impl StateManager {
    /// Create a new state manager for the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load state from file, or create empty state if file doesn't exist.
    pub fn load(&self) -> Result<ChainState, StateError> {
        if !self.path.exists() {
            return Ok(ChainState::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            return Ok(ChainState::default());
        }

        let reader = BufReader::new(&file);
        let state = serde_json::from_reader(reader)
            .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(state)
    }

    /// Update state atomically with a closure (holds lock for entire operation).
    ///
    /// The closure may refuse the update by returning an error, in which case
    /// nothing is written.
    pub fn try_update<F, T>(&self, f: F) -> Result<(ChainState, T), StateError>
    where
        F: FnOnce(&mut ChainState) -> Result<T, StateError>,
    {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        // Hold exclusive lock for entire operation
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let mut state: ChainState = if file.metadata().map(|m| m.len()).unwrap_or(0) > 0 {
            let reader = BufReader::new(&file);
            serde_json::from_reader(reader)
                .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?
        } else {
            ChainState::default()
        };

        let out = match f(&mut state) {
            Ok(out) => out,
            Err(e) => {
                let _ = file.unlock();
                return Err(e);
            }
        };

        file.set_len(0)
            .map_err(|e| StateError::Io(self.path.clone(), e))?;
        (&file)
            .seek(SeekFrom::Start(0))
            .map_err(|e| StateError::Io(self.path.clone(), e))?;

        let writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(writer, &state)
            .map_err(|e| StateError::Write(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok((state, out))
    }

    /// Update state atomically with an infallible closure.
    pub fn update<F>(&self, f: F) -> Result<ChainState, StateError>
    where
        F: FnOnce(&mut ChainState),
    {
        self.try_update(|state| {
            f(state);
            Ok(())
        })
        .map(|(state, ())| state)
    }

    /// Claim the Run State for an attempt.
    ///
    /// Fails with [`StateError::Halted`] when the chain was cancelled or has
    /// failed, and with [`StateError::Busy`] when another attempt is recorded
    /// as running and `is_live` says its job is still active.
    pub fn begin_attempt(
        &self,
        job: Option<&JobId>,
        target_steps: u64,
        step: u64,
        is_live: impl FnOnce(&JobId) -> bool,
    ) -> Result<ChainState, StateError> {
        self.try_update(|state| {
            if state.status.is_halted() {
                return Err(StateError::Halted(state.status));
            }
            if state.status == ChainStatus::Running
                && let Some(holder) = state.current_job.clone()
                && job != Some(&holder)
            {
                if is_live(&holder) {
                    return Err(StateError::Busy(holder));
                }
                tracing::warn!("Attempt in job {} ended without recording an outcome", holder);
                state
                    .errors
                    .push(format!("Attempt in job {holder} ended without recording an outcome"));
            }

            state.status = ChainStatus::Running;
            state.attempts += 1;
            state.current_job = job.cloned();
            if state.pending_job.as_ref() == job {
                state.pending_job = None;
            }
            state.target_steps = Some(target_steps);
            state.last_step = Some(step);
            if state.started_at.is_none() {
                state.started_at = Some(now_timestamp());
            }
            Ok(())
        })
        .map(|(state, ())| state)
    }

    /// Record the outcome of the attempt that holds the Run State.
    pub fn record_attempt(&self, record: AttemptRecord) -> Result<ChainState, StateError> {
        self.update(|state| {
            state.status = match &record.signal {
                TerminationSignal::Completed => ChainStatus::Completed,
                // a cancel issued while the attempt ran stays in force
                TerminationSignal::Incomplete if state.status == ChainStatus::Cancelled => {
                    ChainStatus::Cancelled
                }
                TerminationSignal::Incomplete => ChainStatus::Incomplete,
                TerminationSignal::Failed(reason) => {
                    state.errors.push(reason.to_string());
                    ChainStatus::Failed
                }
            };
            if state.status.is_terminal() {
                state.finished_at = Some(record.finished_at.clone());
            }
            state.current_job = None;
            state.last_step = Some(record.step_after);
            state.history.push(record);
        })
    }

    /// Record that the chain is already complete without running anything.
    pub fn mark_completed(&self, step: u64) -> Result<ChainState, StateError> {
        self.update(|state| {
            state.status = ChainStatus::Completed;
            state.current_job = None;
            state.pending_job = None;
            state.last_step = Some(step);
            if state.finished_at.is_none() {
                state.finished_at = Some(now_timestamp());
            }
        })
    }

    /// Record a failure detected before the computation was started.
    pub fn mark_failed(&self, error: &str) -> Result<ChainState, StateError> {
        self.update(|state| {
            state.status = ChainStatus::Failed;
            state.current_job = None;
            state.errors.push(error.to_string());
            state.finished_at = Some(now_timestamp());
        })
    }

    /// Record a queued attempt.
    ///
    /// Refuses with [`StateError::Halted`] when the chain was stopped after
    /// the job was submitted; the caller owns cancelling that job.
    pub fn mark_submitted(&self, job: &JobId, resubmission: bool) -> Result<(), StateError> {
        self.try_update(|state| {
            if state.status.is_halted() {
                return Err(StateError::Halted(state.status));
            }
            state.pending_job = Some(job.clone());
            if resubmission {
                state.resubmissions += 1;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Stop the chain. Returns the job that was queued, if any.
    pub fn mark_cancelled(&self) -> Result<Option<JobId>, StateError> {
        let mut pending = None;
        self.update(|state| {
            pending = state.pending_job.take();
            if state.status != ChainStatus::Completed {
                state.status = ChainStatus::Cancelled;
                state.finished_at = Some(now_timestamp());
            }
        })?;
        Ok(pending)
    }

    /// Return a failed or cancelled chain to a startable state.
    pub fn reset(&self) -> Result<bool, StateError> {
        let mut changed = false;
        self.update(|state| {
            if state.status.is_halted() {
                state.status = if state.attempts == 0 {
                    ChainStatus::Pending
                } else {
                    ChainStatus::Incomplete
                };
                state.current_job = None;
                state.pending_job = None;
                state.target_steps = None;
                state.errors.clear();
                state.finished_at = None;
                changed = true;
            }
        })?;
        Ok(changed)
    }
}

/// Get current local time as a timestamp string.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with state management.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write state file {0}: {1}")]
    Io(std::path::PathBuf, std::io::Error),
    #[error("failed to lock state file {0}: {1}")]
    Lock(std::path::PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(std::path::PathBuf, String),
    #[error("failed to write state file {0}: {1}")]
    Write(std::path::PathBuf, String),
    #[error("run state is held by active job {0}")]
    Busy(JobId),
    #[error("chain is {}", .0.label())]
    Halted(ChainStatus),
}
