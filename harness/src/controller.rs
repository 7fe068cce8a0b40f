//! Self-resubmitting controller for the production run.
//!
//! One scheduled job runs one attempt: it resumes the computation from the
//! last checkpoint, lets it run until the wall-clock budget is used up, then
//! decides from the Run State on disk whether the run is complete, should be
//! continued by a freshly queued job, or has failed for good.
//!
//! ```text
//!  start() ──submit──▶ [pending] ──scheduler──▶ run_attempt()
//!                                                   │
//!            ┌──────────────┬───────────────────────┤
//!            ▼              ▼                       ▼
//!       completed      incomplete ──resubmit()──▶ [pending]
//!                           │
//!                       failed (no resubmission)
//! ```

use std::{path::PathBuf, time::Duration};

use crate::{
    config::HarnessConfig,
    job::{JobDescriptor, Submission},
    progress::{
        AttemptExit, CheckpointState, FailureReason, ProgressError, RunFiles, RunStateSnapshot,
        TerminationSignal, classify,
    },
    runner::{AttemptRequest, Engine},
    scheduler::{JobId, Scheduler, SchedulerError},
    state::{AttemptRecord, ChainState, ChainStatus, StateError, StateManager, now_timestamp},
};

/// Everything the controller needs to know about the chain it drives.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub descriptor: JobDescriptor,
    /// Attempt entry point, carried unchanged into every submission.
    pub command: Vec<String>,
    pub files: RunFiles,
    pub target_steps: u64,
    pub safety_margin: Duration,
    pub workdir: PathBuf,
    pub rust_log: Option<String>,
}

impl ControllerConfig {
    /// Build the production-run controller settings from the harness config.
    #[must_use]
    pub fn from_harness(config: &HarnessConfig, command: Vec<String>) -> Self {
        Self {
            descriptor: config.job.clone(),
            command,
            files: RunFiles::production(config.workdir()),
            target_steps: config.md.steps.md_steps,
            safety_margin: config.safety_margin(),
            workdir: config.workdir().to_path_buf(),
            rust_log: config.harness.rust_log.clone(),
        }
    }
}

/// Result of starting the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The target was already reached; nothing was submitted.
    AlreadyComplete,
    /// An earlier submission is still queued or running.
    AlreadyQueued(JobId),
    /// The chain was stopped and needs a reset first.
    Halted(ChainStatus),
    Submitted(JobId),
}

/// Result of the resubmission step at the end of an incomplete attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resubmission {
    Submitted(JobId),
    /// The Run State already shows completion.
    SkippedComplete,
    /// The chain was stopped while this attempt ran.
    SkippedHalted(ChainStatus),
}

/// Result of one scheduled attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The target was already reached; the computation was not started.
    AlreadyComplete { step: u64 },
    /// The chain was cancelled or failed before this attempt started.
    Halted(ChainStatus),
    Finished {
        signal: TerminationSignal,
        step: u64,
        resubmission: Option<Resubmission>,
    },
}

impl AttemptOutcome {
    /// Termination signal of this attempt, if the attempt counted as one.
    #[must_use]
    pub fn signal(&self) -> Option<&TerminationSignal> {
        match self {
            Self::Finished { signal, .. } => Some(signal),
            Self::AlreadyComplete { .. } | Self::Halted(_) => None,
        }
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self.signal(), Some(TerminationSignal::Failed(_)))
    }
}

/// Drives the chain of attempts for one Run State.
pub struct Controller<S, E> {
    config: ControllerConfig,
    scheduler: S,
    engine: E,
    state: StateManager,
}

impl<S: Scheduler, E: Engine> Controller<S, E> {
    #[must_use]
    pub fn new(config: ControllerConfig, scheduler: S, engine: E, state: StateManager) -> Self {
        Self {
            config,
            scheduler,
            engine,
            state,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Read the Run State from disk.
    pub fn snapshot(&self) -> Result<RunStateSnapshot, ControllerError> {
        Ok(self.config.files.snapshot()?)
    }

    /// Completion check against the configured target.
    pub fn is_complete(&self) -> Result<bool, ControllerError> {
        Ok(self.snapshot()?.is_complete(self.config.target_steps))
    }

    /// Chain state together with the current Run State.
    pub fn status(&self) -> Result<(ChainState, RunStateSnapshot), ControllerError> {
        Ok((self.state.load()?, self.snapshot()?))
    }

    fn submission(&self, resume: bool, after: Option<JobId>) -> Submission {
        Submission {
            command: self.config.command.clone(),
            resume,
            after,
        }
    }

    fn submit(&self, submission: &Submission) -> Result<JobId, SchedulerError> {
        self.scheduler.submit(
            &self.config.descriptor,
            submission,
            &self.config.workdir,
            self.config.rust_log.as_deref(),
        )
    }

    /// Record a fresh submission, withdrawing it when the chain was stopped
    /// while it was being queued.
    fn record_submission(
        &self,
        job: &JobId,
        resubmission: bool,
    ) -> Result<Option<ChainStatus>, ControllerError> {
        match self.state.mark_submitted(job, resubmission) {
            Ok(()) => Ok(None),
            Err(StateError::Halted(status)) => {
                tracing::info!(
                    "Chain became {} during submission, cancelling job {}",
                    status.label(),
                    job
                );
                self.scheduler.cancel(job)?;
                Ok(Some(status))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Queue the first attempt of the chain.
    pub fn start(&self) -> Result<StartOutcome, ControllerError> {
        let snapshot = self.snapshot()?;
        if snapshot.is_complete(self.config.target_steps) {
            tracing::info!(
                "Run already complete at step {}/{}, nothing to submit",
                snapshot.step,
                self.config.target_steps
            );
            self.state.mark_completed(snapshot.step)?;
            return Ok(StartOutcome::AlreadyComplete);
        }

        let chain = self.state.load()?;
        if chain.status.is_halted() {
            return Ok(StartOutcome::Halted(chain.status));
        }

        let running = chain
            .current_job
            .clone()
            .filter(|_| chain.status == ChainStatus::Running);
        for job in [chain.pending_job.clone(), running].into_iter().flatten() {
            if self.scheduler.status(&job)?.is_active() {
                tracing::info!("Job {} is still queued or running, not submitting again", job);
                return Ok(StartOutcome::AlreadyQueued(job));
            }
        }

        let submission = self.submission(snapshot.checkpoint.is_valid(), None);
        let job = self.submit(&submission)?;
        if let Some(status) = self.record_submission(&job, false)? {
            return Ok(StartOutcome::Halted(status));
        }
        tracing::info!(
            "Submitted job {} ({} from step {})",
            job,
            if submission.resume { "resuming" } else { "starting" },
            snapshot.step
        );
        Ok(StartOutcome::Submitted(job))
    }

    /// Run one attempt inside the current scheduled job.
    pub async fn run_attempt(&self, resume: bool) -> Result<AttemptOutcome, ControllerError> {
        let target = self.config.target_steps;
        let own_job = self.scheduler.current_job();
        let before = self.snapshot()?;

        if before.is_complete(target) {
            tracing::info!("Run already complete at step {}/{}", before.step, target);
            self.state.mark_completed(before.step)?;
            return Ok(AttemptOutcome::AlreadyComplete { step: before.step });
        }

        let chain = self.state.load()?;
        if chain.status.is_halted() {
            tracing::warn!("Chain is {}, not starting an attempt", chain.status.label());
            return Ok(AttemptOutcome::Halted(chain.status));
        }
        if let Some(recorded) = chain.target_steps
            && recorded != target
        {
            return Err(ControllerError::TargetMismatch {
                recorded,
                configured: target,
            });
        }

        if !self.config.files.tpr.exists() {
            let path = self.config.files.tpr.clone();
            self.state
                .mark_failed(&FailureReason::MissingInput { path: path.clone() }.to_string())?;
            return Err(ControllerError::MissingInput(path));
        }

        let budget = self
            .config
            .descriptor
            .budget(self.config.safety_margin)
            .ok_or(ControllerError::NoBudget)?;

        if resume {
            let reason = match &before.checkpoint {
                CheckpointState::Valid { .. } => None,
                CheckpointState::Corrupt(reason) => Some(FailureReason::CheckpointCorrupt {
                    reason: reason.clone(),
                }),
                CheckpointState::Missing => Some(FailureReason::CheckpointMissing),
            };
            if let Some(reason) = reason {
                tracing::error!("Cannot resume: {}", reason);
                self.state.mark_failed(&reason.to_string())?;
                return Ok(AttemptOutcome::Finished {
                    signal: TerminationSignal::Failed(reason),
                    step: before.step,
                    resubmission: None,
                });
            }
        }
        // never restart from scratch over a usable checkpoint
        let resume = resume || before.checkpoint.is_valid();

        let scheduler = &self.scheduler;
        let claimed = self
            .state
            .begin_attempt(own_job.as_ref(), target, before.step, |holder| {
                scheduler.status(holder).map_or(true, |s| s.is_active())
            });
        let chain = match claimed {
            Ok(chain) => chain,
            Err(StateError::Busy(holder)) => return Err(ControllerError::Busy(holder)),
            Err(StateError::Halted(status)) => {
                tracing::warn!("Chain is {}, not starting an attempt", status.label());
                return Ok(AttemptOutcome::Halted(status));
            }
            Err(e) => return Err(e.into()),
        };
        let started_at = now_timestamp();
        tracing::info!(
            "Attempt {} {} at step {}/{}",
            chain.attempts,
            if resume { "resuming" } else { "starting" },
            before.step,
            target
        );

        let request = AttemptRequest {
            files: self.config.files.clone(),
            resume,
            target_steps: target,
            budget,
            stop_after: budget + self.config.safety_margin / 2,
        };
        let exit = match self.engine.run(&request).await {
            Ok(exit) => exit,
            Err(e) => {
                tracing::error!("Computation could not run: {}", e);
                AttemptExit {
                    code: None,
                    signal: None,
                    wallclock_stop: false,
                    stderr_tail: vec![e.to_string()],
                }
            }
        };

        let after = self.snapshot()?;
        let signal = classify(&before, &after, target, &exit);
        self.state.record_attempt(AttemptRecord {
            attempt: chain.attempts,
            job: own_job,
            signal: signal.clone(),
            step_before: before.step,
            step_after: after.step,
            exit_code: exit.code,
            started_at: Some(started_at),
            finished_at: now_timestamp(),
        })?;

        let resubmission = match &signal {
            TerminationSignal::Completed => {
                tracing::info!("Run complete at step {}/{}", after.step, target);
                None
            }
            TerminationSignal::Incomplete => {
                tracing::info!(
                    "Stopped at step {}/{} on the wall clock, continuing in a new job",
                    after.step,
                    target
                );
                Some(self.resubmit()?)
            }
            TerminationSignal::Failed(reason) => {
                tracing::error!("Attempt failed at step {}: {}", after.step, reason);
                None
            }
        };

        Ok(AttemptOutcome::Finished {
            signal,
            step: after.step,
            resubmission,
        })
    }

    /// Queue the next attempt, unless the run is complete or the chain was stopped.
    pub fn resubmit(&self) -> Result<Resubmission, ControllerError> {
        let snapshot = self.snapshot()?;
        if snapshot.is_complete(self.config.target_steps) {
            tracing::info!("Run State shows completion, not resubmitting");
            self.state.mark_completed(snapshot.step)?;
            return Ok(Resubmission::SkippedComplete);
        }

        let chain = self.state.load()?;
        if chain.status.is_halted() {
            tracing::info!("Chain is {}, not resubmitting", chain.status.label());
            return Ok(Resubmission::SkippedHalted(chain.status));
        }

        let submission = self.submission(true, self.scheduler.current_job());
        let job = match self.submit(&submission) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("Resubmission failed: {}", e);
                self.state
                    .update(|s| s.errors.push(format!("Resubmission failed: {e}")))?;
                return Err(e.into());
            }
        };
        if let Some(status) = self.record_submission(&job, true)? {
            return Ok(Resubmission::SkippedHalted(status));
        }
        tracing::info!("Resubmitted as job {}", job);
        Ok(Resubmission::Submitted(job))
    }

    /// Stop the chain: cancel the queued attempt and prevent further resubmission.
    ///
    /// With `include_running`, the attempt currently holding the Run State is
    /// cancelled through the scheduler as well, which signals mdrun to
    /// checkpoint and stop.
    pub fn cancel(&self, include_running: bool) -> Result<Vec<JobId>, ControllerError> {
        let running = self.state.load()?.current_job;
        let pending = self.state.mark_cancelled()?;

        let mut cancelled = Vec::new();
        let running = running.filter(|_| include_running);
        for job in [pending, running].into_iter().flatten() {
            if self.scheduler.status(&job)?.is_active() {
                self.scheduler.cancel(&job)?;
                cancelled.push(job);
            }
        }
        Ok(cancelled)
    }

    /// Operator reset after a failure or cancellation.
    pub fn reset(&self) -> Result<bool, ControllerError> {
        Ok(self.state.reset()?)
    }
}

/// Errors that stop the controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("required input {0} is missing")]
    MissingInput(PathBuf),
    #[error("another attempt (job {0}) holds the run state")]
    Busy(JobId),
    #[error("target step count changed from {recorded} to {configured}; reset the chain first")]
    TargetMismatch { recorded: u64, configured: u64 },
    #[error("safety margin leaves no time for the computation")]
    NoBudget,
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("run state error: {0}")]
    Progress(#[from] ProgressError),
}
