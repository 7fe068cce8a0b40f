//! Run State inspection: checkpoint validity, logged progress, and the
//! classification of a finished attempt.
//!
//! Everything here reads files written by `mdrun` and never modifies them.

use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use mdchain_config::Stage;
use serde::{Deserialize, Serialize};

/// First XDR integer of every GROMACS checkpoint file.
pub const CHECKPOINT_MAGIC: i32 = 171_817;

/// Files that make up the Run State of one `-deffnm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    pub tpr: PathBuf,
    pub checkpoint: PathBuf,
    pub log: PathBuf,
}

impl RunFiles {
    #[must_use]
    pub fn new(workdir: impl AsRef<Path>, deffnm: &str) -> Self {
        let dir = workdir.as_ref();
        Self {
            tpr: dir.join(format!("{deffnm}.tpr")),
            checkpoint: dir.join(format!("{deffnm}.cpt")),
            log: dir.join(format!("{deffnm}.log")),
        }
    }

    /// Files of the production run in `workdir`.
    #[must_use]
    pub fn production(workdir: impl AsRef<Path>) -> Self {
        Self::new(workdir, Stage::Production.deffnm().unwrap_or("md"))
    }

    /// Read the current Run State.
    pub fn snapshot(&self) -> Result<RunStateSnapshot, ProgressError> {
        Ok(RunStateSnapshot {
            step: read_progress(&self.log)?.unwrap_or(0),
            checkpoint: CheckpointState::inspect(&self.checkpoint)?,
        })
    }
}

/// Usability of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Missing,
    Corrupt(String),
    Valid { bytes: u64 },
}

impl CheckpointState {
    /// A checkpoint is valid when it carries the GROMACS magic header.
    pub fn inspect(path: &Path) -> Result<Self, ProgressError> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::Missing),
            Err(e) => return Err(ProgressError::Io(path.to_path_buf(), e)),
        };
        let bytes = file
            .metadata()
            .map_err(|e| ProgressError::Io(path.to_path_buf(), e))?
            .len();
        if bytes < 8 {
            return Ok(Self::Corrupt(format!("truncated ({bytes} bytes)")));
        }

        let mut header = [0u8; 4];
        file.read_exact(&mut header)
            .map_err(|e| ProgressError::Io(path.to_path_buf(), e))?;
        let magic = i32::from_be_bytes(header);
        if magic != CHECKPOINT_MAGIC {
            return Ok(Self::Corrupt(format!("bad magic number {magic}")));
        }
        Ok(Self::Valid { bytes })
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Highest integration step recorded in an `mdrun` log.
///
/// Steps come from energy blocks (a `Step Time` header followed by the values
/// line) and from `Writing checkpoint, step N` lines. Returns `None` when the
/// log does not exist yet.
pub fn read_progress(log: &Path) -> Result<Option<u64>, ProgressError> {
    let file = match File::open(log) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ProgressError::Io(log.to_path_buf(), e)),
    };

    let mut max_step: Option<u64> = None;
    let mut after_header = false;
    for line in BufReader::new(file).lines() {
        // mdrun may be mid-write; a torn last line is not an error
        let Ok(line) = line else { break };
        let trimmed = line.trim();

        let step = if after_header {
            after_header = false;
            trimmed
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<u64>().ok())
        } else if let Some(rest) = trimmed.strip_prefix("Writing checkpoint, step ") {
            rest.split_whitespace()
                .next()
                .and_then(|s| s.parse::<u64>().ok())
        } else {
            let mut words = trimmed.split_whitespace();
            after_header = words.next() == Some("Step") && words.next() == Some("Time");
            None
        };

        if let Some(step) = step {
            max_step = Some(max_step.map_or(step, |m| m.max(step)));
        }
    }
    Ok(max_step)
}

/// The Run State at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStateSnapshot {
    pub step: u64,
    pub checkpoint: CheckpointState,
}

impl RunStateSnapshot {
    /// Completion check: the logged step count reached the target.
    #[must_use]
    pub fn is_complete(&self, target_steps: u64) -> bool {
        self.step >= target_steps
    }
}

/// How the computation process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptExit {
    pub code: Option<i32>,
    /// Signal that terminated the process, if it did not exit on its own.
    pub signal: Option<i32>,
    /// The stop was caused by the wall-clock budget rather than a failure.
    pub wallclock_stop: bool,
    /// Last lines of the process's stderr.
    pub stderr_tail: Vec<String>,
}

impl AttemptExit {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }

    /// The process stopped for a reason other than a computation error.
    #[must_use]
    pub fn is_clean_stop(&self) -> bool {
        self.succeeded() || self.wallclock_stop
    }
}

/// Why a chain stopped without reaching its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
    ExternalTool { code: Option<i32>, detail: String },
    CheckpointMissing,
    CheckpointCorrupt { reason: String },
    Stalled { step: u64 },
    MissingInput { path: PathBuf },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExternalTool { code, detail } => match code {
                Some(code) => write!(f, "mdrun exited with code {code}: {detail}"),
                None => write!(f, "mdrun was killed: {detail}"),
            },
            Self::CheckpointMissing => write!(f, "no checkpoint to resume from"),
            Self::CheckpointCorrupt { reason } => write!(f, "checkpoint is corrupt: {reason}"),
            Self::Stalled { step } => write!(f, "attempt made no progress past step {step}"),
            Self::MissingInput { path } => write!(f, "missing input {}", path.display()),
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationSignal {
    /// Target step count reached.
    Completed,
    /// Stopped by the wall clock with a usable checkpoint.
    Incomplete,
    /// Terminal for the chain.
    Failed(FailureReason),
}

impl TerminationSignal {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Failed(_) => "failed",
        }
    }
}

/// Classify a finished attempt from the Run State before and after it.
#[must_use]
pub fn classify(
    before: &RunStateSnapshot,
    after: &RunStateSnapshot,
    target_steps: u64,
    exit: &AttemptExit,
) -> TerminationSignal {
    if after.is_complete(target_steps) {
        return TerminationSignal::Completed;
    }

    if !exit.is_clean_stop() {
        let detail = exit
            .stderr_tail
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| match exit.signal {
                Some(sig) => format!("terminated by signal {sig}"),
                None => "no error output".to_string(),
            });
        return TerminationSignal::Failed(FailureReason::ExternalTool {
            code: exit.code,
            detail,
        });
    }

    match &after.checkpoint {
        CheckpointState::Missing => TerminationSignal::Failed(FailureReason::CheckpointMissing),
        CheckpointState::Corrupt(reason) => {
            TerminationSignal::Failed(FailureReason::CheckpointCorrupt {
                reason: reason.clone(),
            })
        }
        CheckpointState::Valid { .. } if after.step <= before.step => {
            TerminationSignal::Failed(FailureReason::Stalled { step: after.step })
        }
        CheckpointState::Valid { .. } => TerminationSignal::Incomplete,
    }
}

/// Errors that can occur while reading the Run State.
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
