#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! mdchain
//!
//! Runs a GROMACS simulation pipeline on a batch cluster and carries the
//! production run across wall-clock limits by resubmitting itself until the
//! target step count is reached.

pub mod config;
pub mod controller;
pub mod job;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod scheduler;
pub mod state;

pub use config::HarnessConfig;
pub use controller::{AttemptOutcome, Controller, ControllerConfig, Resubmission, StartOutcome};
pub use pipeline::Pipeline;
pub use progress::{RunFiles, TerminationSignal};
pub use runner::{Engine, Mdrun};
pub use scheduler::{JobId, Scheduler, Slurm};
pub use state::{ChainStatus, StateManager};
