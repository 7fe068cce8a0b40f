//! mdchain CLI
//!
//! Runs the GROMACS pipeline stages and drives the self-resubmitting
//! production chain on SLURM.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use mdchain_config::Stage;
use mdchain_harness::{
    config::HarnessConfig,
    controller::{AttemptOutcome, Controller, ControllerConfig, Resubmission, StartOutcome},
    pipeline::Pipeline,
    progress::{CheckpointState, TerminationSignal},
    runner::Mdrun,
    scheduler::Slurm,
    state::StateManager,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mdchain", about = "GROMACS pipeline and self-resubmitting production runs")]
struct Cli {
    /// Path to mdchain.toml config file
    #[arg(short, long, global = true, default_value = "mdchain.toml")]
    config: PathBuf,

    /// Override a config value (e.g. --set md.md_steps=1000000)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline stage locally
    Stage {
        stage: Stage,

        /// Starting structure for the prepare stage
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Run prepare through production setup, then start the chain
    Pipeline {
        /// Starting structure for the prepare stage
        #[arg(long)]
        input: Option<PathBuf>,

        /// Stop after production setup without submitting
        #[arg(long)]
        no_submit: bool,
    },

    /// Submit the first production attempt
    Submit,

    /// Run one production attempt (the entry point of every scheduled job)
    Attempt {
        /// Continue from the existing checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// Check the production run against its target
    Check,

    /// Show the chain state and attempt history
    Status,

    /// Stop the chain
    Cancel {
        /// Also cancel the attempt that is currently running
        #[arg(long)]
        running: bool,
    },

    /// Make a failed or cancelled chain startable again
    Reset,
}

/// Command line every scheduled attempt is started with.
fn attempt_command(config: &Path, overrides: &[String]) -> std::io::Result<Vec<String>> {
    let exe = std::env::current_exe()?;
    let config = std::fs::canonicalize(config)?;

    let mut command = vec![
        exe.display().to_string(),
        "--config".to_string(),
        config.display().to_string(),
    ];
    for spec in overrides {
        command.push("--set".to_string());
        command.push(spec.clone());
    }
    command.push("attempt".to_string());
    Ok(command)
}

fn controller(
    config: &HarnessConfig,
    config_path: &Path,
    overrides: &[String],
) -> Result<Controller<Slurm, Mdrun>, Box<dyn std::error::Error>> {
    let command = attempt_command(config_path, overrides)?;
    if !Slurm::is_available() {
        tracing::warn!("sbatch not found on PATH, submissions will fail");
    }
    let engine = Mdrun::new(
        &config.harness.gmx_binary,
        config.job.mdrun_args.clone(),
        config.job.resources.cpus_per_task,
        Duration::from_secs(config.harness.term_grace_secs),
    );
    Ok(Controller::new(
        ControllerConfig::from_harness(config, command),
        Slurm::new(config.script_dir()),
        engine,
        StateManager::new(config.state_file()),
    ))
}

fn print_start(outcome: &StartOutcome) {
    match outcome {
        StartOutcome::AlreadyComplete => println!("Production run already complete."),
        StartOutcome::AlreadyQueued(job) => println!("Job {job} is already queued or running."),
        StartOutcome::Halted(status) => {
            println!(
                "Chain is {}. Run `mdchain reset` before submitting again.",
                status.label()
            );
        }
        StartOutcome::Submitted(job) => println!("Submitted job {job}"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();
    let config = HarnessConfig::load(&cli.config, &cli.overrides)?;

    match cli.command {
        Commands::Stage { stage, input } => {
            let mut pipeline = Pipeline::from_config(&config);
            if let Some(input) = input {
                pipeline = pipeline.with_input(input);
            }
            pipeline.run(stage).await?;
        }

        Commands::Pipeline { input, no_submit } => {
            let mut pipeline = Pipeline::from_config(&config);
            if let Some(input) = input {
                pipeline = pipeline.with_input(input);
            }
            let mut stage = Some(Stage::Prepare);
            while let Some(current) = stage.filter(|s| *s != Stage::Analysis) {
                pipeline.run(current).await?;
                stage = current.next();
            }

            if no_submit {
                println!("Production input ready. Submit with `mdchain submit`.");
            } else {
                let controller = controller(&config, &cli.config, &cli.overrides)?;
                print_start(&controller.start()?);
            }
        }

        Commands::Submit => {
            let controller = controller(&config, &cli.config, &cli.overrides)?;
            print_start(&controller.start()?);
        }

        Commands::Attempt { resume } => {
            let controller = controller(&config, &cli.config, &cli.overrides)?;
            let outcome = controller.run_attempt(resume).await?;
            match &outcome {
                AttemptOutcome::AlreadyComplete { step } => {
                    println!("Already complete at step {step}");
                }
                AttemptOutcome::Halted(status) => {
                    println!("Chain is {}, nothing to do", status.label());
                }
                AttemptOutcome::Finished {
                    signal,
                    step,
                    resubmission,
                } => {
                    println!("Attempt {} at step {step}", signal.label());
                    match resubmission {
                        Some(Resubmission::Submitted(job)) => println!("Next attempt: job {job}"),
                        Some(Resubmission::SkippedComplete) => {
                            println!("Run completed meanwhile, not resubmitted");
                        }
                        Some(Resubmission::SkippedHalted(status)) => {
                            println!("Chain is {}, not resubmitted", status.label());
                        }
                        None => {}
                    }
                }
            }
            if outcome.is_failure() {
                return Err(format!("attempt failed: {}", signal_detail(&outcome)).into());
            }
        }

        Commands::Check => {
            let controller = controller(&config, &cli.config, &cli.overrides)?;
            let snapshot = controller.snapshot()?;
            let target = controller.config().target_steps;
            println!("Step: {} / {}", snapshot.step, target);
            match &snapshot.checkpoint {
                CheckpointState::Missing => println!("Checkpoint: missing"),
                CheckpointState::Corrupt(reason) => println!("Checkpoint: corrupt ({reason})"),
                CheckpointState::Valid { bytes } => println!("Checkpoint: valid ({bytes} bytes)"),
            }
            println!(
                "Complete: {}",
                if snapshot.is_complete(target) { "yes" } else { "no" }
            );
        }

        Commands::Status => {
            let state = StateManager::new(config.state_file()).load()?;

            println!("=== Chain Status ===");
            println!();
            print!("{}", state.status.label());
            if let Some(step) = state.last_step {
                print!(" [step {step}");
                if let Some(target) = state.target_steps {
                    print!(" / {target}");
                }
                print!("]");
            }
            println!(
                " [attempts: {}, resubmissions: {}]",
                state.attempts, state.resubmissions
            );
            if let Some(job) = &state.current_job {
                println!("Running: job {job}");
            }
            if let Some(job) = &state.pending_job {
                println!("Queued: job {job}");
            }

            if !state.history.is_empty() {
                println!();
                for record in &state.history {
                    println!(
                        "  #{} job {}: {} ({} -> {}) finished {}",
                        record.attempt,
                        record
                            .job
                            .as_ref()
                            .map_or_else(|| "-".to_string(), ToString::to_string),
                        record.signal.label(),
                        record.step_before,
                        record.step_after,
                        record.finished_at
                    );
                }
            }

            for error in &state.errors {
                println!("  Error: {error}");
            }
        }

        Commands::Cancel { running } => {
            let controller = controller(&config, &cli.config, &cli.overrides)?;
            let cancelled = controller.cancel(running)?;
            if cancelled.is_empty() {
                println!("Chain cancelled, no active jobs");
            }
            for job in cancelled {
                println!("Cancelled job {job}");
            }
        }

        Commands::Reset => {
            let state = StateManager::new(config.state_file());
            if state.reset()? {
                println!("Chain reset");
            } else {
                println!("Chain is not failed or cancelled, nothing to reset");
            }
        }
    }

    Ok(())
}

fn signal_detail(outcome: &AttemptOutcome) -> String {
    match outcome.signal() {
        Some(TerminationSignal::Failed(reason)) => reason.to_string(),
        Some(signal) => signal.label().to_string(),
        None => String::new(),
    }
}
