//! Subprocess execution for the long-running computation.

use std::{
    collections::VecDeque, future::Future, path::Path, process::Stdio, sync::Arc, time::Duration,
};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::{
    fs::OpenOptions,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
};

use crate::{
    progress::{AttemptExit, RunFiles},
    state::now_timestamp,
};

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL: usize = 20;

/// What one attempt of the computation is asked to do.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub files: RunFiles,
    /// Continue from `files.checkpoint`.
    pub resume: bool,
    pub target_steps: u64,
    /// Time the computation may use before stopping on its own.
    pub budget: Duration,
    /// Point after which the process is signalled to checkpoint and stop.
    pub stop_after: Duration,
}

/// The external computation boundary.
pub trait Engine {
    fn run(
        &self,
        request: &AttemptRequest,
    ) -> impl Future<Output = Result<AttemptExit, EngineError>> + Send;
}

impl<T: Engine> Engine for Arc<T> {
    fn run(
        &self,
        request: &AttemptRequest,
    ) -> impl Future<Output = Result<AttemptExit, EngineError>> + Send {
        (**self).run(request)
    }
}

/// Parse a `step N, will finish ...` progress line from mdrun's stderr.
fn parse_step(line: &str) -> Option<u64> {
    line.trim()
        .strip_prefix("step ")?
        .split(|c: char| c == ',' || c.is_whitespace())
        .next()?
        .parse()
        .ok()
}

/// `gmx mdrun` as the computation.
pub struct Mdrun {
    /// Path to the gmx binary.
    gmx_binary: String,
    /// Extra arguments for every invocation.
    extra_args: Vec<String>,
    /// `OMP_NUM_THREADS` for the child.
    omp_threads: Option<u32>,
    /// Time between SIGTERM and SIGKILL.
    term_grace: Duration,
    /// Display the attempt's progress bar is drawn in.
    multi: MultiProgress,
}

impl Mdrun {
    /// Create a new runner.
    #[must_use]
    pub fn new(
        gmx_binary: impl Into<String>,
        extra_args: Vec<String>,
        omp_threads: Option<u32>,
        term_grace: Duration,
    ) -> Self {
        Self {
            gmx_binary: gmx_binary.into(),
            extra_args,
            omp_threads,
            term_grace,
            multi: MultiProgress::new(),
        }
    }

    /// Draw progress bars into an existing display.
    #[must_use]
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = multi;
        self
    }

    /// Step counter for one attempt, registered with the display.
    fn progress_bar(&self, target: u64) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(target));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] mdrun [{wide_bar:.cyan/blue}] {pos:>10}/{len:10} ({percent:>2}%)")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#*-"),
        );
        pb
    }

    /// Build the `mdrun` argument list for a request.
    #[must_use]
    pub fn args(&self, request: &AttemptRequest) -> Vec<String> {
        let deffnm = request.files.log.with_extension("");
        let mut args = vec![
            "mdrun".to_string(),
            "-s".to_string(),
            request.files.tpr.display().to_string(),
            "-deffnm".to_string(),
            deffnm.display().to_string(),
            "-nsteps".to_string(),
            request.target_steps.to_string(),
            "-maxh".to_string(),
            format!("{:.4}", request.budget.as_secs_f64() / 3600.0),
        ];
        if request.resume {
            args.push("-cpi".to_string());
            args.push(request.files.checkpoint.display().to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Spawn mdrun as a subprocess.
    fn spawn(&self, request: &AttemptRequest) -> Result<Child, EngineError> {
        let args = self.args(request);
        tracing::debug!("Spawning: {} {}", self.gmx_binary, args.join(" "));

        let workdir = request.files.tpr.parent().unwrap_or_else(|| Path::new("."));
        let mut cmd = Command::new(&self.gmx_binary);
        cmd.args(&args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(threads) = self.omp_threads {
            cmd.env("OMP_NUM_THREADS", threads.to_string());
        }
        cmd.spawn().map_err(|e| EngineError::Spawn(self.gmx_binary.clone(), e))
    }
}

/// Append a stream to a log file, returning the last lines seen.
///
/// mdrun redraws its progress line with `\r`, so segments are split on both
/// carriage returns and newlines.
async fn drain<R>(
    stream: R,
    path: std::path::PathBuf,
    separator: String,
    progress: Option<ProgressBar>,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(stream).split(b'\r');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .ok();

    if let Some(ref mut f) = file
        && f.metadata().await.is_ok_and(|m| m.len() > 0)
    {
        let _ = f.write_all(separator.as_bytes()).await;
    }

    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    while let Ok(Some(segment)) = segments.next_segment().await {
        let text = String::from_utf8_lossy(&segment);
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            if let Some(ref mut f) = file {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
            }
            if let Some(ref pb) = progress
                && let Some(step) = parse_step(line)
            {
                pb.set_position(step);
            }
            if tail.len() >= STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }
    tail.into_iter().collect()
}

fn send_signal(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        // SAFETY: kill only delivers a signal to the child we spawned
        unsafe { libc::kill(pid as i32, signal) };
    }
}

impl Engine for Mdrun {
    fn run(
        &self,
        request: &AttemptRequest,
    ) -> impl Future<Output = Result<AttemptExit, EngineError>> + Send {
        let spawned = self.spawn(request);
        let stop_after = request.stop_after;
        let term_grace = self.term_grace;
        let pb = self.progress_bar(request.target_steps);
        let deffnm = request.files.log.with_extension("");

        async move {
            let mut child = match spawned {
                Ok(child) => child,
                Err(e) => {
                    pb.finish_and_clear();
                    return Err(e);
                }
            };
            let pid = child.id();
            tracing::info!(
                "Started mdrun (PID {}) for up to {:.2}h",
                pid.unwrap_or_default(),
                stop_after.as_secs_f64() / 3600.0
            );

            let separator = format!("\n--- attempt at {} ---\n\n", now_timestamp());
            let stdout_task = child.stdout.take().map(|stdout| {
                tokio::spawn(drain(
                    stdout,
                    deffnm.with_extension("stdout.log"),
                    separator.clone(),
                    None,
                ))
            });
            let stderr_task = child.stderr.take().map(|stderr| {
                tokio::spawn(drain(
                    stderr,
                    deffnm.with_extension("stderr.log"),
                    separator.clone(),
                    Some(pb.clone()),
                ))
            });

            // mdrun normally stops itself through -maxh; the guard covers the case
            // where it cannot reach a checkpoint boundary in time.
            let mut wallclock_stop = false;
            let status = tokio::select! {
                status = child.wait() => status,
                () = tokio::time::sleep(stop_after) => {
                    tracing::warn!("mdrun still running after {:?}, sending SIGTERM", stop_after);
                    wallclock_stop = true;
                    send_signal(pid, libc::SIGTERM);
                    tokio::select! {
                        status = child.wait() => status,
                        () = tokio::time::sleep(term_grace) => {
                            tracing::error!("mdrun ignored SIGTERM for {:?}, killing", term_grace);
                            send_signal(pid, libc::SIGKILL);
                            child.wait().await
                        }
                    }
                }
            };
            let status = status.map_err(EngineError::Wait)?;

            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            let stderr_tail = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            pb.finish_and_clear();

            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&status);
            #[cfg(not(unix))]
            let signal = None;

            Ok(AttemptExit {
                code: status.code(),
                signal,
                wallclock_stop,
                stderr_tail,
            })
        }
    }
}

/// Errors that can occur when running the computation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to wait for mdrun: {0}")]
    Wait(std::io::Error),
}
