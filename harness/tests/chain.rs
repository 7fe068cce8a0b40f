//! Integration tests for the resubmission chain.
//!
//! These tests drive the controller against an in-memory scheduler and a fake
//! computation that advances the Run State by a fixed number of steps per
//! attempt, and verify that the chain:
//! 1. Converges to completion in the expected number of attempts
//! 2. Never submits once the target is reached or the chain is stopped
//! 3. Stops on failures instead of resubmitting

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fs::{self, OpenOptions},
    future::Future,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use mdchain_harness::{
    controller::{
        AttemptOutcome, Controller, ControllerConfig, ControllerError, Resubmission, StartOutcome,
    },
    job::{JobDescriptor, Resources, Submission, Walltime},
    progress::{
        AttemptExit, CHECKPOINT_MAGIC, FailureReason, RunFiles, TerminationSignal, read_progress,
    },
    runner::{AttemptRequest, Engine, EngineError},
    scheduler::{JobId, JobStatus, Scheduler, SchedulerError},
    state::{ChainStatus, StateManager},
};
use tempfile::{TempDir, tempdir};

#[derive(Default)]
struct Queue {
    next_id: u32,
    queued: VecDeque<(JobId, Submission)>,
    submitted: Vec<Submission>,
    cancelled: Vec<JobId>,
    running: HashSet<JobId>,
    current: Option<JobId>,
}

type Hook = Box<dyn FnOnce() + Send>;

/// Scheduler that keeps submissions in memory and dispatches them on demand.
#[derive(Default)]
struct FakeScheduler {
    queue: Mutex<Queue>,
    /// Runs once, right after the next submission was queued.
    on_submit: Mutex<Option<Hook>>,
}

impl FakeScheduler {
    /// Start the next queued job, making it the current one.
    fn dispatch(&self) -> Option<Submission> {
        let mut q = self.queue.lock().unwrap();
        let (id, submission) = q.queued.pop_front()?;
        q.current = Some(id);
        Some(submission)
    }

    fn submitted(&self) -> Vec<Submission> {
        self.queue.lock().unwrap().submitted.clone()
    }

    fn set_running(&self, id: &str) {
        self.queue.lock().unwrap().running.insert(JobId::from(id));
    }

    fn cancelled(&self) -> Vec<JobId> {
        self.queue.lock().unwrap().cancelled.clone()
    }

    fn queued(&self) -> usize {
        self.queue.lock().unwrap().queued.len()
    }

    fn after_next_submit(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_submit.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Scheduler for FakeScheduler {
    fn submit(
        &self,
        _job: &JobDescriptor,
        submission: &Submission,
        _workdir: &Path,
        _rust_log: Option<&str>,
    ) -> Result<JobId, SchedulerError> {
        let id = {
            let mut q = self.queue.lock().unwrap();
            q.next_id += 1;
            let id = JobId(format!("{}", 1000 + q.next_id));
            q.queued.push_back((id.clone(), submission.clone()));
            q.submitted.push(submission.clone());
            id
        };
        let hook = self.on_submit.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(id)
    }

    fn status(&self, id: &JobId) -> Result<JobStatus, SchedulerError> {
        let q = self.queue.lock().unwrap();
        if q.current.as_ref() == Some(id) || q.running.contains(id) {
            Ok(JobStatus::Running)
        } else if q.queued.iter().any(|(queued, _)| queued == id) {
            Ok(JobStatus::Pending)
        } else {
            Ok(JobStatus::Finished("COMPLETED".to_string()))
        }
    }

    fn cancel(&self, id: &JobId) -> Result<(), SchedulerError> {
        let mut q = self.queue.lock().unwrap();
        q.queued.retain(|(queued, _)| queued != id);
        q.cancelled.push(id.clone());
        Ok(())
    }

    fn current_job(&self) -> Option<JobId> {
        self.queue.lock().unwrap().current.clone()
    }
}

/// Computation that advances the step count by a fixed amount per attempt.
struct FakeEngine {
    increment: u64,
    exit_code: Mutex<Option<i32>>,
    runs: AtomicU32,
    /// Runs once, while the next attempt is computing.
    during_run: Mutex<Option<Hook>>,
}

impl FakeEngine {
    fn new(increment: u64) -> Self {
        Self {
            increment,
            exit_code: Mutex::new(None),
            runs: AtomicU32::new(0),
            during_run: Mutex::new(None),
        }
    }

    fn fail_with(&self, code: i32) {
        *self.exit_code.lock().unwrap() = Some(code);
    }

    fn during_next_run(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_run.lock().unwrap() = Some(Box::new(hook));
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    fn advance(&self, request: &AttemptRequest) -> AttemptExit {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let hook = self.during_run.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let files = &request.files;
        if let Some(code) = *self.exit_code.lock().unwrap() {
            return AttemptExit {
                code: Some(code),
                stderr_tail: vec!["Fatal error: simulated".to_string()],
                ..Default::default()
            };
        }

        let start = if request.resume {
            read_progress(&files.log).unwrap().unwrap_or(0)
        } else {
            0
        };
        let step = (start + self.increment).min(request.target_steps);
        write_log_step(&files.log, step);
        write_checkpoint(&files.checkpoint);

        AttemptExit {
            code: Some(0),
            wallclock_stop: step < request.target_steps,
            ..Default::default()
        }
    }
}

impl Engine for FakeEngine {
    fn run(
        &self,
        request: &AttemptRequest,
    ) -> impl Future<Output = Result<AttemptExit, EngineError>> + Send {
        let exit = self.advance(request);
        async move { Ok(exit) }
    }
}

fn write_log_step(log: &Path, step: u64) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .unwrap();
    writeln!(f, "           Step           Time").unwrap();
    writeln!(f, "{step:>15} {:>14.5}", step as f64 * 0.002).unwrap();
    writeln!(f, "Writing checkpoint, step {step} at Thu Oct 15 12:00:00 2026").unwrap();
}

fn write_checkpoint(path: &Path) {
    let mut bytes = CHECKPOINT_MAGIC.to_be_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 60]);
    fs::write(path, bytes).unwrap();
}

type TestController = Controller<Arc<FakeScheduler>, Arc<FakeEngine>>;

struct Chain {
    _dir: TempDir,
    workdir: PathBuf,
    scheduler: Arc<FakeScheduler>,
    engine: Arc<FakeEngine>,
    controller: TestController,
}

fn descriptor() -> JobDescriptor {
    JobDescriptor {
        name: "md-test".to_string(),
        walltime: Walltime::from_secs(3600),
        resources: Resources::default(),
        modules: Vec::new(),
        env: BTreeMap::new(),
        mdrun_args: Vec::new(),
        output: "mdchain-%j.out".to_string(),
    }
}

fn controller_for(
    workdir: &Path,
    target: u64,
    scheduler: &Arc<FakeScheduler>,
    engine: &Arc<FakeEngine>,
) -> TestController {
    let config = ControllerConfig {
        descriptor: descriptor(),
        command: vec!["mdchain".to_string(), "attempt".to_string()],
        files: RunFiles::new(workdir, "md"),
        target_steps: target,
        safety_margin: Duration::from_secs(600),
        workdir: workdir.to_path_buf(),
        rust_log: None,
    };
    Controller::new(
        config,
        Arc::clone(scheduler),
        Arc::clone(engine),
        StateManager::new(workdir.join("mdchain_state.json")),
    )
}

fn chain(target: u64, increment: u64) -> Chain {
    let dir = tempdir().unwrap();
    let workdir = dir.path().to_path_buf();
    fs::write(workdir.join("md.tpr"), b"tpr").unwrap();

    let scheduler = Arc::new(FakeScheduler::default());
    let engine = Arc::new(FakeEngine::new(increment));
    let controller = controller_for(&workdir, target, &scheduler, &engine);
    Chain {
        _dir: dir,
        workdir,
        scheduler,
        engine,
        controller,
    }
}

/// Run every queued job until the queue drains.
async fn drive(chain: &Chain) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();
    while let Some(submission) = chain.scheduler.dispatch() {
        outcomes.push(chain.controller.run_attempt(submission.resume).await.unwrap());
        assert!(outcomes.len() < 100, "chain did not converge");
    }
    outcomes
}

fn signals(outcomes: &[AttemptOutcome]) -> Vec<&'static str> {
    outcomes
        .iter()
        .filter_map(AttemptOutcome::signal)
        .map(TerminationSignal::label)
        .collect()
}

#[tokio::test]
async fn test_chain_converges() {
    let chain = chain(500_000_000, 100_000_000);

    assert!(matches!(
        chain.controller.start().unwrap(),
        StartOutcome::Submitted(_)
    ));
    let outcomes = drive(&chain).await;

    assert_eq!(outcomes.len(), 5);
    assert_eq!(
        signals(&outcomes),
        vec!["incomplete", "incomplete", "incomplete", "incomplete", "completed"]
    );
    assert!(chain.controller.is_complete().unwrap());

    let state = chain.controller.state_manager().load().unwrap();
    assert_eq!(state.status, ChainStatus::Completed);
    assert_eq!(state.attempts, 5);
    assert_eq!(state.resubmissions, 4);
    assert_eq!(state.last_step, Some(500_000_000));
    assert_eq!(state.pending_job, None);
}

#[tokio::test]
async fn test_short_chain_signals_and_dependencies() {
    let chain = chain(3, 1);
    chain.controller.start().unwrap();
    let outcomes = drive(&chain).await;

    assert_eq!(
        signals(&outcomes),
        vec!["incomplete", "incomplete", "completed"]
    );

    let submitted = chain.scheduler.submitted();
    assert_eq!(submitted.len(), 3);
    // the first attempt starts fresh, every continuation resumes after its predecessor
    assert!(!submitted[0].resume);
    assert_eq!(submitted[0].after, None);
    assert_eq!(submitted[1].after, Some(JobId::from("1001")));
    assert_eq!(submitted[2].after, Some(JobId::from("1002")));
    assert!(submitted[1..].iter().all(|s| s.resume));

    let history = chain.controller.state_manager().load().unwrap().history;
    let steps: Vec<(u64, u64)> = history
        .iter()
        .map(|r| (r.step_before, r.step_after))
        .collect();
    assert_eq!(steps, vec![(0, 1), (1, 2), (2, 3)]);
}

#[tokio::test]
async fn test_complete_run_is_a_noop() {
    let chain = chain(1000, 100);
    write_log_step(&chain.workdir.join("md.log"), 1000);
    write_checkpoint(&chain.workdir.join("md.cpt"));

    assert_eq!(
        chain.controller.start().unwrap(),
        StartOutcome::AlreadyComplete
    );
    assert!(chain.scheduler.submitted().is_empty());

    // a stray attempt does not run the computation either
    let outcome = chain.controller.run_attempt(true).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::AlreadyComplete { step: 1000 });
    assert_eq!(chain.engine.runs(), 0);
    assert!(chain.scheduler.submitted().is_empty());
    assert_eq!(
        chain.controller.state_manager().load().unwrap().status,
        ChainStatus::Completed
    );
}

#[tokio::test]
async fn test_failed_attempt_stops_chain() {
    let chain = chain(1000, 100);
    chain.controller.start().unwrap();
    chain.engine.fail_with(1);

    let outcomes = drive(&chain).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_failure());
    match outcomes[0].signal() {
        Some(TerminationSignal::Failed(FailureReason::ExternalTool { code, .. })) => {
            assert_eq!(*code, Some(1));
        }
        other => panic!("unexpected signal: {other:?}"),
    }
    assert_eq!(chain.scheduler.submitted().len(), 1);

    let state = chain.controller.state_manager().load().unwrap();
    assert_eq!(state.status, ChainStatus::Failed);
    assert_eq!(state.errors.len(), 1);

    // restarting needs an operator reset
    assert_eq!(
        chain.controller.start().unwrap(),
        StartOutcome::Halted(ChainStatus::Failed)
    );
    assert!(chain.controller.reset().unwrap());
    assert!(matches!(
        chain.controller.start().unwrap(),
        StartOutcome::Submitted(_)
    ));
}

#[tokio::test]
async fn test_resume_without_checkpoint_fails() {
    let chain = chain(1000, 100);
    write_log_step(&chain.workdir.join("md.log"), 300);

    let outcome = chain.controller.run_attempt(true).await.unwrap();
    assert_eq!(
        outcome.signal(),
        Some(&TerminationSignal::Failed(FailureReason::CheckpointMissing))
    );
    assert_eq!(chain.engine.runs(), 0);
    assert!(chain.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn test_resume_with_corrupt_checkpoint_fails() {
    let chain = chain(1000, 100);
    write_log_step(&chain.workdir.join("md.log"), 300);
    fs::write(chain.workdir.join("md.cpt"), b"not a checkpoint").unwrap();

    let outcome = chain.controller.run_attempt(true).await.unwrap();
    assert!(matches!(
        outcome.signal(),
        Some(TerminationSignal::Failed(
            FailureReason::CheckpointCorrupt { .. }
        ))
    ));
    assert_eq!(chain.engine.runs(), 0);
}

#[tokio::test]
async fn test_stalled_attempt_fails() {
    let chain = chain(1000, 0);
    write_log_step(&chain.workdir.join("md.log"), 300);
    write_checkpoint(&chain.workdir.join("md.cpt"));

    let outcome = chain.controller.run_attempt(true).await.unwrap();
    assert_eq!(
        outcome.signal(),
        Some(&TerminationSignal::Failed(FailureReason::Stalled {
            step: 300
        }))
    );
    assert!(chain.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let chain = chain(1000, 100);
    let StartOutcome::Submitted(job) = chain.controller.start().unwrap() else {
        panic!("expected a submission");
    };

    let cancelled = chain.controller.cancel(false).unwrap();
    assert_eq!(cancelled, vec![job]);

    assert!(drive(&chain).await.is_empty());
    assert_eq!(chain.engine.runs(), 0);

    // a job that slipped through the cancel does nothing
    let outcome = chain.controller.run_attempt(false).await.unwrap();
    assert_eq!(outcome, AttemptOutcome::Halted(ChainStatus::Cancelled));
    assert_eq!(chain.scheduler.submitted().len(), 1);
}

#[tokio::test]
async fn test_resubmit_skips_when_complete() {
    let chain = chain(1000, 100);
    write_log_step(&chain.workdir.join("md.log"), 1000);
    write_checkpoint(&chain.workdir.join("md.cpt"));

    assert_eq!(
        chain.controller.resubmit().unwrap(),
        Resubmission::SkippedComplete
    );
    assert!(chain.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn test_resubmit_skips_when_cancelled() {
    let chain = chain(1000, 100);
    chain.controller.cancel(false).unwrap();

    assert_eq!(
        chain.controller.resubmit().unwrap(),
        Resubmission::SkippedHalted(ChainStatus::Cancelled)
    );
    assert!(chain.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn test_cancel_while_attempt_runs() {
    let chain = chain(1000, 100);
    chain.controller.start().unwrap();
    let submission = chain.scheduler.dispatch().unwrap();

    // the operator cancels from another process while mdrun is computing
    let operator = controller_for(&chain.workdir, 1000, &chain.scheduler, &chain.engine);
    chain.engine.during_next_run(move || {
        assert!(operator.cancel(false).unwrap().is_empty());
    });

    let outcome = chain.controller.run_attempt(submission.resume).await.unwrap();
    assert_eq!(
        outcome,
        AttemptOutcome::Finished {
            signal: TerminationSignal::Incomplete,
            step: 100,
            resubmission: Some(Resubmission::SkippedHalted(ChainStatus::Cancelled)),
        }
    );
    assert_eq!(chain.scheduler.submitted().len(), 1);
    assert!(chain.scheduler.cancelled().is_empty());

    let state = chain.controller.state_manager().load().unwrap();
    assert_eq!(state.status, ChainStatus::Cancelled);
    assert_eq!(state.current_job, None);
    assert_eq!(state.pending_job, None);
    assert_eq!(state.last_step, Some(100));
}

#[tokio::test]
async fn test_cancel_during_resubmission_withdraws_job() {
    let chain = chain(1000, 100);
    let state_file = chain.workdir.join("mdchain_state.json");
    chain.scheduler.after_next_submit(move || {
        StateManager::new(state_file).mark_cancelled().unwrap();
    });

    let outcome = chain.controller.resubmit().unwrap();
    assert_eq!(outcome, Resubmission::SkippedHalted(ChainStatus::Cancelled));
    assert_eq!(chain.scheduler.submitted().len(), 1);
    assert_eq!(chain.scheduler.cancelled(), vec![JobId::from("1001")]);
    assert_eq!(chain.scheduler.queued(), 0);

    let state = chain.controller.state_manager().load().unwrap();
    assert_eq!(state.status, ChainStatus::Cancelled);
    assert_eq!(state.pending_job, None);
    assert_eq!(state.resubmissions, 0);
}

#[tokio::test]
async fn test_cancel_during_start_withdraws_job() {
    let chain = chain(1000, 100);
    let state_file = chain.workdir.join("mdchain_state.json");
    chain.scheduler.after_next_submit(move || {
        StateManager::new(state_file).mark_cancelled().unwrap();
    });

    assert_eq!(
        chain.controller.start().unwrap(),
        StartOutcome::Halted(ChainStatus::Cancelled)
    );
    assert_eq!(chain.scheduler.cancelled(), vec![JobId::from("1001")]);
    assert!(drive(&chain).await.is_empty());
    assert_eq!(chain.engine.runs(), 0);
}

#[tokio::test]
async fn test_start_does_not_submit_twice() {
    let chain = chain(1000, 100);
    let StartOutcome::Submitted(job) = chain.controller.start().unwrap() else {
        panic!("expected a submission");
    };
    assert_eq!(
        chain.controller.start().unwrap(),
        StartOutcome::AlreadyQueued(job)
    );
    assert_eq!(chain.scheduler.submitted().len(), 1);
}

#[tokio::test]
async fn test_concurrent_attempt_is_refused() {
    let chain = chain(1000, 100);
    chain
        .controller
        .state_manager()
        .begin_attempt(Some(&JobId::from("77")), 1000, 0, |_| true)
        .unwrap();
    chain.scheduler.set_running("77");

    let err = chain.controller.run_attempt(false).await.unwrap_err();
    assert!(matches!(err, ControllerError::Busy(ref id) if id.0 == "77"));
    assert_eq!(chain.engine.runs(), 0);
}

#[tokio::test]
async fn test_dead_holder_is_taken_over() {
    let chain = chain(1000, 100);
    chain
        .controller
        .state_manager()
        .begin_attempt(Some(&JobId::from("77")), 1000, 0, |_| true)
        .unwrap();

    let outcome = chain.controller.run_attempt(false).await.unwrap();
    assert_eq!(outcome.signal(), Some(&TerminationSignal::Incomplete));
    assert_eq!(chain.engine.runs(), 1);
}

#[tokio::test]
async fn test_missing_run_input() {
    let chain = chain(1000, 100);
    fs::remove_file(chain.workdir.join("md.tpr")).unwrap();

    let err = chain.controller.run_attempt(false).await.unwrap_err();
    assert!(matches!(err, ControllerError::MissingInput(ref p) if p.ends_with("md.tpr")));
    assert_eq!(
        chain.controller.state_manager().load().unwrap().status,
        ChainStatus::Failed
    );
}

#[tokio::test]
async fn test_target_change_is_rejected() {
    let chain = chain(1000, 100);
    chain.controller.run_attempt(false).await.unwrap();

    let other = controller_for(&chain.workdir, 2000, &chain.scheduler, &chain.engine);
    let err = other.run_attempt(true).await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::TargetMismatch {
            recorded: 1000,
            configured: 2000
        }
    ));
}
