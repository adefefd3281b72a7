//! Cron scheduler for the collect → transform pipeline.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

mod process;
mod run_log;

pub use process::{CommandRunner, ExecutionResult, ProcessRunner, StageCommand};
pub use run_log::{format_line, SchedulerLog, LOG_FILE_NAME};

pub const CRATE_NAME: &str = "pickly-scheduler";

pub const DEFAULT_SCHEDULE: &str = "0 3 * * *";
pub const COLLECT_LABEL: &str = "API Collection";
pub const TRANSFORM_LABEL: &str = "Data Transformation";

const DEFAULT_TRANSFORM_CMD: &str = "npm run transform:api";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Appended to `schedule --help`.
pub const SCHEDULE_HELP: &str = "\
CRON SCHEDULE FORMAT:
  ┌───────────── minute (0 - 59)
  │ ┌───────────── hour (0 - 23)
  │ │ ┌───────────── day of month (1 - 31)
  │ │ │ ┌───────────── month (1 - 12)
  │ │ │ │ ┌───────────── day of week (0 - 6) (Sunday to Saturday)
  │ │ │ │ │
  * * * * *

  A sixth leading field is read as seconds.

COMMON SCHEDULES:
  \"0 3 * * *\"     Daily at 3:00 AM (default)
  \"0 */6 * * *\"   Every 6 hours
  \"0 0 * * 0\"     Every Sunday at midnight
  \"*/30 * * * *\"  Every 30 minutes

WORKFLOW:
  1. Collect announcements (PICKLY_COLLECT_CMD, default: pickly fetch)
  2. Transform raw data (PICKLY_TRANSFORM_CMD, default: npm run transform:api)
  3. Append results to <PICKLY_LOG_DIR>/scheduler.log";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron schedule '{expr}': {source}")]
    InvalidSchedule {
        expr: String,
        #[source]
        source: JobSchedulerError,
    },
    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Config(String),
}

/// Progress of one scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    NotStarted,
    CollectRunning,
    CollectFailed,
    TransformRunning,
    Completed,
    PartiallyCompleted,
    Simulated,
    Cancelled,
}

impl PipelineState {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Completed | Self::Simulated)
    }
}

/// Expand the 5-field form to the seconds-first form the cron parser expects.
pub fn normalize_schedule(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

/// Validate `expr`, returning the normalized form. Schedules are read in the host's local time zone.
pub fn validate_schedule(expr: &str) -> Result<String, SchedulerError> {
    let normalized = normalize_schedule(expr);
    Job::new_async_tz(normalized.as_str(), Local, |_uuid, _l| Box::pin(async {})).map_err(
        |source| SchedulerError::InvalidSchedule {
            expr: expr.to_string(),
            source,
        },
    )?;
    Ok(normalized)
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workdir: PathBuf,
    pub log_dir: PathBuf,
    pub collect: StageCommand,
    pub transform: StageCommand,
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::from_vars(|var| std::env::var(var).ok())
    }

    /// Resolve the configuration from `lookup`, which maps a variable name to its value.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SchedulerError> {
        let (workdir, log_dir) = directories(&lookup);

        let collect = match lookup("PICKLY_COLLECT_CMD") {
            Some(line) => parse_stage(COLLECT_LABEL, "PICKLY_COLLECT_CMD", &line)?,
            None => {
                let exe = std::env::current_exe()?;
                StageCommand::new(COLLECT_LABEL, exe.display().to_string(), ["fetch"])
            }
        };
        let transform_line =
            lookup("PICKLY_TRANSFORM_CMD").unwrap_or_else(|| DEFAULT_TRANSFORM_CMD.to_string());
        let transform = parse_stage(TRANSFORM_LABEL, "PICKLY_TRANSFORM_CMD", &transform_line)?;

        Ok(Self {
            workdir,
            log_dir,
            collect,
            transform,
        })
    }
}

/// `(workdir, log_dir)`. Never fails, so the log can be opened before anything else is parsed.
fn directories(lookup: impl Fn(&str) -> Option<String>) -> (PathBuf, PathBuf) {
    let workdir = lookup("PICKLY_WORKDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let log_dir = lookup("PICKLY_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| workdir.join("logs"));
    (workdir, log_dir)
}

fn parse_stage(label: &str, var: &str, line: &str) -> Result<StageCommand, SchedulerError> {
    StageCommand::parse(label, line).ok_or_else(|| SchedulerError::Config(format!("{var} is empty")))
}

/// Runs the two-stage job, at most one at a time.
pub struct JobRunner {
    collect: StageCommand,
    transform: StageCommand,
    runner: Arc<dyn CommandRunner>,
    log: Arc<SchedulerLog>,
    dry_run: bool,
    running: AtomicBool,
    cancel: CancellationToken,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobRunner {
    pub fn new(
        collect: StageCommand,
        transform: StageCommand,
        runner: Arc<dyn CommandRunner>,
        log: Arc<SchedulerLog>,
        dry_run: bool,
    ) -> Self {
        Self {
            collect,
            transform,
            runner,
            log,
            dry_run,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop any in-flight stage; later triggers start cancelled too.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait up to `grace` for an in-flight job to wind down. Returns whether it did.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.is_running() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }

    /// Run the job unless one is already running. `None` means the trigger was skipped.
    pub async fn trigger(&self) -> Option<PipelineState> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log.write("Skipped trigger: previous job still running");
            return None;
        }
        let _guard = RunningGuard(&self.running);
        let state = self.execute().instrument(info_span!("scheduled_job")).await;
        info!(?state, "scheduled job finished");
        Some(state)
    }

    async fn execute(&self) -> PipelineState {
        let started = Instant::now();
        self.log.write(format!(
            "======= Scheduled Job Started (Dry Run: {}) =======",
            self.dry_run
        ));

        if self.dry_run {
            println!("[DRY RUN] Would execute:");
            println!("  1. {}", self.collect.display());
            println!("  2. {}", self.transform.display());
            self.log.write("DRY RUN: Simulated execution only");
            self.log.write("======= Scheduled Job Completed (Dry Run) =======");
            return PipelineState::Simulated;
        }

        let mut state = PipelineState::CollectRunning;
        let collect = self.runner.run(&self.collect, &self.cancel).await;
        if collect.cancelled {
            return self.cancelled(state);
        }
        if !collect.success {
            self.log_stage_failure(&self.collect, &collect);
            self.log.write("======= Scheduled Job Failed =======");
            return PipelineState::CollectFailed;
        }
        self.log_stage_success(&self.collect, &collect);

        state = PipelineState::TransformRunning;
        let transform = self.runner.run(&self.transform, &self.cancel).await;
        if transform.cancelled {
            return self.cancelled(state);
        }
        if !transform.success {
            self.log_stage_failure(&self.transform, &transform);
            self.log.write("======= Scheduled Job Partially Completed =======");
            return PipelineState::PartiallyCompleted;
        }
        self.log_stage_success(&self.transform, &transform);

        self.log.write(format!(
            "SUCCESS: Total execution time {:.2}s",
            started.elapsed().as_secs_f64()
        ));
        self.log.write("======= Scheduled Job Completed Successfully =======");
        PipelineState::Completed
    }

    fn log_stage_success(&self, stage: &StageCommand, result: &ExecutionResult) {
        self.log.write(format!(
            "SUCCESS: {} completed in {:.2}s",
            stage.label,
            result.duration.as_secs_f64()
        ));
    }

    fn log_stage_failure(&self, stage: &StageCommand, result: &ExecutionResult) {
        self.log.write(format!(
            "ERROR: {} failed with exit code {}",
            stage.label,
            result.exit_code_display()
        ));
        self.log.write(format!("STDERR: {}", result.stderr.trim_end()));
    }

    fn cancelled(&self, during: PipelineState) -> PipelineState {
        warn!(?during, "scheduled job cancelled");
        self.log.write("======= Scheduled Job Cancelled =======");
        PipelineState::Cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl StopSignal {
    fn log_message(self) -> &'static str {
        match self {
            Self::Interrupt => "Scheduler stopped by user (SIGINT)",
            Self::Terminate => "Scheduler stopped (SIGTERM)",
        }
    }
}

/// Resolves on SIGINT or (on unix) SIGTERM. Never resolves if no handler can be installed.
pub async fn shutdown_signal() -> StopSignal {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return StopSignal::Interrupt,
                    _ = term.recv() => return StopSignal::Terminate,
                }
            }
            Err(err) => warn!(error = %err, "cannot listen for SIGTERM"),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => StopSignal::Interrupt,
        Err(err) => {
            warn!(error = %err, "cannot listen for SIGINT");
            std::future::pending().await
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub schedule: String,
    pub dry_run: bool,
    pub now: bool,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_SCHEDULE.to_string(),
            dry_run: false,
            now: false,
        }
    }
}

/// How a scheduler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    Stopped(StopSignal),
    Immediate {
        state: PipelineState,
        interrupted: Option<StopSignal>,
    },
}

impl SchedulerExit {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Stopped(_) => 0,
            Self::Immediate { state, .. } => u8::from(!state.is_success()),
        }
    }
}

/// Run the job once, cancelling it if `shutdown` fires first.
pub async fn run_immediate(
    runner: &JobRunner,
    log: &SchedulerLog,
    shutdown: impl Future<Output = StopSignal>,
) -> SchedulerExit {
    let job = runner.trigger();
    tokio::pin!(job);
    tokio::pin!(shutdown);

    let early = tokio::select! {
        state = &mut job => Ok(state),
        signal = &mut shutdown => Err(signal),
    };
    let (state, interrupted) = match early {
        Ok(state) => (state, None),
        Err(signal) => {
            runner.cancel();
            let state = job.await;
            log.write(signal.log_message());
            (state, Some(signal))
        }
    };
    SchedulerExit::Immediate {
        state: state.unwrap_or(PipelineState::NotStarted),
        interrupted,
    }
}

fn scheduled_job<TZ>(
    normalized: &str,
    timezone: TZ,
    runner: Arc<JobRunner>,
) -> Result<Job, JobSchedulerError>
where
    TZ: TimeZone + Send + Sync + 'static,
    TZ::Offset: Send + Sync,
{
    Job::new_async_tz(normalized, timezone, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            info!("cron trigger fired");
            runner.trigger().await;
        })
    })
}

/// Arm the cron job and block until `shutdown` resolves.
pub async fn run_daemon(
    runner: Arc<JobRunner>,
    log: Arc<SchedulerLog>,
    schedule: &str,
    shutdown: impl Future<Output = StopSignal>,
) -> Result<SchedulerExit, SchedulerError> {
    let normalized = validate_schedule(schedule)?;

    let mut sched = JobScheduler::new().await?;
    let job = scheduled_job(&normalized, Local, runner.clone()).map_err(|source| {
        SchedulerError::InvalidSchedule {
            expr: schedule.to_string(),
            source,
        }
    })?;
    let job_id = sched.add(job).await?;
    sched.start().await?;

    log.write(format!("Scheduler started with schedule: {schedule}"));
    match sched.next_tick_for_job(job_id).await {
        Ok(Some(next)) => println!(
            "Next execution: {}",
            next.with_timezone(&Local).to_rfc3339()
        ),
        Ok(None) => println!("Next execution: unknown"),
        Err(err) => warn!(error = %err, "could not compute next execution time"),
    }
    println!("Logs: {}", log.path().display());
    println!("Press Ctrl+C to stop the scheduler");

    let signal = shutdown.await;
    runner.cancel();
    if !runner.wait_idle(SHUTDOWN_GRACE).await {
        warn!("in-flight job did not stop within the grace period");
    }
    log.write(signal.log_message());
    sched.shutdown().await?;
    Ok(SchedulerExit::Stopped(signal))
}

/// Entry point behind `pickly schedule`. Startup failures are logged as `FATAL:` before returning.
pub async fn run_from_env(options: ScheduleOptions) -> Result<SchedulerExit, SchedulerError> {
    let (_, log_dir) = directories(|var| std::env::var(var).ok());
    let log = Arc::new(SchedulerLog::open(log_dir)?);
    run_logged(options, SchedulerConfig::from_env(), log).await
}

async fn run_logged(
    options: ScheduleOptions,
    config: Result<SchedulerConfig, SchedulerError>,
    log: Arc<SchedulerLog>,
) -> Result<SchedulerExit, SchedulerError> {
    let result = match config {
        Ok(config) => run_with_config(options, config, log.clone()).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        log.write(format!("FATAL: {err}"));
    }
    result
}

async fn run_with_config(
    options: ScheduleOptions,
    config: SchedulerConfig,
    log: Arc<SchedulerLog>,
) -> Result<SchedulerExit, SchedulerError> {
    println!("Schedule: {}", options.schedule);
    println!("Dry Run Mode: {}", if options.dry_run { "YES" } else { "NO" });
    validate_schedule(&options.schedule)?;

    let runner = Arc::new(JobRunner::new(
        config.collect,
        config.transform,
        Arc::new(ProcessRunner::new(config.workdir)),
        log.clone(),
        options.dry_run,
    ));

    if options.now {
        println!("Executing immediately (--now)");
        return Ok(run_immediate(&runner, &log, shutdown_signal()).await);
    }
    run_daemon(runner, log, &options.schedule, shutdown_signal()).await
}
