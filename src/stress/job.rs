//! Supervision of stress worker processes.
//!
//! Every worker kind runs as its own child process speaking the line protocol
//! from [`ProtocolLine`]. The supervisor reads progress off each child's
//! stdout, stops all of them on cancel or hard timeout (SIGTERM, then kill
//! after the grace period) and publishes a [`JobStatus`] through a watch
//! channel. The job reaches a terminal state only once every child is reaped.

use super::process::{ENV_GPU_BUILTIN, ENV_GPU_KERNEL_CMD, ENV_MEMORY_BLOCK_MB, ENV_PROGRESS_MS};
use super::{ProtocolLine, StressTarget, WorkerKind, WorkerOutcome, MAX_STRESS_DURATION};
use crate::config::StressConfig;
use crate::snapshot::serialize_rfc3339;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// How long to keep reading a child's stdout after it exited.
const STDOUT_DRAIN: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StressError {
    #[error("не удалось определить путь к исполняемому файлу: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("задача стресс-теста завершилась аварийно: {0}")]
    Supervisor(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    /// Stopped by the hard timeout; a completed job for reporting purposes.
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub kind: WorkerKind,
    /// Latest reported percentage; never decreases.
    pub progress: u8,
    pub outcome: Option<WorkerOutcome>,
}

impl WorkerStatus {
    fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            progress: 0,
            outcome: None,
        }
    }

    fn advance(&mut self, percent: u8) {
        self.progress = self.progress.max(percent.min(100));
    }

    fn finish(&mut self, outcome: WorkerOutcome) {
        self.outcome.get_or_insert(outcome);
        self.progress = 100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    pub workers: Vec<WorkerStatus>,
}

impl JobStatus {
    fn new(target: StressTarget) -> Self {
        Self {
            state: JobState::Idle,
            workers: target.workers().iter().copied().map(WorkerStatus::new).collect(),
        }
    }

    /// Slowest worker's percentage; 100 once the job is over.
    pub fn progress(&self) -> u8 {
        if self.state.is_terminal() {
            return 100;
        }
        self.workers.iter().map(|w| w.progress).min().unwrap_or(0)
    }

    pub fn is_done(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub target: StressTarget,
    pub state: JobState,
    pub workers: Vec<WorkerStatus>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub started_at: SystemTime,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub finished_at: SystemTime,
}

impl JobReport {
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .duration_since(self.started_at)
            .unwrap_or_default()
    }

    pub fn is_degraded(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.outcome.as_ref().is_some_and(WorkerOutcome::is_degraded))
    }
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&humantime::format_duration(*d))
}

/// Builds the process that runs one worker kind. The child must print the
/// progress protocol on stdout and exit soon after SIGTERM.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, kind: WorkerKind, duration: Duration) -> Command;
}

/// Launches workers as `<program> [--config <path>] stress-<kind> <secs>`,
/// normally this binary.
#[derive(Debug, Clone)]
pub struct SelfExeLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    memory_block_mb: usize,
    gpu_kernel_cmd: Option<String>,
    gpu_builtin_kernel: bool,
    progress_interval: Duration,
}

impl SelfExeLauncher {
    pub fn new(program: impl Into<PathBuf>, cfg: &StressConfig) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            memory_block_mb: cfg.memory_block_mb,
            gpu_kernel_cmd: cfg.gpu_kernel_cmd.clone(),
            gpu_builtin_kernel: cfg.gpu_builtin_kernel,
            progress_interval: cfg.progress_interval(),
        }
    }

    pub fn current(cfg: &StressConfig) -> Result<Self, StressError> {
        let program = std::env::current_exe().map_err(StressError::CurrentExe)?;
        Ok(Self::new(program, cfg))
    }

    /// Config file the workers load, so they see the same settings as the caller.
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

impl WorkerLauncher for SelfExeLauncher {
    fn command(&self, kind: WorkerKind, duration: Duration) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg(kind.subcommand())
            .arg(duration.as_secs().max(1).to_string())
            .env(ENV_MEMORY_BLOCK_MB, self.memory_block_mb.to_string())
            .env(ENV_GPU_BUILTIN, if self.gpu_builtin_kernel { "1" } else { "0" })
            .env(
                ENV_PROGRESS_MS,
                self.progress_interval.as_millis().to_string(),
            );
        if let Some(kernel) = &self.gpu_kernel_cmd {
            cmd.env(ENV_GPU_KERNEL_CMD, kernel);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    grace: Duration,
    hard_timeout: Duration,
}

/// Handle to a running stress job.
pub struct StressJob {
    target: StressTarget,
    status: watch::Receiver<JobStatus>,
    cancel: watch::Sender<bool>,
    supervisor: JoinHandle<JobReport>,
}

impl StressJob {
    /// Spawns one worker process per kind of `target` and starts supervising
    /// them. Must be called from within a tokio runtime.
    pub fn start(
        target: StressTarget,
        duration: Duration,
        launcher: Arc<dyn WorkerLauncher>,
        cfg: &StressConfig,
    ) -> Self {
        let duration = duration.min(MAX_STRESS_DURATION);
        let (status_tx, status_rx) = watch::channel(JobStatus::new(target));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let limits = Limits {
            grace: cfg.grace_period(),
            hard_timeout: cfg.hard_timeout(),
        };
        let supervisor = tokio::spawn(supervise(
            target,
            duration,
            launcher,
            limits,
            Arc::new(status_tx),
            cancel_rx,
        ));
        Self {
            target,
            status: status_rx,
            cancel: cancel_tx,
            supervisor,
        }
    }

    pub fn target(&self) -> StressTarget {
        self.target
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn progress(&self) -> u8 {
        self.status.borrow().progress()
    }

    pub fn is_done(&self) -> bool {
        self.status.borrow().is_done()
    }

    /// Receiver that wakes on every status change.
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Asks every worker to stop. Idempotent; a no-op once the job is done.
    pub fn cancel(&self) {
        if self.cancel.send(true).is_err() {
            debug!("отмена после завершения стресс-теста");
        }
    }

    /// Waits until every worker is reaped.
    pub async fn wait(self) -> Result<JobReport, StressError> {
        let StressJob {
            cancel, supervisor, ..
        } = self;
        let report = supervisor
            .await
            .map_err(|err| StressError::Supervisor(err.to_string()));
        drop(cancel);
        report
    }
}

async fn supervise(
    target: StressTarget,
    duration: Duration,
    launcher: Arc<dyn WorkerLauncher>,
    limits: Limits,
    status: Arc<watch::Sender<JobStatus>>,
    mut cancel: watch::Receiver<bool>,
) -> JobReport {
    let started_at = SystemTime::now();
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    for &kind in target.workers() {
        let mut cmd = launcher.command(kind, duration);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        // Terminal signals go to the foreground group only; workers are stopped by us.
        #[cfg(unix)]
        cmd.process_group(0);
        match cmd.spawn() {
            Ok(child) => {
                debug!(worker = %kind, pid = ?child.id(), "процесс нагрузки запущен");
                workers.spawn(watch_worker(
                    kind,
                    child,
                    stop_rx.clone(),
                    limits.grace,
                    Arc::clone(&status),
                ));
            }
            Err(err) => {
                warn!(worker = %kind, error = %err, "не удалось запустить процесс нагрузки");
                update_worker(&status, kind, |w| {
                    w.finish(WorkerOutcome::Degraded(format!("failed to spawn worker: {err}")))
                });
            }
        }
    }
    status.send_modify(|s| s.state = JobState::Running);
    info!(
        %target,
        duration = %humantime::format_duration(duration),
        "стресс-тест запущен"
    );

    let hard_timeout = tokio::time::sleep(limits.hard_timeout);
    tokio::pin!(hard_timeout);
    let mut stop_reason: Option<JobState> = None;

    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(err)) => warn!(error = %err, "задача наблюдения за воркером завершилась аварийно"),
                None => break,
            },
            _ = &mut hard_timeout, if stop_reason.is_none() => {
                warn!(
                    timeout = %humantime::format_duration(limits.hard_timeout),
                    "превышен жёсткий таймаут, останавливаем воркеры"
                );
                stop_reason = Some(JobState::TimedOut);
                let _ = stop_tx.send(true);
            }
            changed = cancel.changed(), if stop_reason.is_none() => {
                if changed.is_err() || *cancel.borrow_and_update() {
                    info!("стресс-тест отменён");
                    stop_reason = Some(JobState::Cancelled);
                    let _ = stop_tx.send(true);
                }
            }
        }
    }

    let state = stop_reason.unwrap_or(JobState::Completed);
    let finished_at = SystemTime::now();
    status.send_modify(|s| {
        for w in &mut s.workers {
            w.finish(WorkerOutcome::Degraded("worker supervision failed".to_string()));
        }
        s.state = state;
    });

    let report = JobReport {
        target,
        state,
        workers: status.borrow().workers.clone(),
        duration,
        started_at,
        finished_at,
    };
    info!(
        %target,
        state = state.as_str(),
        elapsed = %humantime::format_duration(report.elapsed()),
        degraded = report.is_degraded(),
        "стресс-тест завершён"
    );
    report
}

fn update_worker(
    status: &watch::Sender<JobStatus>,
    kind: WorkerKind,
    f: impl FnOnce(&mut WorkerStatus),
) {
    status.send_if_modified(|s| match s.workers.iter_mut().find(|w| w.kind == kind) {
        Some(w) => {
            let before = w.clone();
            f(w);
            *w != before
        }
        None => false,
    });
}

enum Exit {
    Natural(std::io::Result<ExitStatus>),
    Stopped,
    Killed,
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(l) => l.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn apply_line(
    kind: WorkerKind,
    line: &str,
    status: &watch::Sender<JobStatus>,
    reported: &mut Option<WorkerOutcome>,
) {
    let Some(parsed) = ProtocolLine::parse(line) else {
        return;
    };
    if parsed.kind().is_some_and(|k| k != kind) {
        return;
    }
    match parsed {
        ProtocolLine::Progress { percent, .. } => update_worker(status, kind, |w| w.advance(percent)),
        ProtocolLine::Degraded { reason, .. } => {
            warn!(worker = %kind, %reason, "воркер работает в деградированном режиме");
            *reported = Some(WorkerOutcome::Degraded(reason));
        }
        ProtocolLine::Unsupported { reason, .. } => {
            info!(worker = %kind, %reason, "нагрузка не поддерживается на этом хосте");
            *reported = Some(WorkerOutcome::Unsupported(reason));
        }
        ProtocolLine::Stopped { reason, .. } => {
            info!(worker = %kind, %reason, "воркер остановлен до окончания нагрузки");
            *reported = Some(WorkerOutcome::Stopped);
        }
    }
}

async fn watch_worker(
    kind: WorkerKind,
    mut child: Child,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    status: Arc<watch::Sender<JobStatus>>,
) {
    let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());
    let mut reported: Option<WorkerOutcome> = None;

    let exit = loop {
        tokio::select! {
            line = next_line(&mut lines) => match line {
                Some(line) => apply_line(kind, &line, &status, &mut reported),
                None => lines = None,
            },
            waited = child.wait() => break Exit::Natural(waited),
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow_and_update() {
                    break if terminate(kind, &mut child, grace).await {
                        Exit::Killed
                    } else {
                        Exit::Stopped
                    };
                }
            }
        }
    };

    if let Some(mut rest) = lines.take() {
        let drain = async {
            while let Ok(Some(line)) = rest.next_line().await {
                apply_line(kind, &line, &status, &mut reported);
            }
        };
        if tokio::time::timeout(STDOUT_DRAIN, drain).await.is_err() {
            debug!(worker = %kind, "stdout воркера не закрыт после выхода");
        }
    }

    let outcome = match (exit, reported) {
        (Exit::Killed, _) => WorkerOutcome::Killed,
        (_, Some(reported)) => reported,
        (Exit::Stopped, None) => WorkerOutcome::Stopped,
        (Exit::Natural(Ok(code)), None) if code.success() => WorkerOutcome::Completed,
        (Exit::Natural(Ok(code)), None) => {
            WorkerOutcome::Degraded(format!("worker exited with {code}"))
        }
        (Exit::Natural(Err(err)), None) => {
            WorkerOutcome::Degraded(format!("failed to wait for worker: {err}"))
        }
    };
    debug!(worker = %kind, ?outcome, "воркер завершён");
    update_worker(&status, kind, |w| w.finish(outcome));
}

/// SIGTERM, then kill once `grace` runs out. `true` when the kill was needed.
async fn terminate(kind: WorkerKind, child: &mut Child, grace: Duration) -> bool {
    request_stop(child);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return false;
    }
    warn!(
        worker = %kind,
        grace = %humantime::format_duration(grace),
        "воркер не завершился вовремя, принудительная остановка"
    );
    if let Err(err) = child.kill().await {
        warn!(worker = %kind, error = %err, "не удалось завершить процесс воркера");
    }
    true
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet (`id()`
    // returns `None` after that), so it cannot name an unrelated process.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM не доставлен");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}
