//! Before/after diagnostic around one stress job.
//!
//! A session captures a snapshot, runs a single [`StressJob`], re-samples
//! the host while the job runs and captures again once every worker is
//! reaped. It aborts when a boundary capture has neither CPU nor GPU
//! telemetry; an abort before the job means the job never starts.

use crate::config::{StressConfig, MAX_RESAMPLE_INTERVAL_MS};
use crate::snapshot::{serialize_rfc3339, SnapshotAggregator, SystemSnapshot};
use crate::stress::{JobReport, StressError, StressJob, StressTarget, WorkerLauncher};
use crate::verdict::{Classifier, Verdict};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_RESAMPLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Created,
    CollectingBefore,
    Running,
    CollectingAfter,
    Completed,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::CollectingBefore => "collecting_before",
            SessionPhase::Running => "running",
            SessionPhase::CollectingAfter => "collecting_after",
            SessionPhase::Completed => "completed",
            SessionPhase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capture point at which a session can abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Before,
    After,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Boundary::Before => "до нагрузки",
            Boundary::After => "после нагрузки",
        })
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("сессия прервана: нет телеметрии CPU и GPU ({boundary})")]
    Aborted {
        boundary: Boundary,
        before: Option<SystemSnapshot>,
        job: Option<JobReport>,
    },

    #[error(transparent)]
    Stress(#[from] StressError),

    #[error("задача сессии завершилась аварийно")]
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionProgress {
    pub phase: SessionPhase,
    pub progress: u8,
    pub is_done: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerdictSample {
    #[serde(serialize_with = "serialize_rfc3339")]
    pub at: SystemTime,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub target: StressTarget,
    pub before_verdict: Verdict,
    pub after_verdict: Verdict,
    /// Worst verdict seen at either boundary or while the job ran.
    pub peak_verdict: Verdict,
    pub before: SystemSnapshot,
    pub after: SystemSnapshot,
    pub samples: Vec<VerdictSample>,
    pub job: JobReport,
}

pub type SessionOutcome = Result<SessionResult, SessionError>;

/// Everything a session needs from the rest of the program.
#[derive(Clone)]
pub struct SessionContext {
    pub aggregator: SnapshotAggregator,
    pub classifier: Arc<dyn Classifier>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub stress: StressConfig,
    pub resample_interval: Duration,
}

pub struct DiagnosticSession {
    ctx: SessionContext,
}

#[derive(Clone)]
struct SessionView {
    phase: SessionPhase,
    progress: u8,
    outcome: Option<Arc<SessionOutcome>>,
}

/// Handle to a running session. Dropping it cancels the stress job.
pub struct SessionHandle {
    view: watch::Receiver<SessionView>,
    cancel: watch::Sender<bool>,
}

impl DiagnosticSession {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Starts a session in the background. Must be called from within a
    /// tokio runtime.
    pub fn begin(&self, target: StressTarget, duration: Duration) -> SessionHandle {
        let (view_tx, view_rx) = watch::channel(SessionView {
            phase: SessionPhase::Created,
            progress: 0,
            outcome: None,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(run(self.ctx.clone(), target, duration, view_tx, cancel_rx));
        SessionHandle {
            view: view_rx,
            cancel: cancel_tx,
        }
    }
}

impl SessionHandle {
    pub fn poll(&self) -> SessionProgress {
        let view = self.view.borrow();
        SessionProgress {
            phase: view.phase,
            progress: view.progress,
            is_done: view.phase.is_terminal(),
        }
    }

    /// `None` until the session is done.
    pub fn result(&self) -> Option<Arc<SessionOutcome>> {
        self.view.borrow().outcome.clone()
    }

    /// Stops the stress job early. The after capture still happens.
    pub fn cancel(&self) {
        if self.cancel.send(true).is_err() {
            debug!("отмена после завершения сессии");
        }
    }

    /// Receiver that wakes on every phase or progress change.
    pub fn subscribe(&self) -> watch::Receiver<SessionProgress> {
        let (tx, rx) = watch::channel(self.poll());
        let mut view = self.view.clone();
        tokio::spawn(async move {
            while view.changed().await.is_ok() {
                let progress = {
                    let v = view.borrow_and_update();
                    SessionProgress {
                        phase: v.phase,
                        progress: v.progress,
                        is_done: v.phase.is_terminal(),
                    }
                };
                if tx.send(progress).is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub async fn wait(&self) -> Arc<SessionOutcome> {
        let mut view = self.view.clone();
        loop {
            if let Some(outcome) = view.borrow_and_update().outcome.clone() {
                return outcome;
            }
            if view.changed().await.is_err() {
                let last = view.borrow().outcome.clone();
                return last.unwrap_or_else(|| Arc::new(Err(SessionError::Interrupted)));
            }
        }
    }
}

fn set_phase(view: &watch::Sender<SessionView>, phase: SessionPhase, progress: u8) {
    view.send_modify(|v| {
        v.phase = phase;
        v.progress = progress;
    });
    debug!(%phase, progress, "фаза сессии");
}

async fn capture(aggregator: &SnapshotAggregator) -> Result<SystemSnapshot, SessionError> {
    let aggregator = aggregator.clone();
    tokio::task::spawn_blocking(move || aggregator.capture())
        .await
        .map_err(|err| {
            warn!(error = %err, "сбор снимка завершился аварийно");
            SessionError::Interrupted
        })
}

async fn run(
    ctx: SessionContext,
    target: StressTarget,
    duration: Duration,
    view: watch::Sender<SessionView>,
    mut cancel: watch::Receiver<bool>,
) {
    let outcome = drive(&ctx, target, duration, &view, &mut cancel).await;
    let phase = match &outcome {
        Ok(result) => {
            info!(
                %target,
                before = %result.before_verdict,
                after = %result.after_verdict,
                peak = %result.peak_verdict,
                job = result.job.state.as_str(),
                "диагностика завершена"
            );
            SessionPhase::Completed
        }
        Err(err) => {
            warn!(%target, error = %err, "диагностика прервана");
            SessionPhase::Aborted
        }
    };
    view.send_modify(|v| {
        v.phase = phase;
        v.progress = 100;
        v.outcome = Some(Arc::new(outcome));
    });
}

async fn drive(
    ctx: &SessionContext,
    target: StressTarget,
    duration: Duration,
    view: &watch::Sender<SessionView>,
    cancel: &mut watch::Receiver<bool>,
) -> SessionOutcome {
    set_phase(view, SessionPhase::CollectingBefore, 0);
    let before = capture(&ctx.aggregator).await?;
    if before.lacks_core_telemetry() {
        return Err(SessionError::Aborted {
            boundary: Boundary::Before,
            before: Some(before),
            job: None,
        });
    }
    let before_verdict = ctx.classifier.classify_snapshot(&before);
    info!(verdict = %before_verdict, "состояние до нагрузки");

    set_phase(view, SessionPhase::Running, 0);
    let job = StressJob::start(target, duration, Arc::clone(&ctx.launcher), &ctx.stress);
    let mut job_status = job.subscribe();
    let every = ctx
        .resample_interval
        .clamp(MIN_RESAMPLE_INTERVAL, Duration::from_millis(MAX_RESAMPLE_INTERVAL_MS));
    let mut resample = interval_at(Instant::now() + every, every);
    resample.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut samples = Vec::new();
    let mut cancel_open = true;

    while !job.is_done() {
        tokio::select! {
            changed = job_status.changed() => {
                if changed.is_err() {
                    break;
                }
                let progress = job_status.borrow_and_update().progress();
                view.send_if_modified(|v| {
                    let moved = v.progress != progress;
                    v.progress = progress;
                    moved
                });
            }
            _ = resample.tick() => {
                let snapshot = capture(&ctx.aggregator).await?;
                let verdict = ctx.classifier.classify_snapshot(&snapshot);
                debug!(%verdict, "промежуточный замер");
                samples.push(VerdictSample {
                    at: snapshot.captured_at(),
                    verdict,
                });
            }
            changed = cancel.changed(), if cancel_open => {
                let requested = match changed {
                    Ok(()) => *cancel.borrow_and_update(),
                    Err(_) => {
                        cancel_open = false;
                        true
                    }
                };
                if requested {
                    info!("сессия отменена, останавливаем нагрузку");
                    job.cancel();
                }
            }
        }
    }

    let report = job.wait().await?;

    set_phase(view, SessionPhase::CollectingAfter, 100);
    let after = capture(&ctx.aggregator).await?;
    if after.lacks_core_telemetry() {
        return Err(SessionError::Aborted {
            boundary: Boundary::After,
            before: Some(before),
            job: Some(report),
        });
    }
    let after_verdict = ctx.classifier.classify_snapshot(&after);
    info!(verdict = %after_verdict, "состояние после нагрузки");

    let peak_verdict = samples
        .iter()
        .map(|s| s.verdict)
        .chain([before_verdict, after_verdict])
        .max_by_key(|v| v.severity())
        .unwrap_or(after_verdict);

    Ok(SessionResult {
        target,
        before_verdict,
        after_verdict,
        peak_verdict,
        before,
        after,
        samples,
        job: report,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::collectors::testing::FixedSensors;
    use crate::collectors::{Metric, Reading, SensorSource, Subsystem};
    use crate::stress::{JobState, WorkerKind};
    use crate::verdict::RuleClassifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::process::Command;

    struct ShLauncher {
        script: String,
        launched: AtomicUsize,
    }

    impl ShLauncher {
        fn new(script: &str) -> Arc<Self> {
            Arc::new(Self {
                script: script.to_string(),
                launched: AtomicUsize::new(0),
            })
        }
    }

    impl WorkerLauncher for ShLauncher {
        fn command(&self, _kind: WorkerKind, _duration: Duration) -> Command {
            self.launched.fetch_add(1, Ordering::SeqCst);
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.script);
            cmd
        }
    }

    /// Serves `first` for the first `switch_after` reads, then `then`.
    struct SwitchingSensors {
        first: FixedSensors,
        then: FixedSensors,
        switch_after: usize,
        reads: AtomicUsize,
    }

    impl SensorSource for SwitchingSensors {
        fn read(&self, subsystem: Subsystem) -> Reading {
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.switch_after {
                self.first.read(subsystem)
            } else {
                self.then.read(subsystem)
            }
        }
    }

    const QUICK: &str = "sleep 0.3; echo PROGRESS:100%";
    const ENDLESS: &str =
        "trap 'echo PROGRESS:100%; exit 0' TERM; while :; do echo PROGRESS:5%; sleep 0.05; done";

    fn context(
        sensors: impl SensorSource + 'static,
        launcher: Arc<ShLauncher>,
        resample: Duration,
    ) -> SessionContext {
        SessionContext {
            aggregator: SnapshotAggregator::new(Arc::new(sensors), Duration::from_secs(1)),
            classifier: Arc::new(RuleClassifier::default()),
            launcher,
            stress: StressConfig {
                grace_period_ms: 1000,
                hard_timeout_secs: 10,
                ..StressConfig::default()
            },
            resample_interval: resample,
        }
    }

    async fn finished(handle: &SessionHandle) -> Arc<SessionOutcome> {
        tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("session finished")
    }

    #[tokio::test]
    async fn missing_cpu_and_gpu_aborts_before_any_job() {
        let launcher = ShLauncher::new(QUICK);
        let session = DiagnosticSession::new(context(
            FixedSensors::new().with(Subsystem::Ram, &[(Metric::UsagePercent, 30.0)]),
            Arc::clone(&launcher),
            Duration::from_millis(50),
        ));
        let handle = session.begin(StressTarget::All, Duration::from_secs(1));
        let outcome = finished(&handle).await;

        match outcome.as_ref() {
            Err(SessionError::Aborted { boundary, before, job }) => {
                assert_eq!(*boundary, Boundary::Before);
                assert!(before.is_some());
                assert!(job.is_none());
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 0);
        let p = handle.poll();
        assert_eq!(p.phase, SessionPhase::Aborted);
        assert!(p.is_done);
    }

    #[tokio::test]
    async fn after_capture_is_taken_once_the_job_is_over() {
        let session = DiagnosticSession::new(context(
            FixedSensors::healthy(),
            ShLauncher::new(QUICK),
            Duration::from_millis(50),
        ));
        let handle = session.begin(StressTarget::Cpu, Duration::from_secs(1));
        let outcome = finished(&handle).await;
        let result = outcome.as_ref().as_ref().expect("completed");

        assert!(result.before.captured_at() <= result.job.started_at);
        assert!(result.after.captured_at() > result.job.finished_at);
        assert_eq!(result.job.state, JobState::Completed);
        assert_eq!(result.before_verdict, Verdict::Normal);
        assert_eq!(result.after_verdict, Verdict::Normal);
        assert!(!result.samples.is_empty());
        assert_eq!(handle.poll().phase, SessionPhase::Completed);
        assert_eq!(handle.poll().progress, 100);
    }

    #[tokio::test]
    async fn oversized_resample_interval_is_capped() {
        let session = DiagnosticSession::new(context(
            FixedSensors::healthy(),
            ShLauncher::new(QUICK),
            Duration::MAX,
        ));
        let handle = session.begin(StressTarget::Cpu, Duration::from_secs(1));
        let outcome = finished(&handle).await;
        let result = outcome.as_ref().as_ref().expect("completed");

        assert_eq!(result.job.state, JobState::Completed);
        assert!(result.samples.is_empty());
    }

    #[tokio::test]
    async fn result_is_withheld_until_done_and_cancel_keeps_comparison() {
        let session = DiagnosticSession::new(context(
            FixedSensors::healthy(),
            ShLauncher::new(ENDLESS),
            Duration::from_secs(60),
        ));
        let handle = session.begin(StressTarget::Ram, Duration::from_secs(30));

        let mut progress = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            progress.wait_for(|p| p.phase == SessionPhase::Running && p.progress >= 5),
        )
        .await
        .expect("running")
        .expect("progress channel open");
        assert!(handle.result().is_none());
        assert!(!handle.poll().is_done);

        handle.cancel();
        let outcome = finished(&handle).await;
        let result = outcome.as_ref().as_ref().expect("completed after cancel");
        assert_eq!(result.job.state, JobState::Cancelled);
        assert!(result.after.captured_at() > result.job.finished_at);
        assert!(handle.result().is_some());
    }

    #[tokio::test]
    async fn gpu_alone_missing_does_not_abort() {
        let sensors = FixedSensors::new()
            .with(
                Subsystem::Cpu,
                &[(Metric::UsagePercent, 20.0), (Metric::TemperatureCelsius, 50.0)],
            )
            .with(Subsystem::Ram, &[(Metric::UsagePercent, 40.0)]);
        let session = DiagnosticSession::new(context(
            sensors,
            ShLauncher::new(QUICK),
            Duration::from_secs(60),
        ));
        let handle = session.begin(StressTarget::Cpu, Duration::from_secs(1));
        let outcome = finished(&handle).await;
        let result = outcome.as_ref().as_ref().expect("completed");
        assert_eq!(result.before_verdict, Verdict::Unknown);
    }

    #[tokio::test]
    async fn losing_telemetry_during_the_run_aborts_after_the_job() {
        let sensors = SwitchingSensors {
            first: FixedSensors::healthy(),
            then: FixedSensors::new(),
            switch_after: Subsystem::ALL.len(),
            reads: AtomicUsize::new(0),
        };
        let launcher = ShLauncher::new(QUICK);
        let session = DiagnosticSession::new(context(
            sensors,
            Arc::clone(&launcher),
            Duration::from_secs(60),
        ));
        let handle = session.begin(StressTarget::Cpu, Duration::from_secs(1));
        let outcome = finished(&handle).await;

        match outcome.as_ref() {
            Err(SessionError::Aborted { boundary, before, job }) => {
                assert_eq!(*boundary, Boundary::After);
                assert!(before.is_some());
                assert_eq!(job.as_ref().map(|j| j.state), Some(JobState::Completed));
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peak_verdict_is_the_worst_observed() {
        let hot = FixedSensors::new()
            .with(
                Subsystem::Cpu,
                &[(Metric::UsagePercent, 100.0), (Metric::TemperatureCelsius, 95.0)],
            )
            .with(
                Subsystem::Gpu,
                &[(Metric::UsagePercent, 10.0), (Metric::TemperatureCelsius, 40.0)],
            )
            .with(Subsystem::Ram, &[(Metric::UsagePercent, 90.0)])
            .with(Subsystem::Disk, &[(Metric::UsagePercent, 90.0)]);
        let sensors = SwitchingSensors {
            first: FixedSensors::healthy(),
            then: hot,
            switch_after: Subsystem::ALL.len(),
            reads: AtomicUsize::new(0),
        };
        let session = DiagnosticSession::new(context(
            sensors,
            ShLauncher::new(QUICK),
            Duration::from_millis(50),
        ));
        let handle = session.begin(StressTarget::Cpu, Duration::from_secs(1));
        let outcome = finished(&handle).await;
        let result = outcome.as_ref().as_ref().expect("completed");

        assert_eq!(result.before_verdict, Verdict::Normal);
        assert_eq!(result.after_verdict, Verdict::Critical);
        assert_eq!(result.peak_verdict, Verdict::Critical);
    }
}
