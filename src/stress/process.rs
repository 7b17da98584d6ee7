//! Body of the `stress-*` subcommands: runs worker threads for a fixed
//! duration and reports progress on stdout, one protocol line at a time.

use super::workers::{merge_outcomes, spawn_load, LoadOptions};
use super::{
    progress_percent, ProgressCounter, ProtocolLine, StopSignal, WorkerKind, WorkerOutcome,
    MAX_STRESS_DURATION,
};
use crate::config::StressConfig;
use std::future::Future;
use std::io::Write;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

pub const ENV_MEMORY_BLOCK_MB: &str = "HWPULSE_MEM_BLOCK_MB";
pub const ENV_GPU_KERNEL_CMD: &str = "HWPULSE_GPU_KERNEL_CMD";
pub const ENV_GPU_BUILTIN: &str = "HWPULSE_GPU_BUILTIN";
pub const ENV_PROGRESS_MS: &str = "HWPULSE_PROGRESS_MS";

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub load: LoadOptions,
    pub report_interval: Duration,
}

impl ProcessOptions {
    pub fn from_config(cfg: &StressConfig) -> Self {
        Self {
            load: LoadOptions {
                memory_block_mb: cfg.memory_block_mb,
                gpu_kernel_cmd: cfg.gpu_kernel_cmd.clone(),
                gpu_builtin_kernel: cfg.gpu_builtin_kernel,
                cpu_threads: None,
            },
            report_interval: cfg.progress_interval(),
        }
    }

    /// Applies the values the orchestrator passes through the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(ENV_MEMORY_BLOCK_MB) {
            match raw.trim().parse::<usize>() {
                Ok(mb) if mb > 0 => self.load.memory_block_mb = mb,
                _ => warn!(var = ENV_MEMORY_BLOCK_MB, value = %raw, "некорректное значение переменной окружения проигнорировано"),
            }
        }
        if let Ok(cmd) = std::env::var(ENV_GPU_KERNEL_CMD) {
            if !cmd.trim().is_empty() {
                self.load.gpu_kernel_cmd = Some(cmd);
            }
        }
        if let Ok(raw) = std::env::var(ENV_GPU_BUILTIN) {
            match raw.trim() {
                "1" | "true" => self.load.gpu_builtin_kernel = true,
                "0" | "false" => self.load.gpu_builtin_kernel = false,
                _ => warn!(var = ENV_GPU_BUILTIN, value = %raw, "некорректное значение переменной окружения проигнорировано"),
            }
        }
        if let Ok(raw) = std::env::var(ENV_PROGRESS_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if (1..=1000).contains(&ms) => {
                    self.report_interval = Duration::from_millis(ms)
                }
                _ => warn!(var = ENV_PROGRESS_MS, value = %raw, "некорректное значение переменной окружения проигнорировано"),
            }
        }
        self
    }
}

#[derive(Debug)]
pub struct ProcessSummary {
    pub outcomes: Vec<(WorkerKind, WorkerOutcome)>,
    /// Ended by `shutdown` rather than by the duration running out.
    pub interrupted: bool,
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere). Handlers are installed
/// before this returns, so a signal arriving early is not lost.
pub fn termination_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, Signal, SignalKind};

        let install = |name: &str, kind: SignalKind| match signal(kind) {
            Ok(s) => Some(s),
            Err(err) => {
                warn!(signal = name, error = %err, "не удалось установить обработчик сигнала");
                None
            }
        };
        async fn recv(s: Option<Signal>) {
            match s {
                Some(mut s) => {
                    s.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        }

        let term = install("SIGTERM", SignalKind::terminate());
        let int = install("SIGINT", SignalKind::interrupt());
        async move {
            tokio::select! {
                _ = recv(term) => {}
                _ = recv(int) => {}
            }
        }
    }
    #[cfg(not(unix))]
    async move {
        let _ = tokio::signal::ctrl_c().await;
    }
}

struct KindRun {
    kind: WorkerKind,
    handles: Vec<Result<JoinHandle<WorkerOutcome>, WorkerOutcome>>,
    progress: ProgressCounter,
}

impl KindRun {
    fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| match h {
            Ok(handle) => handle.is_finished(),
            Err(_) => true,
        })
    }
}

fn emit<W: Write>(out: &mut W, line: &ProtocolLine) {
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Loads `kinds` until `duration` elapses or `shutdown` resolves, printing
/// progress every `report_interval`. Always ends with `PROGRESS:100%`.
pub async fn run_stress_process<W, F>(
    kinds: &[WorkerKind],
    duration: Duration,
    opts: ProcessOptions,
    mut out: W,
    shutdown: F,
) -> ProcessSummary
where
    W: Write,
    F: Future<Output = ()>,
{
    let duration = duration.min(MAX_STRESS_DURATION);
    let started = Instant::now();
    let deadline = started + duration;
    let stop = StopSignal::new();
    info!(
        workers = ?kinds,
        duration = %humantime::format_duration(duration),
        "нагрузка запущена"
    );

    let runs: Vec<KindRun> = kinds
        .iter()
        .map(|&kind| KindRun {
            kind,
            handles: spawn_load(kind, deadline, &stop, &opts.load),
            progress: ProgressCounter::default(),
        })
        .collect();

    let mut ticker = interval(opts.report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("получен сигнал завершения, останавливаем нагрузку");
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {
                let elapsed_pct = progress_percent(started.elapsed(), duration);
                let mut overall = 100u8;
                for run in &runs {
                    let pct = if run.is_finished() { 100 } else { elapsed_pct };
                    let pct = run.progress.advance(pct);
                    overall = overall.min(pct);
                    emit(&mut out, &ProtocolLine::progress(Some(run.kind), pct));
                }
                emit(&mut out, &ProtocolLine::progress(None, overall));
                if runs.iter().all(KindRun::is_finished) {
                    break;
                }
            }
        }
    }

    stop.stop();
    let joined = tokio::task::spawn_blocking(move || {
        runs.into_iter()
            .map(|run| {
                let outcomes = run.handles.into_iter().map(|h| match h {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        WorkerOutcome::Degraded("worker thread panicked".to_string())
                    }),
                    Err(outcome) => outcome,
                });
                (run.kind, merge_outcomes(outcomes))
            })
            .collect::<Vec<_>>()
    })
    .await;

    let outcomes = match joined {
        Ok(outcomes) => outcomes,
        Err(err) => {
            warn!(error = %err, "не удалось дождаться потоков нагрузки");
            kinds
                .iter()
                .map(|&k| (k, WorkerOutcome::Degraded("worker threads lost".to_string())))
                .collect()
        }
    };

    for (kind, outcome) in &outcomes {
        match outcome {
            WorkerOutcome::Degraded(reason) => emit(
                &mut out,
                &ProtocolLine::Degraded {
                    kind: Some(*kind),
                    reason: reason.clone(),
                },
            ),
            WorkerOutcome::Unsupported(reason) => emit(
                &mut out,
                &ProtocolLine::Unsupported {
                    kind: Some(*kind),
                    reason: reason.clone(),
                },
            ),
            WorkerOutcome::Stopped if interrupted => emit(
                &mut out,
                &ProtocolLine::Stopped {
                    kind: Some(*kind),
                    reason: "signal".to_string(),
                },
            ),
            _ => {}
        }
        emit(&mut out, &ProtocolLine::progress(Some(*kind), 100));
    }
    emit(&mut out, &ProtocolLine::progress(None, 100));

    info!(?outcomes, interrupted, "нагрузка завершена");
    ProcessSummary {
        outcomes,
        interrupted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ProcessOptions {
        ProcessOptions {
            load: LoadOptions {
                memory_block_mb: 4,
                gpu_kernel_cmd: None,
                gpu_builtin_kernel: false,
                cpu_threads: Some(1),
            },
            report_interval: Duration::from_millis(50),
        }
    }

    fn lines(out: &[u8]) -> Vec<ProtocolLine> {
        String::from_utf8_lossy(out)
            .lines()
            .filter_map(ProtocolLine::parse)
            .collect()
    }

    #[tokio::test]
    async fn short_run_reports_monotonic_progress_and_finishes_at_100() {
        let mut out = Vec::new();
        let summary = run_stress_process(
            &[WorkerKind::Cpu],
            Duration::from_millis(400),
            opts(),
            &mut out,
            std::future::pending::<()>(),
        )
        .await;

        assert!(!summary.interrupted);
        assert_eq!(summary.outcomes, vec![(WorkerKind::Cpu, WorkerOutcome::Completed)]);

        let parsed = lines(&out);
        assert!(!parsed.iter().any(|l| matches!(l, ProtocolLine::Stopped { .. })));
        let cpu: Vec<u8> = parsed
            .iter()
            .filter_map(|l| match l {
                ProtocolLine::Progress { kind: Some(WorkerKind::Cpu), percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(cpu.len() >= 3, "{cpu:?}");
        assert!(cpu.windows(2).all(|w| w[0] <= w[1]), "{cpu:?}");
        assert_eq!(parsed.last(), Some(&ProtocolLine::progress(None, 100)));
    }

    #[tokio::test]
    async fn shutdown_stops_workers_and_flushes_final_line() {
        let mut out = Vec::new();
        let started = Instant::now();
        let summary = run_stress_process(
            &[WorkerKind::Cpu, WorkerKind::Memory],
            Duration::from_secs(30),
            opts(),
            &mut out,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert!(summary.interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
        for (_, outcome) in &summary.outcomes {
            assert_eq!(outcome, &WorkerOutcome::Stopped);
        }
        let parsed = lines(&out);
        for kind in [WorkerKind::Cpu, WorkerKind::Memory] {
            assert!(parsed.contains(&ProtocolLine::Stopped {
                kind: Some(kind),
                reason: "signal".to_string()
            }));
        }
        assert_eq!(parsed.last(), Some(&ProtocolLine::progress(None, 100)));
    }

    #[tokio::test]
    async fn oversized_duration_is_capped_instead_of_overflowing() {
        let mut out = Vec::new();
        let summary = run_stress_process(
            &[WorkerKind::Cpu],
            Duration::from_secs(u64::MAX / 2),
            opts(),
            &mut out,
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;

        assert!(summary.interrupted);
        assert_eq!(summary.outcomes, vec![(WorkerKind::Cpu, WorkerOutcome::Stopped)]);
        assert_eq!(lines(&out).last(), Some(&ProtocolLine::progress(None, 100)));
    }

    #[tokio::test]
    async fn failed_allocation_is_reported_as_degraded() {
        let mut out = Vec::new();
        let mut o = opts();
        o.load.memory_block_mb = usize::MAX / (1024 * 1024);
        let summary = run_stress_process(
            &[WorkerKind::Memory],
            Duration::from_secs(30),
            o,
            &mut out,
            std::future::pending::<()>(),
        )
        .await;

        assert!(summary.outcomes[0].1.is_degraded());
        assert!(lines(&out).iter().any(|l| matches!(
            l,
            ProtocolLine::Degraded { kind: Some(WorkerKind::Memory), .. }
        )));
    }

    #[tokio::test]
    async fn gpu_without_backend_ends_early_as_unsupported() {
        let mut out = Vec::new();
        let started = Instant::now();
        let summary = run_stress_process(
            &[WorkerKind::Gpu],
            Duration::from_secs(30),
            opts(),
            &mut out,
            std::future::pending::<()>(),
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(summary.outcomes[0].1, WorkerOutcome::Unsupported(_)));
        let parsed = lines(&out);
        assert!(parsed.iter().any(|l| matches!(l, ProtocolLine::Unsupported { .. })));
        assert_eq!(parsed.last(), Some(&ProtocolLine::progress(None, 100)));
    }
}
