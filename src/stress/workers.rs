//! In-process load generators. Each one runs on a plain OS thread, checks the
//! shared [`StopSignal`] between bounded slices of work and returns a
//! [`WorkerOutcome`] when stopped, out of time or unable to continue.

use super::gpu_kernel::WgpuBackend;
use super::{StopSignal, WorkerKind, WorkerOutcome};
use std::hint::black_box;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MIB: usize = 1024 * 1024;
const CPU_SLICE: u32 = 10_000;
const MEMORY_PASS_PAUSE: Duration = Duration::from_millis(100);
const DISPATCH_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub memory_block_mb: usize,
    /// External program used instead of the built-in kernel.
    pub gpu_kernel_cmd: Option<String>,
    pub gpu_builtin_kernel: bool,
    /// Defaults to one thread per logical core.
    pub cpu_threads: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            memory_block_mb: 1024,
            gpu_kernel_cmd: None,
            gpu_builtin_kernel: true,
            cpu_threads: None,
        }
    }
}

/// Floating-point busy loop.
pub fn cpu_burn(stop: &StopSignal, deadline: Instant) -> WorkerOutcome {
    let mut x = 1.5f64;
    loop {
        for _ in 0..CPU_SLICE {
            x = black_box((x.sin() * x.cos()).abs().sqrt() + 1.0);
        }
        if stop.is_stopped() {
            return WorkerOutcome::Stopped;
        }
        if Instant::now() >= deadline {
            return WorkerOutcome::Completed;
        }
    }
}

/// Holds a `block_mb` buffer and keeps rewriting it in 1 MiB strides.
pub fn memory_churn(stop: &StopSignal, deadline: Instant, block_mb: usize) -> WorkerOutcome {
    let Some(bytes) = block_mb.checked_mul(MIB).filter(|b| *b > 0) else {
        return WorkerOutcome::Degraded(format!("invalid memory block size: {block_mb} MB"));
    };

    let mut block: Vec<u8> = Vec::new();
    if let Err(err) = block.try_reserve_exact(bytes) {
        warn!(block_mb, error = %err, "не удалось выделить блок памяти под нагрузку");
        return WorkerOutcome::Degraded(format!("allocation of {block_mb} MB failed"));
    }
    while block.len() < bytes {
        if stop.is_stopped() {
            return WorkerOutcome::Stopped;
        }
        let next = (block.len() + MIB).min(bytes);
        block.resize(next, 0xA5);
    }
    debug!(block_mb, "блок памяти под нагрузку выделен");

    let mut pass: u8 = 0;
    loop {
        pass = pass.wrapping_add(1);
        for chunk in block.chunks_mut(MIB) {
            if stop.is_stopped() {
                return WorkerOutcome::Stopped;
            }
            chunk.fill(pass);
            black_box(&chunk[0]);
        }
        if Instant::now() >= deadline {
            return WorkerOutcome::Completed;
        }
        if !pause(stop, deadline, MEMORY_PASS_PAUSE) {
            return WorkerOutcome::Stopped;
        }
    }
}

/// Sleeps in short steps; `false` when a stop was requested meanwhile.
fn pause(stop: &StopSignal, deadline: Instant, total: Duration) -> bool {
    let until = (Instant::now() + total).min(deadline);
    while Instant::now() < until {
        if stop.is_stopped() {
            return false;
        }
        thread::sleep(DISPATCH_POLL.min(until.saturating_duration_since(Instant::now())));
    }
    !stop.is_stopped()
}

/// Something able to run compute work on a GPU.
pub trait ComputeBackend: Send {
    fn name(&self) -> &str;

    /// Runs one unit of GPU work, returning early once `stop` is raised or
    /// `deadline` passes.
    fn dispatch(&mut self, stop: &StopSignal, deadline: Instant) -> Result<(), String>;
}

/// Runs an external compute program once per dispatch.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: String,
    args: Vec<String>,
}

impl CommandBackend {
    /// Splits a command line on whitespace; `None` when it is blank.
    pub fn parse(cmdline: &str) -> Option<Self> {
        let mut parts = cmdline.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl ComputeBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn dispatch(&mut self, stop: &StopSignal, deadline: Instant) -> Result<(), String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format!("failed to start {}: {err}", self.program))?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => return Err(format!("{} exited with {status}", self.program)),
                Ok(None) => {}
                Err(err) => return Err(format!("failed to wait for {}: {err}", self.program)),
            }
            if stop.is_stopped() || Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
            thread::sleep(DISPATCH_POLL);
        }
    }
}

/// Finds a usable compute backend, or the reason the GPU worker cannot run.
/// A configured command wins over the built-in kernel.
pub fn select_gpu_backend(opts: &LoadOptions) -> Result<Box<dyn ComputeBackend>, String> {
    if let Some(backend) = opts.gpu_kernel_cmd.as_deref().and_then(CommandBackend::parse) {
        return Ok(Box::new(backend));
    }
    if !opts.gpu_builtin_kernel {
        return Err("no GPU compute backend configured".to_string());
    }
    WgpuBackend::open().map(|b| Box::new(b) as Box<dyn ComputeBackend>)
}

/// Dispatches back to back until stopped or out of time.
pub fn gpu_load(stop: &StopSignal, deadline: Instant, backend: &mut dyn ComputeBackend) -> WorkerOutcome {
    debug!(backend = backend.name(), "GPU-нагрузка запущена");
    loop {
        if stop.is_stopped() {
            return WorkerOutcome::Stopped;
        }
        if Instant::now() >= deadline {
            return WorkerOutcome::Completed;
        }
        if let Err(reason) = backend.dispatch(stop, deadline) {
            warn!(%reason, "ошибка запуска GPU-ядра");
            return WorkerOutcome::Degraded(reason);
        }
    }
}

/// Starts the threads loading one worker kind. A thread that cannot be
/// spawned is reported in place of its handle.
pub fn spawn_load(
    kind: WorkerKind,
    deadline: Instant,
    stop: &StopSignal,
    opts: &LoadOptions,
) -> Vec<Result<JoinHandle<WorkerOutcome>, WorkerOutcome>> {
    let threads = match kind {
        WorkerKind::Cpu => opts
            .cpu_threads
            .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1),
        WorkerKind::Memory | WorkerKind::Gpu => 1,
    };

    (0..threads)
        .map(|i| {
            let stop = stop.clone();
            let opts = opts.clone();
            thread::Builder::new()
                .name(format!("stress-{}-{i}", kind.as_str()))
                .spawn(move || match kind {
                    WorkerKind::Cpu => cpu_burn(&stop, deadline),
                    WorkerKind::Memory => memory_churn(&stop, deadline, opts.memory_block_mb),
                    WorkerKind::Gpu => match select_gpu_backend(&opts) {
                        Ok(mut backend) => gpu_load(&stop, deadline, backend.as_mut()),
                        Err(reason) => WorkerOutcome::Unsupported(reason),
                    },
                })
                .map_err(|err| WorkerOutcome::Degraded(format!("failed to spawn thread: {err}")))
        })
        .collect()
}

/// Folds per-thread results of one kind into a single outcome. Any thread
/// that could not do its work makes the whole kind degraded.
pub fn merge_outcomes(outcomes: impl IntoIterator<Item = WorkerOutcome>) -> WorkerOutcome {
    let rank = |o: &WorkerOutcome| match o {
        WorkerOutcome::Completed => 0,
        WorkerOutcome::Stopped => 1,
        WorkerOutcome::Killed => 2,
        WorkerOutcome::Degraded(_) => 3,
        WorkerOutcome::Unsupported(_) => 4,
    };
    outcomes
        .into_iter()
        .max_by_key(rank)
        .unwrap_or(WorkerOutcome::Completed)
}
