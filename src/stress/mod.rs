pub mod job;
pub mod gpu_kernel;
pub mod process;
pub mod workers;

use crate::config::MAX_STRESS_SECS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use job::{JobReport, JobState, JobStatus, SelfExeLauncher, StressError, StressJob, WorkerLauncher};

/// Longer stress requests are cut to this.
pub const MAX_STRESS_DURATION: Duration = Duration::from_secs(MAX_STRESS_SECS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    Cpu,
    Memory,
    Gpu,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 3] = [WorkerKind::Cpu, WorkerKind::Memory, WorkerKind::Gpu];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerKind::Cpu => "cpu",
            WorkerKind::Memory => "memory",
            WorkerKind::Gpu => "gpu",
        }
    }

    /// Prefix of this kind's lines in the progress protocol.
    pub fn line_prefix(self) -> &'static str {
        match self {
            WorkerKind::Cpu => "CPU",
            WorkerKind::Memory => "MEM",
            WorkerKind::Gpu => "GPU",
        }
    }

    /// CLI subcommand running this kind as a standalone process.
    pub fn subcommand(self) -> &'static str {
        match self {
            WorkerKind::Cpu => "stress-cpu",
            WorkerKind::Memory => "stress-mem",
            WorkerKind::Gpu => "stress-gpu",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        WorkerKind::ALL.into_iter().find(|k| k.line_prefix() == prefix)
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StressTarget {
    Cpu,
    Ram,
    Gpu,
    All,
}

impl StressTarget {
    pub fn workers(self) -> &'static [WorkerKind] {
        match self {
            StressTarget::Cpu => &[WorkerKind::Cpu],
            StressTarget::Ram => &[WorkerKind::Memory],
            StressTarget::Gpu => &[WorkerKind::Gpu],
            StressTarget::All => &WorkerKind::ALL,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StressTarget::Cpu => "cpu",
            StressTarget::Ram => "ram",
            StressTarget::Gpu => "gpu",
            StressTarget::All => "all",
        }
    }
}

impl fmt::Display for StressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Ran for the whole duration.
    Completed,
    /// Exited cooperatively after a stop request or termination signal.
    Stopped,
    /// Could not hold its resource (allocation, spawn) and exited early.
    Degraded(String),
    /// No device or backend to load; nothing was run.
    Unsupported(String),
    /// Ignored the stop request past the grace period and was killed.
    Killed,
}

impl WorkerOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, WorkerOutcome::Degraded(_) | WorkerOutcome::Unsupported(_))
    }
}

/// Shared stop flag observed by every worker loop.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Percentage that never moves backwards.
#[derive(Debug, Default)]
pub struct ProgressCounter(AtomicU8);

impl ProgressCounter {
    pub fn advance(&self, percent: u8) -> u8 {
        let percent = percent.min(100);
        self.0.fetch_max(percent, Ordering::AcqRel).max(percent)
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// `elapsed / duration` as a percentage clamped to 0..=100.
pub fn progress_percent(elapsed: Duration, duration: Duration) -> u8 {
    if duration.is_zero() {
        return 100;
    }
    let ratio = elapsed.as_secs_f64() / duration.as_secs_f64();
    (ratio * 100.0).clamp(0.0, 100.0) as u8
}

/// One line of the stress process stdout protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolLine {
    Progress {
        kind: Option<WorkerKind>,
        percent: u8,
    },
    Degraded {
        kind: Option<WorkerKind>,
        reason: String,
    },
    Unsupported {
        kind: Option<WorkerKind>,
        reason: String,
    },
    /// Ended early by a termination signal rather than by running out of time.
    Stopped {
        kind: Option<WorkerKind>,
        reason: String,
    },
}

impl ProtocolLine {
    pub fn progress(kind: Option<WorkerKind>, percent: u8) -> Self {
        ProtocolLine::Progress {
            kind,
            percent: percent.min(100),
        }
    }

    /// Accepts `[<KIND>_]PROGRESS:<n>%` and the `DEGRADED`, `UNSUPPORTED` and
    /// `STOPPED` condition lines, each `[<KIND>_]<TAG>:<reason>`; anything else is `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let (tag, value) = line.trim().split_once(':')?;
        let (kind, tag) = match tag.split_once('_') {
            Some((prefix, rest)) => (Some(WorkerKind::from_prefix(prefix)?), rest),
            None => (None, tag),
        };
        match tag {
            "PROGRESS" => {
                let n: u16 = value.trim().trim_end_matches('%').trim().parse().ok()?;
                Some(Self::progress(kind, n.min(100) as u8))
            }
            "DEGRADED" => Some(ProtocolLine::Degraded {
                kind,
                reason: value.trim().to_string(),
            }),
            "UNSUPPORTED" => Some(ProtocolLine::Unsupported {
                kind,
                reason: value.trim().to_string(),
            }),
            "STOPPED" => Some(ProtocolLine::Stopped {
                kind,
                reason: value.trim().to_string(),
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<WorkerKind> {
        match self {
            ProtocolLine::Progress { kind, .. }
            | ProtocolLine::Degraded { kind, .. }
            | ProtocolLine::Unsupported { kind, .. }
            | ProtocolLine::Stopped { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for ProtocolLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = |kind: &Option<WorkerKind>| match kind {
            Some(k) => format!("{}_", k.line_prefix()),
            None => String::new(),
        };
        match self {
            ProtocolLine::Progress { kind, percent } => {
                write!(f, "{}PROGRESS:{}%", prefix(kind), percent)
            }
            ProtocolLine::Degraded { kind, reason } => {
                write!(f, "{}DEGRADED:{}", prefix(kind), reason)
            }
            ProtocolLine::Unsupported { kind, reason } => {
                write!(f, "{}UNSUPPORTED:{}", prefix(kind), reason)
            }
            ProtocolLine::Stopped { kind, reason } => {
                write!(f, "{}STOPPED:{}", prefix(kind), reason)
            }
        }
    }
}
